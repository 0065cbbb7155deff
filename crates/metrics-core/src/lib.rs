pub mod definitions;
pub mod error;
pub mod stats;
pub mod traits;
pub mod types;
pub mod values;

pub use definitions::*;
pub use error::*;
pub use traits::*;
pub use types::*;
pub use values::*;
