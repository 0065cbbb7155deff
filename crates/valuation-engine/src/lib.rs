pub mod consensus;
pub mod sector;

pub use consensus::{summarize, ConsensusTargetSummary, WindowStat};
pub use sector::{disparity, Position, RatioFairValue, SectorAverage, SectorValuationEngine, TickerMetrics, ValuationOutcome};
