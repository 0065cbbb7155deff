use crate::ProviderError;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Substitution values for an api call template (`ticker`, `from`, `to`)
pub type CallParams = BTreeMap<String, String>;

/// Upstream data provider.
///
/// `Ok(None)` means the provider has no data for the request; errors are
/// reserved for transport-level failures the caller may degrade to "no data".
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn fetch(
        &self,
        call_id: &str,
        params: &CallParams,
    ) -> Result<Option<serde_json::Value>, ProviderError>;
}
