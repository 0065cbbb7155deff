use thiserror::Error;

/// Fatal configuration problems detected while loading metric, transform and
/// api-call definitions. The engine refuses to start when any of these occur.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Duplicate {kind} id: {id}")]
    DuplicateId { kind: &'static str, id: String },

    #[error("Metric {metric}: source kind {kind} does not match populated fields ({detail})")]
    SourceMismatch {
        metric: String,
        kind: String,
        detail: String,
    },

    #[error("Metric {metric} references unknown metric {target}")]
    UnknownMetric { metric: String, target: String },

    #[error("Metric {metric} references unknown transform {transform}")]
    UnknownTransform { metric: String, transform: String },

    #[error("Transform {0} is declared but has no implementation")]
    UnimplementedTransform(String),

    #[error("Metric {metric}: malformed params for {transform}: {detail}")]
    MalformedParams {
        metric: String,
        transform: String,
        detail: String,
    },

    #[error("Metric {metric} references unknown api call {call}")]
    UnknownApiCall { metric: String, call: String },

    #[error("Metric {metric}: cannot parse expression: {detail}")]
    ExpressionParse { metric: String, detail: String },

    #[error("Metric {metric}: expression references unknown identifier {ident}")]
    UnknownIdentifier { metric: String, ident: String },

    #[error("Dependency cycle: {0}")]
    Cycle(String),

    #[error("No metrics defined for domain {0}")]
    UnknownDomain(String),

    #[error("Invalid valuation config: {0}")]
    Valuation(String),

    #[error("Cannot read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot parse config: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures raised by a provider while fetching one raw response.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Rate limited after {0} attempts")]
    RateLimited(u32),

    #[error("Request timed out after {0}s")]
    Timeout(u64),

    #[error("Cannot decode response: {0}")]
    Decode(String),

    #[error("Unknown api call: {0}")]
    UnknownCall(String),
}

impl ProviderError {
    /// Whether a retry has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Http(_) | ProviderError::RateLimited(_) | ProviderError::Timeout(_) => true,
            ProviderError::Status { status, .. } => *status == 429 || *status >= 500,
            ProviderError::Decode(_) | ProviderError::UnknownCall(_) => false,
        }
    }
}
