use polygon_client::PolygonConfig;

pub const DEFAULT_CONFIG_PATH: &str = "metrics.json";
pub const DEFAULT_DATABASE_URL: &str = "sqlite:metrics.db?mode=rwc";
pub const DEFAULT_CONCURRENCY: usize = 8;
/// Days of history requested before the earliest event of a ticker
pub const DEFAULT_HISTORY_DAYS: i64 = 730;

/// Everything a batch run reads from the environment
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub metric_config_path: String,
    pub database_url: String,
    pub concurrency: usize,
    pub history_days: i64,
    /// Replaces the neutral band of the metric configuration when set
    pub neutral_band: Option<f64>,
    pub polygon: PolygonConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            metric_config_path: DEFAULT_CONFIG_PATH.to_string(),
            database_url: DEFAULT_DATABASE_URL.to_string(),
            concurrency: DEFAULT_CONCURRENCY,
            history_days: DEFAULT_HISTORY_DAYS,
            neutral_band: None,
            polygon: PolygonConfig::default(),
        }
    }
}

impl RunnerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());

        Self {
            metric_config_path: var("METRIC_CONFIG_PATH").unwrap_or(defaults.metric_config_path),
            database_url: var("DATABASE_URL").unwrap_or(defaults.database_url),
            concurrency: var("BATCH_CONCURRENCY")
                .and_then(|v| v.trim().parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.concurrency),
            history_days: defaults.history_days,
            neutral_band: var("VALUATION_NEUTRAL_BAND").and_then(|v| v.trim().parse().ok()),
            polygon: PolygonConfig::from_env(),
        }
    }
}
