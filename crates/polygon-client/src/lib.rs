pub mod cache;
pub mod retry;

pub use cache::{BatchCache, PrefetchReport, TickerCache};
pub use retry::RetryPolicy;

use async_trait::async_trait;
use metrics_core::{ApiCallDefinition, CallParams, ProviderClient, ProviderError};
use reqwest::Client;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

const BASE_URL: &str = "https://api.polygon.io";

/// Sliding-window rate limiter: at most `max_requests` per `window` duration.
#[derive(Clone)]
struct RateLimiter {
    timestamps: Arc<Mutex<VecDeque<Instant>>>,
    max_requests: usize,
    window: Duration,
}

impl RateLimiter {
    fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            timestamps: Arc::new(Mutex::new(VecDeque::new())),
            max_requests: max_requests.max(1),
            window,
        }
    }

    async fn acquire(&self) {
        loop {
            let mut ts = self.timestamps.lock().await;
            let now = Instant::now();

            // Remove timestamps outside the window
            while let Some(&front) = ts.front() {
                if now.duration_since(front) >= self.window {
                    ts.pop_front();
                } else {
                    break;
                }
            }

            if ts.len() < self.max_requests {
                ts.push_back(now);
                return;
            }

            // Wait until the oldest request falls out of the window
            let oldest = ts.front().copied().unwrap_or(now);
            let sleep_dur = (oldest + self.window).saturating_duration_since(now) + Duration::from_millis(50);
            drop(ts);
            tracing::debug!("Rate limiter: waiting {:.1}s for Polygon API slot", sleep_dur.as_secs_f64());
            tokio::time::sleep(sleep_dur).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct PolygonConfig {
    /// Without a key every call reports "no data"
    pub api_key: Option<String>,
    pub base_url: String,
    /// Calls per minute
    pub rate_limit: usize,
    /// Per-attempt timeout
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for PolygonConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: BASE_URL.to_string(),
            // 500 req/min for the Starter plan; free tier users should set POLYGON_RATE_LIMIT=5
            rate_limit: 500,
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl PolygonConfig {
    /// POLYGON_API_KEY, POLYGON_RATE_LIMIT, PROVIDER_TIMEOUT_SECS, PROVIDER_MAX_RETRIES
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let parse = |name: &str| std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            api_key: std::env::var("POLYGON_API_KEY").ok().filter(|k| !k.trim().is_empty()),
            base_url: defaults.base_url,
            rate_limit: parse("POLYGON_RATE_LIMIT").map(|v| v as usize).unwrap_or(defaults.rate_limit),
            timeout: parse("PROVIDER_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            retry: parse("PROVIDER_MAX_RETRIES")
                .map(|v| RetryPolicy::with_max_retries(v as u32))
                .unwrap_or(defaults.retry),
        }
    }
}

/// Fill `{name}` placeholders from `params`.
pub fn substitute(template: &str, params: &CallParams) -> String {
    params.iter().fold(template.to_string(), |acc, (name, value)| {
        acc.replace(&format!("{{{}}}", name), value)
    })
}

/// Config-driven Polygon REST client. One instance is shared by every ticker
/// task of a batch so the rate limit applies across all of them.
#[derive(Clone)]
pub struct PolygonClient {
    config: PolygonConfig,
    client: Client,
    rate_limiter: RateLimiter,
    calls: Arc<BTreeMap<String, ApiCallDefinition>>,
}

impl PolygonClient {
    pub fn new<'a>(config: PolygonConfig, calls: impl IntoIterator<Item = &'a ApiCallDefinition>) -> Self {
        let client = Client::builder()
            .timeout(config.timeout + Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            rate_limiter: RateLimiter::new(config.rate_limit, Duration::from_secs(60)),
            calls: Arc::new(calls.into_iter().map(|c| (c.id.clone(), c.clone())).collect()),
            client,
            config,
        }
    }

    pub fn has_api_key(&self) -> bool {
        self.config.api_key.is_some()
    }

    /// Full url and query pairs for a call, without the api key.
    pub fn request_parts(
        &self,
        call: &ApiCallDefinition,
        params: &CallParams,
    ) -> (String, Vec<(String, String)>) {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), substitute(&call.endpoint, params));
        let query = call
            .query
            .iter()
            .map(|(k, v)| (k.clone(), substitute(v, params)))
            .collect();
        (url, query)
    }

    /// One rate-limited attempt bounded by the per-attempt timeout.
    async fn send_once(
        &self,
        url: &str,
        query: &[(String, String)],
        api_key: &str,
    ) -> Result<Option<serde_json::Value>, ProviderError> {
        self.rate_limiter.acquire().await;

        let request = self.client.get(url).query(query).query(&[("apiKey", api_key)]);
        let timeout_secs = self.config.timeout.as_secs();

        let response = match tokio::time::timeout(self.config.timeout, request.send()).await {
            Err(_) => return Err(ProviderError::Timeout(timeout_secs)),
            Ok(Err(e)) if e.is_timeout() => return Err(ProviderError::Timeout(timeout_secs)),
            Ok(Err(e)) => return Err(ProviderError::Http(e.to_string())),
            Ok(Ok(r)) => r,
        };

        let status = response.status().as_u16();
        if status == 401 || status == 403 || status == 404 {
            tracing::info!("Polygon {} not available (HTTP {}), skipping", url, status);
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(ProviderError::Status {
                status,
                body: response.text().await.unwrap_or_default(),
            });
        }

        match tokio::time::timeout(self.config.timeout, response.json::<serde_json::Value>()).await {
            Err(_) => Err(ProviderError::Timeout(timeout_secs)),
            Ok(Err(e)) => Err(ProviderError::Decode(e.to_string())),
            Ok(Ok(body)) => Ok(Some(body)),
        }
    }
}

#[async_trait]
impl ProviderClient for PolygonClient {
    /// Fetch one configured call, retrying transient failures with backoff.
    async fn fetch(
        &self,
        call_id: &str,
        params: &CallParams,
    ) -> Result<Option<serde_json::Value>, ProviderError> {
        let call = self
            .calls
            .get(call_id)
            .ok_or_else(|| ProviderError::UnknownCall(call_id.to_string()))?;
        let Some(api_key) = self.config.api_key.as_deref() else {
            tracing::debug!("No Polygon API key, {} yields no data", call_id);
            return Ok(None);
        };

        let (url, query) = self.request_parts(call, params);
        let max_retries = self.config.retry.max_retries;

        let mut attempt = 0u32;
        loop {
            match self.send_once(&url, &query, api_key).await {
                Ok(body) => return Ok(body),
                Err(e) if e.is_transient() && attempt < max_retries => {
                    let delay = self.config.retry.delay_for_attempt(attempt);
                    tracing::warn!(
                        "Polygon {} failed ({}), retry {}/{} in {:.1}s",
                        call_id,
                        e,
                        attempt + 1,
                        max_retries,
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(ProviderError::Status { status: 429, .. }) => {
                    return Err(ProviderError::RateLimited(attempt + 1));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn financials() -> ApiCallDefinition {
        ApiCallDefinition {
            id: "financials".to_string(),
            endpoint: "/vX/reference/financials".to_string(),
            query: BTreeMap::from([
                ("ticker".to_string(), "{ticker}".to_string()),
                ("timeframe".to_string(), "quarterly".to_string()),
            ]),
            results_key: Some("results".to_string()),
            date_field: Some("end_date".to_string()),
            single_date: false,
        }
    }

    fn bars() -> ApiCallDefinition {
        ApiCallDefinition {
            id: "daily_bars".to_string(),
            endpoint: "/v2/aggs/ticker/{ticker}/range/1/day/{from}/{to}".to_string(),
            query: BTreeMap::new(),
            results_key: Some("results".to_string()),
            date_field: Some("t".to_string()),
            single_date: true,
        }
    }

    fn params() -> CallParams {
        BTreeMap::from([
            ("ticker".to_string(), "AAPL".to_string()),
            ("from".to_string(), "2023-01-01".to_string()),
            ("to".to_string(), "2024-12-31".to_string()),
        ])
    }

    #[test]
    fn test_request_parts_substitute_placeholders() {
        let calls = vec![financials(), bars()];
        let client = PolygonClient::new(PolygonConfig::default(), &calls);

        let (url, query) = client.request_parts(&calls[1], &params());
        assert_eq!(url, "https://api.polygon.io/v2/aggs/ticker/AAPL/range/1/day/2023-01-01/2024-12-31");
        assert!(query.is_empty());

        let (url, query) = client.request_parts(&calls[0], &params());
        assert_eq!(url, "https://api.polygon.io/vX/reference/financials");
        assert!(query.contains(&("ticker".to_string(), "AAPL".to_string())));
    }

    #[tokio::test]
    async fn test_unknown_call_is_error() {
        let client = PolygonClient::new(PolygonConfig::default(), &[financials()]);
        let err = client.fetch("quotes", &params()).await.unwrap_err();
        assert!(matches!(err, ProviderError::UnknownCall(_)));
    }

    #[tokio::test]
    async fn test_missing_api_key_yields_no_data() {
        let client = PolygonClient::new(PolygonConfig::default(), &[financials()]);
        assert!(!client.has_api_key());
        assert!(client.fetch("financials", &params()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unreachable_host_exhausts_retries() {
        let config = PolygonConfig {
            api_key: Some("test".to_string()),
            base_url: "http://127.0.0.1:9".to_string(),
            timeout: Duration::from_secs(2),
            retry: RetryPolicy {
                max_retries: 1,
                base: Duration::from_millis(10),
                jitter: false,
                ..RetryPolicy::default()
            },
            ..PolygonConfig::default()
        };
        let client = PolygonClient::new(config, &[financials()]);
        let err = client.fetch("financials", &params()).await.unwrap_err();
        assert!(err.is_transient());
    }

    fn local_config(addr: std::net::SocketAddr, timeout: Duration, retry: RetryPolicy) -> PolygonConfig {
        PolygonConfig {
            api_key: Some("test".to_string()),
            base_url: format!("http://{}", addr),
            timeout,
            retry,
            ..PolygonConfig::default()
        }
    }

    #[tokio::test]
    async fn test_stalled_response_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // accept and hold connections open without answering
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let config = local_config(addr, Duration::from_millis(300), RetryPolicy::no_retry());
        let client = PolygonClient::new(config, &[financials()]);
        let started = Instant::now();
        let err = client.fetch("financials", &params()).await.unwrap_err();

        assert!(matches!(err, ProviderError::Timeout(_)), "{:?}", err);
        assert!(started.elapsed() < Duration::from_secs(3));
        server.abort();
    }

    #[tokio::test]
    async fn test_429_retried_then_rate_limited() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&requests);
        let server = tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                if socket.read(&mut buf).await.unwrap_or(0) == 0 {
                    continue;
                }
                seen.fetch_add(1, Ordering::SeqCst);
                let _ = socket
                    .write_all(b"HTTP/1.1 429 Too Many Requests\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                    .await;
                let _ = socket.shutdown().await;
            }
        });

        let retry = RetryPolicy {
            max_retries: 2,
            base: Duration::from_millis(10),
            jitter: false,
            ..RetryPolicy::default()
        };
        let client = PolygonClient::new(local_config(addr, Duration::from_secs(5), retry), &[financials()]);
        let err = client.fetch("financials", &params()).await.unwrap_err();

        assert!(matches!(err, ProviderError::RateLimited(3)), "{:?}", err);
        assert_eq!(requests.load(Ordering::SeqCst), 3);
        server.abort();
    }

    #[tokio::test]
    async fn test_rate_limiter_waits_for_window() {
        let limiter = RateLimiter::new(2, Duration::from_millis(200));
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(200));
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(200));
    }
}
