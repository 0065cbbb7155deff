use anyhow::Result;
use chrono::NaiveDate;
use metrics_core::{EventRecord, EventSource, PriceTargetRecord};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

/// One persisted result row, keyed by the event tuple
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredResult {
    pub value_quantitative: Option<String>,
    pub value_qualitative: Option<String>,
    pub position: Option<String>,
    pub disparity: Option<f64>,
}

/// Events, analyst history, sector membership and computed results
#[derive(Clone)]
pub struct ResultStore {
    pool: SqlitePool,
}

impl ResultStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let in_memory = database_url.contains(":memory:");
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        // Every connection to an in-memory database sees its own empty database,
        // and the database is gone once its only connection closes
        let mut pool_options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
        if in_memory {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }
        let pool = pool_options.connect_with(options).await?;

        if !in_memory {
            // WAL for concurrent writes from parallel ticker tasks
            sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
        }

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        let schema = include_str!("../schema.sql");

        // sqlx executes one statement at a time
        for statement in schema.split(';') {
            let stmt = statement.trim();
            if !stmt.is_empty() {
                sqlx::query(stmt).execute(&self.pool).await?;
            }
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Events in the date range, optionally restricted to `tickers`, in
    /// (ticker, date, source, source id) order.
    pub async fn list_events(
        &self,
        tickers: Option<&[String]>,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<Vec<EventRecord>> {
        let rows: Vec<(String, NaiveDate, String, String)> = sqlx::query_as(
            "SELECT ticker, event_date, source, source_id FROM events
             WHERE (? IS NULL OR event_date >= ?) AND (? IS NULL OR event_date <= ?)
             ORDER BY ticker, event_date, source, source_id",
        )
        .bind(from)
        .bind(from)
        .bind(to)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter(|(ticker, ..)| {
                tickers
                    .map(|wanted| wanted.iter().any(|t| t.eq_ignore_ascii_case(ticker)))
                    .unwrap_or(true)
            })
            .map(|(ticker, event_date, source, source_id)| EventRecord {
                ticker,
                event_date,
                source: EventSource::parse(&source),
                source_id,
            })
            .collect())
    }

    pub async fn analyst_targets(&self, ticker: &str) -> Result<Vec<PriceTargetRecord>> {
        let rows: Vec<(NaiveDate, f64, Option<String>)> = sqlx::query_as(
            "SELECT target_date, price_target, publisher FROM analyst_targets
             WHERE ticker = ? ORDER BY target_date, id",
        )
        .bind(ticker)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(date, price_target, publisher)| PriceTargetRecord {
                price_target,
                publisher,
                date,
            })
            .collect())
    }

    /// Tickers sharing `ticker`'s sector, excluding itself
    pub async fn peers(&self, ticker: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT p.ticker FROM ticker_sectors p
             JOIN ticker_sectors t ON t.sector = p.sector
             WHERE t.ticker = ? AND p.ticker <> t.ticker
             ORDER BY p.ticker",
        )
        .bind(ticker)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(t,)| t).collect())
    }

    pub async fn result_exists(&self, event: &EventRecord) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM metric_results
             WHERE ticker = ? AND event_date = ? AND source = ? AND source_id = ?",
        )
        .bind(&event.ticker)
        .bind(event.event_date)
        .bind(event.source.as_str())
        .bind(&event.source_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Insert or replace the result for `event`.
    pub async fn save_result(&self, event: &EventRecord, result: &StoredResult) -> Result<()> {
        sqlx::query(
            "INSERT INTO metric_results
             (ticker, event_date, source, source_id, value_quantitative, value_qualitative, position, disparity)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(ticker, event_date, source, source_id) DO UPDATE SET
              value_quantitative = excluded.value_quantitative,
              value_qualitative = excluded.value_qualitative,
              position = excluded.position,
              disparity = excluded.disparity",
        )
        .bind(&event.ticker)
        .bind(event.event_date)
        .bind(event.source.as_str())
        .bind(&event.source_id)
        .bind(&result.value_quantitative)
        .bind(&result.value_qualitative)
        .bind(&result.position)
        .bind(result.disparity)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_result(&self, event: &EventRecord) -> Result<Option<StoredResult>> {
        let row: Option<(Option<String>, Option<String>, Option<String>, Option<f64>)> = sqlx::query_as(
            "SELECT value_quantitative, value_qualitative, position, disparity FROM metric_results
             WHERE ticker = ? AND event_date = ? AND source = ? AND source_id = ?",
        )
        .bind(&event.ticker)
        .bind(event.event_date)
        .bind(event.source.as_str())
        .bind(&event.source_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(value_quantitative, value_qualitative, position, disparity)| StoredResult {
            value_quantitative,
            value_qualitative,
            position,
            disparity,
        }))
    }

    pub async fn count_results(&self) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM metric_results")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    pub async fn insert_event(&self, event: &EventRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO events (ticker, event_date, source, source_id) VALUES (?, ?, ?, ?)
             ON CONFLICT(ticker, event_date, source, source_id) DO NOTHING",
        )
        .bind(&event.ticker)
        .bind(event.event_date)
        .bind(event.source.as_str())
        .bind(&event.source_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_analyst_target(&self, ticker: &str, record: &PriceTargetRecord) -> Result<()> {
        sqlx::query("INSERT INTO analyst_targets (ticker, target_date, price_target, publisher) VALUES (?, ?, ?, ?)")
            .bind(ticker)
            .bind(record.date)
            .bind(record.price_target)
            .bind(&record.publisher)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_sector(&self, ticker: &str, sector: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO ticker_sectors (ticker, sector) VALUES (?, ?)
             ON CONFLICT(ticker) DO UPDATE SET sector = excluded.sector",
        )
        .bind(ticker)
        .bind(sector)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn event(ticker: &str, d: &str, source: EventSource) -> EventRecord {
        EventRecord {
            ticker: ticker.to_string(),
            event_date: date(d),
            source,
            source_id: format!("{}-{}", ticker, d),
        }
    }

    #[tokio::test]
    async fn test_store_creation() {
        let store = ResultStore::connect("sqlite::memory:").await.unwrap();
        assert!(store.pool().acquire().await.is_ok());
        assert_eq!(store.count_results().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_events_filters() {
        let store = ResultStore::connect("sqlite::memory:").await.unwrap();
        store.insert_event(&event("AAPL", "2024-01-15", EventSource::Earnings)).await.unwrap();
        store.insert_event(&event("AAPL", "2024-04-15", EventSource::Consensus)).await.unwrap();
        store.insert_event(&event("MSFT", "2024-02-01", EventSource::Earnings)).await.unwrap();
        // duplicate is ignored
        store.insert_event(&event("MSFT", "2024-02-01", EventSource::Earnings)).await.unwrap();

        assert_eq!(store.list_events(None, None, None).await.unwrap().len(), 3);

        let aapl = store
            .list_events(Some(&["aapl".to_string()]), Some(date("2024-03-01")), None)
            .await
            .unwrap();
        assert_eq!(aapl.len(), 1);
        assert_eq!(aapl[0].source, EventSource::Consensus);
    }

    #[tokio::test]
    async fn test_peers_exclude_self() {
        let store = ResultStore::connect("sqlite::memory:").await.unwrap();
        for (t, s) in [("AAPL", "Tech"), ("MSFT", "Tech"), ("GOOG", "Tech"), ("XOM", "Energy")] {
            store.set_sector(t, s).await.unwrap();
        }
        assert_eq!(store.peers("AAPL").await.unwrap(), vec!["GOOG".to_string(), "MSFT".to_string()]);
        assert!(store.peers("XOM").await.unwrap().is_empty());
        assert!(store.peers("UNKNOWN").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_result_replaces() {
        let store = ResultStore::connect("sqlite::memory:").await.unwrap();
        let ev = event("AAPL", "2024-01-15", EventSource::Earnings);
        assert!(!store.result_exists(&ev).await.unwrap());

        let first = StoredResult {
            value_quantitative: Some("{\"a\":1}".to_string()),
            position: Some("long".to_string()),
            disparity: Some(0.25),
            ..Default::default()
        };
        store.save_result(&ev, &first).await.unwrap();
        let second = StoredResult {
            position: Some("short".to_string()),
            disparity: Some(-0.1),
            ..first.clone()
        };
        store.save_result(&ev, &second).await.unwrap();

        assert_eq!(store.count_results().await.unwrap(), 1);
        assert_eq!(store.load_result(&ev).await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn test_analyst_targets_roundtrip_order() {
        let store = ResultStore::connect("sqlite::memory:").await.unwrap();
        for (d, pt) in [("2024-03-01", 120.0), ("2024-01-01", 100.0)] {
            let record = PriceTargetRecord {
                price_target: pt,
                publisher: Some("Jefferies".to_string()),
                date: date(d),
            };
            store.insert_analyst_target("AAPL", &record).await.unwrap();
        }
        let targets = store.analyst_targets("AAPL").await.unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].price_target, 100.0);
    }
}
