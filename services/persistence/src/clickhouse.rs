//! ClickHouse backend over the HTTP interface
//!
//! Database and table are created lazily on first use. Any failed request
//! clears the ready flag so the schema check runs again on the next call,
//! which is the only reconnection logic the backend needs over HTTP.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use types::candle::{Candle, SubscriptionKey};

use crate::repository::{QueryRepository, SaveRepository, StorageError};

pub const DATABASE: &str = "prices_db";
pub const TABLE: &str = "trade_candles";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) fn create_database_sql() -> String {
    format!("CREATE DATABASE IF NOT EXISTS {DATABASE}")
}

pub(crate) fn create_table_sql() -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {DATABASE}.{TABLE} (\
         instrument String, \
         timeframe_ms UInt64, \
         time Int64, \
         open Float64, \
         high Float64, \
         low Float64, \
         close Float64, \
         volume Float64\
         ) ENGINE = ReplacingMergeTree \
         ORDER BY (instrument, timeframe_ms, time)"
    )
}

pub(crate) fn insert_sql() -> String {
    format!("INSERT INTO {DATABASE}.{TABLE} FORMAT JSONEachRow")
}

pub(crate) fn select_sql() -> String {
    format!(
        "SELECT time, open, high, low, close, volume \
         FROM {DATABASE}.{TABLE} FINAL \
         WHERE instrument = {{instrument:String}} \
         AND timeframe_ms = {{timeframe:UInt64}} \
         AND time >= {{from:Int64}} AND time < {{to:Int64}} \
         ORDER BY time ASC \
         FORMAT JSONEachRow"
    )
}

// ── Row formats ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct InsertRow<'a> {
    instrument: &'a str,
    timeframe_ms: u64,
    time: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

impl<'a> From<&'a Candle> for InsertRow<'a> {
    fn from(c: &'a Candle) -> Self {
        Self {
            instrument: &c.key.instrument,
            timeframe_ms: c.key.timeframe_ms,
            time: c.window_start,
            open: c.open,
            high: c.high,
            low: c.low,
            close: c.close,
            volume: c.volume,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SelectRow {
    time: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

/// Newline-delimited JSON body for an insert.
pub(crate) fn encode_rows(candles: &[Candle]) -> Result<String, StorageError> {
    let mut body = String::new();
    for candle in candles {
        let line = serde_json::to_string(&InsertRow::from(candle))
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        body.push_str(&line);
        body.push('\n');
    }
    Ok(body)
}

pub(crate) fn decode_rows(key: &SubscriptionKey, body: &str) -> Result<Vec<Candle>, StorageError> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let row: SelectRow = serde_json::from_str(line)
                .map_err(|e| StorageError::Serialization(format!("{e}: {line}")))?;
            Ok(Candle {
                key: key.clone(),
                window_start: row.time,
                open: row.open,
                high: row.high,
                low: row.low,
                close: row.close,
                volume: row.volume,
            })
        })
        .collect()
}

// ── Repository ──────────────────────────────────────────────────────

pub struct ClickHouseRepository {
    client: Client,
    url: String,
    user: String,
    password: String,
    ready: AtomicBool,
}

impl ClickHouseRepository {
    pub fn new(url: &str, user: &str, password: &str) -> Result<Self, StorageError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        info!(url, "Initialized ClickHouse repository");
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            user: user.to_string(),
            password: password.to_string(),
            ready: AtomicBool::new(false),
        })
    }

    /// Run one statement. Inserts carry the SQL in the URL and rows in the
    /// body; everything else sends the SQL as the body.
    fn execute(
        &self,
        sql: &str,
        params: &[(&str, String)],
        rows: Option<String>,
    ) -> Result<String, StorageError> {
        let mut query: Vec<(String, String)> =
            vec![("output_format_json_quote_64bit_integers".into(), "0".into())];
        let payload = match rows {
            Some(rows) => {
                query.push(("query".into(), sql.to_string()));
                rows
            }
            None => sql.to_string(),
        };
        for (name, value) in params {
            query.push((format!("param_{name}"), value.clone()));
        }

        let mut request = self.client.post(&self.url).query(&query).body(payload);
        if !self.user.is_empty() {
            request = request
                .header("X-ClickHouse-User", &self.user)
                .header("X-ClickHouse-Key", &self.password);
        }

        let response = request.send().map_err(|e| {
            self.ready.store(false, Ordering::Release);
            StorageError::Connection(e.to_string())
        })?;
        let status = response.status();
        let text = response.text().map_err(|e| {
            self.ready.store(false, Ordering::Release);
            StorageError::Connection(e.to_string())
        })?;
        if !status.is_success() {
            self.ready.store(false, Ordering::Release);
            return Err(StorageError::Query(format!("{status}: {}", text.trim())));
        }
        Ok(text)
    }

    fn ensure_schema(&self) -> Result<(), StorageError> {
        if self.ready.load(Ordering::Acquire) {
            return Ok(());
        }
        self.execute(&create_database_sql(), &[], None)?;
        self.execute(&create_table_sql(), &[], None)?;
        self.ready.store(true, Ordering::Release);
        info!(database = DATABASE, table = TABLE, "ClickHouse schema ready");
        Ok(())
    }
}

impl SaveRepository for ClickHouseRepository {
    fn name(&self) -> &str {
        "clickhouse"
    }

    fn on_batch(&self, candles: &[Candle], end_of_batch: bool) -> Result<(), StorageError> {
        if candles.is_empty() {
            return Ok(());
        }
        self.ensure_schema()?;
        let rows = encode_rows(candles)?;
        if let Err(e) = self.execute(&insert_sql(), &[], Some(rows)) {
            warn!(count = candles.len(), error = %e, "ClickHouse insert failed");
            return Err(e);
        }
        debug!(count = candles.len(), end_of_batch, "Inserted candles into ClickHouse");
        Ok(())
    }
}

impl QueryRepository for ClickHouseRepository {
    fn query_candles(
        &self,
        instrument: &str,
        timeframe_ms: u64,
        from_inclusive: i64,
        to_exclusive: i64,
    ) -> Result<Vec<Candle>, StorageError> {
        if from_inclusive >= to_exclusive {
            return Ok(Vec::new());
        }
        self.ensure_schema()?;
        let params = [
            ("instrument", instrument.to_string()),
            ("timeframe", timeframe_ms.to_string()),
            ("from", from_inclusive.to_string()),
            ("to", to_exclusive.to_string()),
        ];
        let body = self.execute(&select_sql(), &params, None)?;
        let candles = decode_rows(&SubscriptionKey::new(instrument, timeframe_ms), &body)?;
        debug!(
            instrument,
            timeframe_ms,
            from_inclusive,
            to_exclusive,
            count = candles.len(),
            "Queried candles from ClickHouse"
        );
        Ok(candles)
    }
}
