use std::sync::Arc;

use axum::{
    Json,
    extract::{Query, State},
};
use tracing::debug;
use types::timeframe::parse_timeframe_ms;

use crate::error::AppError;
use crate::models::{HistoryParams, HistoryResponse};
use crate::state::AppState;

/// Validated `/history` request, timestamps in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRequest {
    pub symbol: String,
    pub timeframe_ms: u64,
    pub from_ms: i64,
    pub to_ms: i64,
}

fn required(value: Option<String>, name: &str) -> Result<String, AppError> {
    value.ok_or_else(|| AppError::BadRequest(format!("Missing required parameter: {name}")))
}

fn parse_seconds(value: &str, name: &str) -> Result<i64, AppError> {
    value
        .trim()
        .parse::<i64>()
        .map_err(|_| AppError::BadRequest(format!("Parameter {name} must be an integer: {value}")))
}

impl TryFrom<HistoryParams> for HistoryRequest {
    type Error = AppError;

    fn try_from(params: HistoryParams) -> Result<Self, Self::Error> {
        let symbol = required(params.symbol, "symbol")?;
        let interval = required(params.interval, "interval")?;
        let from = required(params.from, "from")?;
        let to = required(params.to, "to")?;

        let symbol = symbol.trim();
        if symbol.is_empty() {
            return Err(AppError::BadRequest("Symbol cannot be empty".to_string()));
        }
        let interval = interval.trim();
        if interval.is_empty() {
            return Err(AppError::BadRequest("Interval cannot be empty".to_string()));
        }

        let from = parse_seconds(&from, "from")?;
        let to = parse_seconds(&to, "to")?;
        if from <= 0 || to <= 0 {
            return Err(AppError::BadRequest("Timestamps must be positive".to_string()));
        }
        if from >= to {
            return Err(AppError::BadRequest(
                "Parameter from must be before to".to_string(),
            ));
        }

        let timeframe_ms =
            parse_timeframe_ms(interval).map_err(|e| AppError::BadRequest(e.to_string()))?;

        let to_millis = |seconds: i64| {
            seconds
                .checked_mul(1000)
                .ok_or_else(|| AppError::BadRequest(format!("Timestamp out of range: {seconds}")))
        };
        Ok(Self {
            symbol: symbol.to_string(),
            timeframe_ms,
            from_ms: to_millis(from)?,
            to_ms: to_millis(to)?,
        })
    }
}

/// `GET /history?symbol=&interval=&from=&to=`
pub async fn get_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryResponse>, AppError> {
    let request = HistoryRequest::try_from(params)?;
    debug!(
        symbol = %request.symbol,
        timeframe_ms = request.timeframe_ms,
        from_ms = request.from_ms,
        to_ms = request.to_ms,
        "History query"
    );

    // Backends may block on network or disk.
    let repository = Arc::clone(&state.history);
    let candles = tokio::task::spawn_blocking(move || {
        repository.query_candles(
            &request.symbol,
            request.timeframe_ms,
            request.from_ms,
            request.to_ms,
        )
    })
    .await
    .map_err(|e| AppError::InternalError(anyhow::anyhow!("History query task failed: {e}")))??;

    Ok(Json(HistoryResponse::from_candles(&candles)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(symbol: &str, interval: &str, from: &str, to: &str) -> HistoryParams {
        HistoryParams {
            symbol: Some(symbol.to_string()),
            interval: Some(interval.to_string()),
            from: Some(from.to_string()),
            to: Some(to.to_string()),
        }
    }

    fn message(result: Result<HistoryRequest, AppError>) -> String {
        match result {
            Err(AppError::BadRequest(msg)) => msg,
            other => panic!("expected BadRequest, got {other:?}"),
        }
    }

    #[test]
    fn test_valid_request_converts_to_millis() {
        let request =
            HistoryRequest::try_from(params("BTCUSDT@BINANCE", "5m", "60", "600")).unwrap();
        assert_eq!(
            request,
            HistoryRequest {
                symbol: "BTCUSDT@BINANCE".to_string(),
                timeframe_ms: 300_000,
                from_ms: 60_000,
                to_ms: 600_000,
            }
        );
    }

    #[test]
    fn test_missing_parameter() {
        let mut p = params("BTCUSDT@BINANCE", "1m", "1", "2");
        p.to = None;
        assert_eq!(
            message(HistoryRequest::try_from(p)),
            "Missing required parameter: to"
        );
    }

    #[test]
    fn test_validation_order() {
        // Empty symbol wins over every later check.
        assert_eq!(
            message(HistoryRequest::try_from(params(" ", "", "x", "0"))),
            "Symbol cannot be empty"
        );
        assert_eq!(
            message(HistoryRequest::try_from(params("BTC", "", "x", "0"))),
            "Interval cannot be empty"
        );
        assert!(message(HistoryRequest::try_from(params("BTC", "5x", "abc", "0")))
            .contains("must be an integer"));
        assert_eq!(
            message(HistoryRequest::try_from(params("BTC", "5x", "0", "10"))),
            "Timestamps must be positive"
        );
        assert_eq!(
            message(HistoryRequest::try_from(params("BTC", "5x", "10", "10"))),
            "Parameter from must be before to"
        );
        assert!(message(HistoryRequest::try_from(params("BTC", "5x", "1", "10")))
            .contains("Unknown time unit"));
    }

    #[test]
    fn test_overflowing_timestamp() {
        let huge = (i64::MAX / 10).to_string();
        let result = HistoryRequest::try_from(params("BTC", "1m", "1", &huge));
        assert!(message(result).contains("out of range"));
    }
}
