use serde::{Deserialize, Serialize};
use types::candle::Candle;
use types::instrument::InstrumentInfo;

/// Raw `/history` query string; validated in the handler so that every
/// failure gets the same error body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryParams {
    pub symbol: Option<String>,
    pub interval: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
}

/// Column-oriented history response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub s: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errmsg: Option<String>,
    pub t: Vec<i64>,
    pub o: Vec<f64>,
    pub h: Vec<f64>,
    pub l: Vec<f64>,
    pub c: Vec<f64>,
    pub v: Vec<f64>,
}

impl HistoryResponse {
    fn empty(status: &str) -> Self {
        Self {
            s: status.to_string(),
            errmsg: None,
            t: Vec::new(),
            o: Vec::new(),
            h: Vec::new(),
            l: Vec::new(),
            c: Vec::new(),
            v: Vec::new(),
        }
    }

    /// Times are rendered in epoch seconds.
    pub fn from_candles(candles: &[Candle]) -> Self {
        let mut response = Self::empty("ok");
        for candle in candles {
            response.t.push(candle.window_start / 1000);
            response.o.push(candle.open);
            response.h.push(candle.high);
            response.l.push(candle.low);
            response.c.push(candle.close);
            response.v.push(candle.volume);
        }
        response
    }

    pub fn error(message: impl Into<String>) -> Self {
        let mut response = Self::empty("error");
        response.errmsg = Some(message.into());
        response
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigResponse {
    pub status: String,
    pub service: String,
    pub instruments: Vec<InstrumentInfo>,
    pub timestamp: i64,
}
