//! `~m~` framing and message parsing for the chart provider
//!
//! One WebSocket text message carries one or more frames:
//!
//! ```text
//! ~m~<len>~m~<payload>~m~<len>~m~<payload>...
//! ```
//!
//! A payload is either a heartbeat `~h~<n>` (must be echoed back verbatim) or
//! a JSON object `{"m": method, "p": [params...]}`.

use serde_json::{json, Value};

use crate::core::Bar;

const MARKER: &str = "~m~";
const HEARTBEAT_PREFIX: &str = "~h~";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("missing frame marker at offset {0}")]
    MissingMarker(usize),
    #[error("invalid frame length at offset {0}")]
    InvalidLength(usize),
    #[error("frame length {len} exceeds remaining {remaining} bytes")]
    Truncated { len: usize, remaining: usize },
}

/// Wrap one payload in a frame
pub fn encode_frame(payload: &str) -> String {
    format!("{MARKER}{}{MARKER}{}", payload.len(), payload)
}

/// Encode a method call
pub fn encode_message(method: &str, params: Vec<Value>) -> String {
    encode_frame(&json!({ "m": method, "p": params }).to_string())
}

/// Split a WebSocket text message into frame payloads
pub fn split_frames(text: &str) -> Result<Vec<&str>, CodecError> {
    let mut payloads = Vec::new();
    let mut rest = text;
    let mut offset = 0;

    while !rest.is_empty() {
        let after_marker = rest
            .strip_prefix(MARKER)
            .ok_or(CodecError::MissingMarker(offset))?;
        let len_end = after_marker
            .find(MARKER)
            .ok_or(CodecError::InvalidLength(offset))?;
        let len: usize = after_marker[..len_end]
            .parse()
            .map_err(|_| CodecError::InvalidLength(offset))?;

        let body = &after_marker[len_end + MARKER.len()..];
        if body.len() < len {
            return Err(CodecError::Truncated {
                len,
                remaining: body.len(),
            });
        }
        if !body.is_char_boundary(len) {
            return Err(CodecError::InvalidLength(offset));
        }

        payloads.push(&body[..len]);
        let consumed = rest.len() - body.len() + len;
        offset += consumed;
        rest = &body[len..];
    }

    Ok(payloads)
}

/// Parsed inbound payload
#[derive(Debug, Clone, PartialEq)]
pub enum ChartMessage {
    /// Heartbeat payload to echo, e.g. `~h~12`
    Heartbeat(String),
    SymbolResolved {
        session: String,
        price_scale: u64,
    },
    /// Bars for one or more series of a chart session
    SeriesData {
        session: String,
        series: Vec<(String, Vec<Bar>)>,
    },
    SeriesCompleted {
        session: String,
        series_id: String,
    },
    Quote {
        symbol: String,
        bid: Option<f64>,
        ask: Option<f64>,
    },
    SymbolError {
        session: String,
        reason: String,
    },
    CriticalError(String),
    /// Anything else: server hello, acks, unknown methods
    Other(String),
}

/// Parse one frame payload
pub fn parse_payload(payload: &str) -> ChartMessage {
    if payload.starts_with(HEARTBEAT_PREFIX) {
        return ChartMessage::Heartbeat(payload.to_string());
    }

    let value: Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(_) => return ChartMessage::Other(payload.to_string()),
    };
    let method = match value.get("m").and_then(Value::as_str) {
        Some(m) => m,
        None => return ChartMessage::Other("hello".to_string()),
    };
    let params = value
        .get("p")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    let session = || param_str(params, 0).unwrap_or_default();

    match method {
        "symbol_resolved" => match params.get(2).and_then(|info| info.get("pricescale")).and_then(Value::as_u64) {
            Some(price_scale) => ChartMessage::SymbolResolved {
                session: session(),
                price_scale,
            },
            None => ChartMessage::Other(method.to_string()),
        },
        "timescale_update" | "du" => ChartMessage::SeriesData {
            session: session(),
            series: params.get(1).map(parse_series_map).unwrap_or_default(),
        },
        "series_completed" => ChartMessage::SeriesCompleted {
            session: session(),
            series_id: param_str(params, 1).unwrap_or_default(),
        },
        "qsd" => parse_quote(params.get(1)).unwrap_or_else(|| ChartMessage::Other(method.to_string())),
        "symbol_error" | "series_error" => ChartMessage::SymbolError {
            session: session(),
            reason: params
                .last()
                .map(|v| v.as_str().map(str::to_owned).unwrap_or_else(|| v.to_string()))
                .unwrap_or_default(),
        },
        "critical_error" | "protocol_error" => ChartMessage::CriticalError(
            params
                .iter()
                .map(|v| v.as_str().map(str::to_owned).unwrap_or_else(|| v.to_string()))
                .collect::<Vec<_>>()
                .join(" "),
        ),
        other => ChartMessage::Other(other.to_string()),
    }
}

fn param_str(params: &[Value], index: usize) -> Option<String> {
    params.get(index).and_then(Value::as_str).map(str::to_owned)
}

/// `{"sds_1": {"s": [{"i": 0, "v": [t, o, h, l, c, vol]}]}, ...}`
fn parse_series_map(value: &Value) -> Vec<(String, Vec<Bar>)> {
    let map = match value.as_object() {
        Some(map) => map,
        None => return Vec::new(),
    };
    map.iter()
        .filter_map(|(series_id, series)| {
            let points = series.get("s")?.as_array()?;
            let bars = points
                .iter()
                .filter_map(|point| parse_bar(point.get("v")?))
                .collect();
            Some((series_id.clone(), bars))
        })
        .collect()
}

/// Bar times are epoch seconds on the wire
fn parse_bar(v: &Value) -> Option<Bar> {
    let v = v.as_array()?;
    let num = |i: usize| v.get(i).and_then(Value::as_f64);
    Some(Bar {
        time: (num(0)? * 1000.0) as u64,
        open: num(1)?,
        high: num(2)?,
        low: num(3)?,
        close: num(4)?,
        volume: num(5).unwrap_or(0.0),
    })
}

/// `{"n": "EURUSD", "s": "ok", "v": {"bid": .., "ask": ..}}`
fn parse_quote(value: Option<&Value>) -> Option<ChartMessage> {
    let value = value?;
    if value.get("s").and_then(Value::as_str) != Some("ok") {
        return None;
    }
    let symbol = value.get("n")?.as_str()?.to_string();
    let fields = value.get("v")?;
    Some(ChartMessage::Quote {
        symbol,
        bid: fields.get("bid").and_then(Value::as_f64),
        ask: fields.get("ask").and_then(Value::as_f64),
    })
}
