use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::{
    errors::StreamError,
    key::{derive_key, PriceRequest, RequestKey},
};

const CONTROL_FRAME_TYPES: &[&str] = &["subscribed", "unsubscribed", "pong", "ping", "heartbeat"];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        request: PriceRequest,
    },
    Unsubscribe {
        key: RequestKey,
        request: PriceRequest,
    },
}

impl ClientMessage {
    pub fn op(&self) -> &'static str {
        match self {
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
        }
    }

    pub fn encode(&self) -> Result<String, StreamError> {
        serde_json::to_string(self).map_err(|err| {
            StreamError::Protocol(format!("failed to encode {} message: {err}", self.op()))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PricePayload {
    pub key: RequestKey,
    pub price: f64,
    pub timestamp: Option<u64>,
    pub datetime: Option<String>,
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Price(PricePayload),
    Error(StreamError),
    Control(String),
}

pub fn parse_server_message(payload: &str) -> Result<ServerMessage, StreamError> {
    let value = serde_json::from_str::<Value>(payload)
        .map_err(|err| StreamError::Protocol(format!("invalid JSON frame: {err}")))?;

    let message_type = value
        .get("type")
        .and_then(Value::as_str)
        .map(|kind| kind.trim().to_ascii_lowercase())
        .unwrap_or_default();

    match message_type.as_str() {
        "price" => parse_price_frame(value).map(ServerMessage::Price),
        "error" => Ok(ServerMessage::Error(parse_error_frame(&value))),
        "" => Err(StreamError::Protocol(
            "frame is missing a `type` field".to_string(),
        )),
        kind if CONTROL_FRAME_TYPES.contains(&kind) => Ok(ServerMessage::Control(kind.to_string())),
        other => Err(StreamError::Protocol(format!(
            "unexpected frame type `{other}`"
        ))),
    }
}

fn parse_price_frame(value: Value) -> Result<PricePayload, StreamError> {
    let key = match value
        .get("key")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|key| !key.is_empty())
    {
        Some(key) => RequestKey::new(key),
        None => {
            let echoed = serde_json::from_value::<PriceRequest>(value.clone()).map_err(|err| {
                StreamError::Protocol(format!(
                    "price frame carries neither `key` nor request fields: {err}"
                ))
            })?;
            derive_key(&echoed)
        }
    };

    let price = value
        .get("price")
        .and_then(parse_f64_lossy)
        .filter(|price| price.is_finite())
        .ok_or_else(|| {
            StreamError::Protocol(format!("price frame for `{key}` has no numeric `price`"))
        })?;

    let timestamp = value.get("timestamp").and_then(parse_u64_lossy);

    Ok(PricePayload {
        key,
        price,
        timestamp,
        datetime: timestamp.and_then(iso8601_millis),
        raw: value,
    })
}

fn parse_error_frame(value: &Value) -> StreamError {
    let details = value.get("details").cloned().unwrap_or(Value::Null);

    let code = details
        .get("code")
        .and_then(Value::as_str)
        .map(ToString::to_string);
    let message = details
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| details.as_str())
        .unwrap_or("server reported an error")
        .to_string();

    StreamError::Server {
        code,
        message,
        details,
    }
}

fn parse_u64_lossy(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| {
            value
                .as_i64()
                .and_then(|numeric| (numeric >= 0).then_some(numeric as u64))
        })
        .or_else(|| value.as_str().and_then(|text| text.trim().parse::<u64>().ok()))
}

fn parse_f64_lossy(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|text| text.trim().parse::<f64>().ok()))
}

fn iso8601_millis(timestamp: u64) -> Option<String> {
    chrono::DateTime::<Utc>::from_timestamp_millis(timestamp as i64)
        .map(|value| value.to_rfc3339_opts(SecondsFormat::Millis, true))
}
