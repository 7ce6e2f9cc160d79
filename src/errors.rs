use serde_json::Value;

use crate::key::RequestKey;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StreamError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("server error: {message}")]
    Server {
        code: Option<String>,
        message: String,
        details: Value,
    },
    #[error("gave up reconnecting after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

impl StreamError {
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::RetriesExhausted { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractViolation {
    #[error("release of `{key}` without a matching acquire")]
    ReleaseWithoutAcquire { key: RequestKey },
    #[error("malformed price request: {0}")]
    MalformedRequest(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Violation(#[from] ContractViolation),
    #[error("price session is closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum RestError {
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("request failed: {0}")]
    Request(String),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("response invalid: {0}")]
    Data(String),
    #[error("client error: {0}")]
    Client(String),
}

impl RestError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
