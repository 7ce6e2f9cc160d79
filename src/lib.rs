pub mod cache;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod key;
pub mod protocol;
pub mod registry;
pub mod rest;
pub mod session;

#[cfg(test)]
mod testing;

pub use connection::{AuthToken, ConnectionState, ConnectionStatus, ReconnectPolicy};
pub use consumer::{ConsumerEvent, PriceCallbacks, PriceConsumer, Quote};
pub use errors::{ContractViolation, RestError, SessionError, StreamError};
pub use key::{derive_key, ContractDuration, PriceRequest, RequestKey, TradeType};
pub use protocol::PricePayload;
pub use session::{Lease, PriceSession};
