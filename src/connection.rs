use std::{fmt, mem, pin::Pin, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::{future::BoxFuture, SinkExt, StreamExt};
use tokio::{
    sync::watch,
    time::{sleep, timeout, Sleep},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message as TungsteniteMessage,
    },
};

use crate::{errors::StreamError, protocol::ClientMessage};

const INITIAL_RECONNECT_DELAY_MS: u64 = 500;
const MAX_RECONNECT_DELAY_MS: u64 = 15_000;
const CONNECT_TIMEOUT_MS: u64 = 10_000;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Erroring,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Erroring => "erroring",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub generation: u64,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            generation: 0,
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(***)")
    }
}

impl From<&str> for AuthToken {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for AuthToken {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failures (refused connects, or links that drop before delivering a frame)
    /// before giving up. `None` retries forever.
    pub max_attempts: Option<u32>,
    pub connect_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(INITIAL_RECONNECT_DELAY_MS),
            max_delay: Duration::from_millis(MAX_RECONNECT_DELAY_MS),
            max_attempts: None,
            connect_timeout: Duration::from_millis(CONNECT_TIMEOUT_MS),
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, failures: u32) -> Duration {
        let mut delay = self.initial_delay.min(self.max_delay);
        for _ in 1..failures {
            if delay >= self.max_delay {
                break;
            }
            delay = next_reconnect_delay(delay, self.max_delay);
        }
        delay
    }
}

fn next_reconnect_delay(current: Duration, max: Duration) -> Duration {
    let doubled = current.as_millis().saturating_mul(2);
    let bounded = doubled.min(max.as_millis()) as u64;
    Duration::from_millis(bounded)
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, token: &AuthToken) -> Result<Box<dyn PriceChannel>, StreamError>;
}

#[async_trait]
pub trait PriceChannel: Send {
    async fn send_text(&mut self, text: String) -> Result<(), StreamError>;

    async fn next_frame(&mut self) -> Option<Result<String, StreamError>>;

    async fn close(&mut self);
}

pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, token: &AuthToken) -> Result<Box<dyn PriceChannel>, StreamError> {
        let mut request = self.url.as_str().into_client_request().map_err(|err| {
            StreamError::Transport(format!("invalid stream url `{}`: {err}", self.url))
        })?;
        let authorization = HeaderValue::from_str(&format!("Bearer {}", token.expose()))
            .map_err(|err| {
                StreamError::Transport(format!("auth token is not a valid header value: {err}"))
            })?;
        request.headers_mut().insert(AUTHORIZATION, authorization);

        let (stream, _response) = connect_async(request).await.map_err(|err| {
            StreamError::Transport(format!("failed to connect to {}: {err}", self.url))
        })?;

        Ok(Box::new(WsChannel { stream }))
    }
}

struct WsChannel {
    stream: WsStream,
}

#[async_trait]
impl PriceChannel for WsChannel {
    async fn send_text(&mut self, text: String) -> Result<(), StreamError> {
        self.stream
            .send(TungsteniteMessage::Text(text.into()))
            .await
            .map_err(|err| StreamError::Transport(format!("failed to send frame: {err}")))
    }

    async fn next_frame(&mut self) -> Option<Result<String, StreamError>> {
        loop {
            match self.stream.next().await? {
                Ok(TungsteniteMessage::Text(text)) => return Some(Ok(text.as_str().to_string())),
                Ok(TungsteniteMessage::Binary(binary)) => {
                    match String::from_utf8(binary.to_vec()) {
                        Ok(text) => return Some(Ok(text)),
                        Err(err) => {
                            tracing::warn!(error = %err, "dropping non UTF-8 binary frame");
                        }
                    }
                }
                Ok(TungsteniteMessage::Ping(payload)) => {
                    if let Err(err) = self.stream.send(TungsteniteMessage::Pong(payload)).await {
                        return Some(Err(StreamError::Transport(format!(
                            "failed to answer ping: {err}"
                        ))));
                    }
                }
                Ok(TungsteniteMessage::Close(_)) => return None,
                Ok(_) => {}
                Err(err) => return Some(Err(StreamError::Transport(err.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connected,
    Frame(String),
    Disconnected(StreamError),
    ConnectFailed(StreamError),
}

type ConnectAttempt = BoxFuture<'static, Result<Box<dyn PriceChannel>, StreamError>>;

enum Link {
    Idle,
    Connecting(ConnectAttempt),
    Connected(Box<dyn PriceChannel>),
    Backoff(Pin<Box<Sleep>>),
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    token: Option<AuthToken>,
    link: Link,
    failures: u32,
    generation: u64,
    status: watch::Sender<ConnectionStatus>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::default());
        Self {
            connector,
            policy,
            token: None,
            link: Link::Idle,
            failures: 0,
            generation: 0,
            status,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.link, Link::Connected(_))
    }

    pub async fn initialize(&mut self, token: AuthToken) {
        if self.token.as_ref() == Some(&token) && !matches!(self.link, Link::Idle) {
            tracing::debug!(state = %self.status().state, "stream already initialized for this token");
            return;
        }

        if self.token.is_some() {
            tracing::info!("auth token changed; re-establishing price stream");
        }

        self.teardown().await;
        self.token = Some(token);
        self.failures = 0;
        self.start_connecting();
    }

    pub async fn send(&mut self, message: &ClientMessage) -> Result<(), StreamError> {
        let Link::Connected(channel) = &mut self.link else {
            return Err(StreamError::Transport(format!(
                "cannot send {}: stream is not connected",
                message.op()
            )));
        };

        let text = message.encode()?;
        if let Err(err) = channel.send_text(text).await {
            tracing::warn!(op = message.op(), error = %err, "failed to write to price stream");
            self.reconnect_after_drop(&err);
            return Err(err);
        }

        Ok(())
    }

    pub async fn close(&mut self) {
        self.token = None;
        self.failures = 0;
        self.teardown().await;
        self.set_state(ConnectionState::Disconnected);
        tracing::info!("price stream closed");
    }

    // Cancel-safe: an in-flight attempt or backoff sleep lives in `self.link`, not in this future.
    pub async fn next_event(&mut self) -> ConnectionEvent {
        loop {
            match &mut self.link {
                Link::Idle => std::future::pending::<()>().await,
                Link::Connecting(attempt) => {
                    let outcome = attempt.await;
                    return match outcome {
                        Ok(channel) => self.on_connected(channel),
                        Err(err) => self.on_connect_failed(err),
                    };
                }
                Link::Connected(channel) => {
                    let frame = channel.next_frame().await;
                    return match frame {
                        Some(Ok(text)) => {
                            self.failures = 0;
                            ConnectionEvent::Frame(text)
                        }
                        Some(Err(err)) => {
                            tracing::warn!(error = %err, "price stream transport error");
                            self.reconnect_after_drop(&err);
                            ConnectionEvent::Disconnected(err)
                        }
                        None => {
                            let err =
                                StreamError::Transport("price stream closed by peer".to_string());
                            tracing::warn!("price stream closed by peer");
                            self.reconnect_after_drop(&err);
                            ConnectionEvent::Disconnected(err)
                        }
                    };
                }
                Link::Backoff(delay) => {
                    delay.as_mut().await;
                    self.start_connecting();
                }
            }
        }
    }

    // `failures` survives the handshake; only a delivered frame proves the link healthy.
    fn on_connected(&mut self, channel: Box<dyn PriceChannel>) -> ConnectionEvent {
        self.generation += 1;
        self.link = Link::Connected(channel);
        self.set_state(ConnectionState::Connected);
        tracing::info!(generation = self.generation, "price stream connected");
        ConnectionEvent::Connected
    }

    fn on_connect_failed(&mut self, err: StreamError) -> ConnectionEvent {
        self.failures = self.failures.saturating_add(1);

        if let Some(max_attempts) = self.policy.max_attempts {
            if self.failures >= max_attempts {
                let attempts = self.failures;
                self.failures = 0;
                self.link = Link::Idle;
                self.set_state(ConnectionState::Disconnected);
                tracing::warn!(attempts, error = %err, "giving up on price stream");
                return ConnectionEvent::ConnectFailed(StreamError::RetriesExhausted {
                    attempts,
                    last_error: err.to_string(),
                });
            }
        }

        let delay = self.policy.delay_for(self.failures);
        tracing::warn!(
            attempt = self.failures,
            retry_in_ms = delay.as_millis() as u64,
            error = %err,
            "failed to connect price stream"
        );
        self.link = Link::Backoff(Box::pin(sleep(delay)));
        self.set_state(ConnectionState::Erroring);
        ConnectionEvent::ConnectFailed(err)
    }

    fn reconnect_after_drop(&mut self, err: &StreamError) {
        self.failures = self.failures.saturating_add(1);
        let delay = self.policy.delay_for(self.failures);
        tracing::debug!(
            error = %err,
            retry_in_ms = delay.as_millis() as u64,
            "reconnecting price stream"
        );
        // Replacing the link drops the broken channel.
        self.link = Link::Backoff(Box::pin(sleep(delay)));
        self.set_state(ConnectionState::Connecting);
    }

    fn start_connecting(&mut self) {
        let Some(token) = self.token.clone() else {
            self.link = Link::Idle;
            self.set_state(ConnectionState::Disconnected);
            return;
        };

        let connector = self.connector.clone();
        let connect_timeout = self.policy.connect_timeout;
        let attempt = async move {
            match timeout(connect_timeout, connector.connect(&token)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(StreamError::Transport(format!(
                    "connect timed out after {}ms",
                    connect_timeout.as_millis()
                ))),
            }
        };

        self.link = Link::Connecting(Box::pin(attempt));
        self.set_state(ConnectionState::Connecting);
    }

    async fn teardown(&mut self) {
        let previous = mem::replace(&mut self.link, Link::Idle);
        if let Link::Connected(mut channel) = previous {
            channel.close().await;
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let next = ConnectionStatus {
            state,
            generation: self.generation,
        };
        self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::testing::MockConnector;

    fn fast_policy() -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            max_attempts: None,
            connect_timeout: Duration::from_millis(200),
        }
    }

    async fn next_event(manager: &mut ConnectionManager) -> ConnectionEvent {
        timeout(Duration::from_millis(500), manager.next_event())
            .await
            .expect("timed out waiting for connection event")
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for(6), Duration::from_millis(15_000));
        assert_eq!(policy.delay_for(1_000), Duration::from_millis(15_000));
    }

    #[test]
    fn auth_token_debug_is_redacted() {
        let token = AuthToken::new("super-secret");
        assert_eq!(format!("{token:?}"), "AuthToken(***)");
        assert_eq!(token.expose(), "super-secret");
    }

    #[tokio::test]
    async fn connects_and_bumps_generation() {
        let (connector, mut links) = MockConnector::new();
        let mut manager = ConnectionManager::new(connector.clone(), fast_policy());
        assert_eq!(manager.status(), ConnectionStatus::default());

        manager.initialize(AuthToken::new("token-a")).await;
        assert_eq!(manager.status().state, ConnectionState::Connecting);

        assert_eq!(next_event(&mut manager).await, ConnectionEvent::Connected);
        assert_eq!(
            manager.status(),
            ConnectionStatus {
                state: ConnectionState::Connected,
                generation: 1,
            }
        );
        assert_eq!(links.next().await.token, "token-a");
    }

    #[tokio::test]
    async fn initialize_with_same_token_is_a_no_op() {
        let (connector, _links) = MockConnector::new();
        let mut manager = ConnectionManager::new(connector.clone(), fast_policy());

        manager.initialize(AuthToken::new("token-a")).await;
        manager.initialize(AuthToken::new("token-a")).await;
        assert_eq!(next_event(&mut manager).await, ConnectionEvent::Connected);
        manager.initialize(AuthToken::new("token-a")).await;

        assert_eq!(connector.attempts(), 1);
        assert!(manager.is_connected());
    }

    #[tokio::test]
    async fn token_change_tears_down_the_old_link() {
        let (connector, mut links) = MockConnector::new();
        let mut manager = ConnectionManager::new(connector.clone(), fast_policy());

        manager.initialize(AuthToken::new("token-a")).await;
        assert_eq!(next_event(&mut manager).await, ConnectionEvent::Connected);
        let mut old_link = links.next().await;

        manager.initialize(AuthToken::new("token-b")).await;
        assert_eq!(next_event(&mut manager).await, ConnectionEvent::Connected);

        assert!(old_link.closed().await, "old link should be released");
        assert_eq!(links.next().await.token, "token-b");
        assert_eq!(connector.tokens(), vec!["token-a", "token-b"]);
        assert_eq!(manager.status().generation, 2);
    }

    #[tokio::test]
    async fn failed_connects_back_off_then_recover() {
        let (connector, _links) = MockConnector::new();
        connector.fail_next(2);
        let mut manager = ConnectionManager::new(connector.clone(), fast_policy());
        let mut status = manager.watch_status();

        manager.initialize(AuthToken::new("token-a")).await;

        assert!(matches!(
            next_event(&mut manager).await,
            ConnectionEvent::ConnectFailed(StreamError::Transport(_))
        ));
        assert_eq!(
            status.borrow_and_update().state,
            ConnectionState::Erroring
        );
        assert!(matches!(
            next_event(&mut manager).await,
            ConnectionEvent::ConnectFailed(StreamError::Transport(_))
        ));
        assert_eq!(next_event(&mut manager).await, ConnectionEvent::Connected);
        assert_eq!(connector.attempts(), 3);
    }

    #[tokio::test]
    async fn retries_exhausted_after_max_attempts() {
        let (connector, _links) = MockConnector::new();
        connector.fail_always(true);
        let policy = ReconnectPolicy {
            max_attempts: Some(3),
            ..fast_policy()
        };
        let mut manager = ConnectionManager::new(connector.clone(), policy);

        manager.initialize(AuthToken::new("token-a")).await;

        for _ in 0..2 {
            assert!(matches!(
                next_event(&mut manager).await,
                ConnectionEvent::ConnectFailed(StreamError::Transport(_))
            ));
        }
        assert!(matches!(
            next_event(&mut manager).await,
            ConnectionEvent::ConnectFailed(StreamError::RetriesExhausted { attempts: 3, .. })
        ));
        assert_eq!(manager.status().state, ConnectionState::Disconnected);
        assert_eq!(connector.attempts(), 3);

        assert!(
            timeout(Duration::from_millis(60), manager.next_event())
                .await
                .is_err(),
            "manager should stay idle after giving up"
        );
        assert_eq!(connector.attempts(), 3);
    }

    #[tokio::test]
    async fn dropped_link_reconnects() {
        let (connector, mut links) = MockConnector::new();
        let mut manager = ConnectionManager::new(connector.clone(), fast_policy());

        manager.initialize(AuthToken::new("token-a")).await;
        assert_eq!(next_event(&mut manager).await, ConnectionEvent::Connected);
        drop(links.next().await);

        assert!(matches!(
            next_event(&mut manager).await,
            ConnectionEvent::Disconnected(StreamError::Transport(_))
        ));
        assert_eq!(manager.status().state, ConnectionState::Connecting);
        assert_eq!(next_event(&mut manager).await, ConnectionEvent::Connected);
        assert_eq!(manager.status().generation, 2);
    }

    #[tokio::test]
    async fn links_dropped_right_after_the_handshake_back_off() {
        let (connector, mut links) = MockConnector::new();
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            max_attempts: None,
            connect_timeout: Duration::from_millis(200),
        };
        let mut manager = ConnectionManager::new(connector.clone(), policy);

        manager.initialize(AuthToken::new("token-a")).await;
        let _ = timeout(Duration::from_millis(300), async {
            loop {
                if manager.next_event().await == ConnectionEvent::Connected {
                    drop(links.next().await);
                }
            }
        })
        .await;

        let attempts = connector.attempts();
        assert!(
            (2..=4).contains(&attempts),
            "expected a handful of attempts in 300ms, got {attempts}"
        );
    }

    #[tokio::test]
    async fn delivered_frame_resets_backoff() {
        let (connector, mut links) = MockConnector::new();
        let mut manager = ConnectionManager::new(connector.clone(), fast_policy());

        manager.initialize(AuthToken::new("token-a")).await;
        assert_eq!(next_event(&mut manager).await, ConnectionEvent::Connected);
        drop(links.next().await);
        assert!(matches!(
            next_event(&mut manager).await,
            ConnectionEvent::Disconnected(_)
        ));
        assert_eq!(manager.failures, 1);

        assert_eq!(next_event(&mut manager).await, ConnectionEvent::Connected);
        assert_eq!(manager.failures, 1);

        let link = links.next().await;
        link.push_raw(r#"{"type":"heartbeat"}"#);
        assert!(matches!(
            next_event(&mut manager).await,
            ConnectionEvent::Frame(_)
        ));
        assert_eq!(manager.failures, 0);
    }

    #[tokio::test]
    async fn frames_are_forwarded_and_sends_reach_the_link() {
        let (connector, mut links) = MockConnector::new();
        let mut manager = ConnectionManager::new(connector.clone(), fast_policy());

        manager.initialize(AuthToken::new("token-a")).await;
        assert_eq!(next_event(&mut manager).await, ConnectionEvent::Connected);
        let mut link = links.next().await;

        link.push_raw(r#"{"type":"heartbeat"}"#);
        assert_eq!(
            next_event(&mut manager).await,
            ConnectionEvent::Frame(r#"{"type":"heartbeat"}"#.to_string())
        );

        let request = crate::key::PriceRequest::new(
            "R_100",
            crate::key::TradeType::RiseFall,
            crate::key::ContractDuration::ticks(5),
            "USD",
            10.0,
            None,
        );
        manager
            .send(&ClientMessage::Subscribe { request })
            .await
            .expect("send should succeed");
        assert_eq!(link.next_sent().await["type"], "subscribe");
    }

    #[tokio::test]
    async fn close_goes_idle_and_rejects_sends() {
        let (connector, mut links) = MockConnector::new();
        let mut manager = ConnectionManager::new(connector.clone(), fast_policy());

        manager.initialize(AuthToken::new("token-a")).await;
        assert_eq!(next_event(&mut manager).await, ConnectionEvent::Connected);
        let mut link = links.next().await;

        manager.close().await;
        assert_eq!(manager.status().state, ConnectionState::Disconnected);
        assert!(link.closed().await);
        assert!(timeout(Duration::from_millis(60), manager.next_event())
            .await
            .is_err());

        let request = crate::key::PriceRequest::new(
            "R_100",
            crate::key::TradeType::RiseFall,
            crate::key::ContractDuration::ticks(5),
            "USD",
            10.0,
            None,
        );
        assert!(matches!(
            manager.send(&ClientMessage::Subscribe { request }).await,
            Err(StreamError::Transport(_))
        ));
    }
}
