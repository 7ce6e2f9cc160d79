use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::{
    cache::{PriceCache, PriceSlot},
    config::Config,
    connection::{
        AuthToken, ConnectionEvent, ConnectionManager, ConnectionState, ConnectionStatus,
        Connector, ReconnectPolicy, WsConnector,
    },
    errors::{ContractViolation, SessionError, StreamError},
    key::{PriceRequest, RequestKey},
    protocol::{parse_server_message, PricePayload, ServerMessage},
    registry::SubscriptionRegistry,
};

const ERROR_BROADCAST_CAPACITY: usize = 64;

type AcquireReply = Result<(RequestKey, watch::Receiver<PriceSlot>), ContractViolation>;

enum Command {
    Initialize {
        token: AuthToken,
        reply: oneshot::Sender<()>,
    },
    Acquire {
        request: PriceRequest,
        reply: oneshot::Sender<AcquireReply>,
    },
    Release {
        key: RequestKey,
        reply: Option<oneshot::Sender<Result<(), ContractViolation>>>,
    },
    EnsureSubscribed {
        key: RequestKey,
    },
    Get {
        key: RequestKey,
        reply: oneshot::Sender<PriceSlot>,
    },
    Stats {
        reply: oneshot::Sender<SessionStats>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub connection: ConnectionStatus,
    pub subscriptions: usize,
    pub cached_prices: usize,
}

#[derive(Clone)]
pub struct PriceSession {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    errors: broadcast::Sender<StreamError>,
}

impl PriceSession {
    pub fn spawn(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Self {
        let connection = ConnectionManager::new(connector, policy);
        let status = connection.watch_status();
        let (errors, _) = broadcast::channel(ERROR_BROADCAST_CAPACITY);
        let (commands, receiver) = mpsc::unbounded_channel();

        let actor = SessionActor {
            connection,
            registry: SubscriptionRegistry::new(),
            cache: PriceCache::new(),
            errors: errors.clone(),
        };
        tokio::spawn(actor.run(receiver));

        Self {
            commands,
            status,
            errors,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::spawn(
            Arc::new(WsConnector::new(config.stream_url.clone())),
            config.reconnect_policy(),
        )
    }

    pub async fn initialize(&self, token: impl Into<AuthToken>) -> Result<(), SessionError> {
        let token = token.into();
        self.call(|reply| Command::Initialize { token, reply }).await
    }

    pub async fn acquire_key(&self, request: PriceRequest) -> Result<RequestKey, SessionError> {
        let (key, _prices) = self.acquire(request).await?;
        Ok(key)
    }

    pub async fn subscribe(&self, request: PriceRequest) -> Result<Lease, SessionError> {
        let (key, prices) = self.acquire(request).await?;
        Ok(Lease {
            key,
            prices,
            session: self.clone(),
            released: false,
        })
    }

    pub async fn release(&self, key: &RequestKey) -> Result<(), SessionError> {
        let key = key.clone();
        Ok(self
            .call(|reply| Command::Release {
                key,
                reply: Some(reply),
            })
            .await??)
    }

    pub fn release_detached(&self, key: RequestKey) {
        let _ = self.commands.send(Command::Release { key, reply: None });
    }

    pub fn ensure_subscribed(&self, key: &RequestKey) -> Result<(), SessionError> {
        self.commands
            .send(Command::EnsureSubscribed { key: key.clone() })
            .map_err(|_| SessionError::Closed)
    }

    pub async fn get(&self, key: &RequestKey) -> Result<Option<Arc<PricePayload>>, SessionError> {
        let key = key.clone();
        self.call(|reply| Command::Get { key, reply }).await
    }

    pub async fn stats(&self) -> Result<SessionStats, SessionError> {
        self.call(|reply| Command::Stats { reply }).await
    }

    // Held subscriptions survive and are replayed after the next `initialize`.
    pub async fn close(&self) -> Result<(), SessionError> {
        self.call(|reply| Command::Close { reply }).await
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.status().state
    }

    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn errors(&self) -> broadcast::Receiver<StreamError> {
        self.errors.subscribe()
    }

    async fn acquire(
        &self,
        request: PriceRequest,
    ) -> Result<(RequestKey, watch::Receiver<PriceSlot>), SessionError> {
        Ok(self
            .call(|reply| Command::Acquire { request, reply })
            .await??)
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| SessionError::Closed)?;
        response.await.map_err(|_| SessionError::Closed)
    }
}

pub struct Lease {
    key: RequestKey,
    pub(crate) prices: watch::Receiver<PriceSlot>,
    session: PriceSession,
    released: bool,
}

impl Lease {
    pub fn key(&self) -> &RequestKey {
        &self.key
    }

    pub fn latest(&self) -> PriceSlot {
        self.prices.borrow().clone()
    }

    pub async fn changed(&mut self) -> Option<Arc<PricePayload>> {
        loop {
            self.prices.changed().await.ok()?;
            if let Some(price) = self.prices.borrow_and_update().clone() {
                return Some(price);
            }
        }
    }

    pub async fn release(mut self) -> Result<(), SessionError> {
        self.released = true;
        self.session.release(&self.key).await
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.released {
            self.session.release_detached(self.key.clone());
        }
    }
}

struct SessionActor {
    connection: ConnectionManager,
    registry: SubscriptionRegistry,
    cache: PriceCache,
    errors: broadcast::Sender<StreamError>,
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => break,
                    }
                }
                event = self.connection.next_event() => self.handle_event(event).await,
            }
        }

        self.connection.close().await;
        tracing::debug!("price session stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Initialize { token, reply } => {
                self.connection.initialize(token).await;
                let _ = reply.send(());
            }
            Command::Acquire { request, reply } => self.acquire(request, reply).await,
            Command::Release { key, reply } => {
                let outcome = self.release(&key).await;
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }
            Command::EnsureSubscribed { key } => self.subscribe_if_connected(&key).await,
            Command::Get { key, reply } => {
                let _ = reply.send(self.cache.get(&key));
            }
            Command::Stats { reply } => {
                let _ = reply.send(SessionStats {
                    connection: self.connection.status(),
                    subscriptions: self.registry.len(),
                    cached_prices: self.cache.len(),
                });
            }
            Command::Close { reply } => {
                self.connection.close().await;
                self.registry.reset_link();
                let _ = reply.send(());
            }
        }
    }

    async fn acquire(&mut self, request: PriceRequest, reply: oneshot::Sender<AcquireReply>) {
        let acquired = match self.registry.acquire(request) {
            Ok(acquired) => acquired,
            Err(violation) => {
                tracing::error!(error = %violation, "rejected price stream acquire");
                let _ = reply.send(Err(violation));
                return;
            }
        };

        let key = acquired.key;
        tracing::debug!(
            key = %key,
            first = acquired.first,
            holders = self.registry.refcount(&key),
            "acquired price stream"
        );

        let prices = self.cache.watch(&key);
        if reply.send(Ok((key.clone(), prices))).is_err() {
            // The caller went away before seeing the key; nobody will release it.
            let _ = self.release(&key).await;
            return;
        }

        if acquired.first {
            self.subscribe_if_connected(&key).await;
        }
    }

    async fn release(&mut self, key: &RequestKey) -> Result<(), ContractViolation> {
        let released = self.registry.release(key).map_err(|violation| {
            tracing::error!(error = %violation, "rejected price stream release");
            violation
        })?;

        tracing::debug!(
            key = %key,
            last = released.last,
            holders = self.registry.refcount(key),
            "released price stream"
        );

        if !released.last {
            return Ok(());
        }

        if let Some(message) = released.unsubscribe_message() {
            if self.connection.is_connected() {
                if let Err(err) = self.connection.send(&message).await {
                    tracing::warn!(key = %key, error = %err, "failed to unsubscribe");
                    self.publish(err);
                }
            }
        }
        self.cache.evict(key);

        Ok(())
    }

    async fn subscribe_if_connected(&mut self, key: &RequestKey) {
        if !self.connection.is_connected() {
            return;
        }

        let Some(message) = self.registry.ensure_subscribed(key) else {
            return;
        };

        tracing::debug!(key = %key, "subscribing price stream");
        if let Err(err) = self.connection.send(&message).await {
            tracing::warn!(key = %key, error = %err, "failed to subscribe");
            self.publish(err);
        }
    }

    async fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => {
                self.registry.reset_link();
                let held = self.registry.held_keys();
                tracing::info!(
                    generation = self.connection.status().generation,
                    held = held.len(),
                    "replaying price subscriptions"
                );
                for key in held {
                    self.subscribe_if_connected(&key).await;
                }
            }
            ConnectionEvent::Frame(text) => self.route_frame(&text),
            ConnectionEvent::Disconnected(err) => {
                self.registry.reset_link();
                self.publish(err);
            }
            ConnectionEvent::ConnectFailed(err) => self.publish(err),
        }
    }

    fn route_frame(&mut self, text: &str) {
        match parse_server_message(text) {
            Ok(ServerMessage::Price(payload)) => {
                if self.registry.contains(&payload.key) {
                    self.cache.update(payload);
                } else {
                    tracing::debug!(key = %payload.key, "dropping price for a key nobody holds");
                }
            }
            Ok(ServerMessage::Error(err)) => {
                tracing::warn!(error = %err, "price stream reported an error");
                self.publish(err);
            }
            Ok(ServerMessage::Control(kind)) => {
                tracing::trace!(kind = %kind, "control frame");
            }
            Err(err) => {
                tracing::warn!(error = %err, "dropping malformed frame");
                self.publish(err);
            }
        }
    }

    fn publish(&self, err: StreamError) {
        let _ = self.errors.send(err);
    }
}
