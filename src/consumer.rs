use std::sync::Arc;

use tokio::sync::{
    broadcast::{self, error::RecvError},
    watch,
};

use crate::{
    connection::{AuthToken, ConnectionStatus},
    errors::{SessionError, StreamError},
    key::{derive_key, PriceRequest, RequestKey},
    protocol::PricePayload,
    session::{Lease, PriceSession},
};

#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerEvent {
    Price(Arc<PricePayload>),
    Connected,
    Disconnected,
    Error(StreamError),
}

pub trait PriceCallbacks {
    fn on_price(&mut self, _price: &PricePayload) {}

    fn on_error(&mut self, _error: &StreamError) {}

    fn on_connect(&mut self) {}

    fn on_disconnect(&mut self) {}
}

#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    pub payload: Arc<PricePayload>,
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerSnapshot {
    pub price: Option<Arc<PricePayload>>,
    pub is_connected: bool,
    pub error: Option<StreamError>,
}

pub struct PriceConsumer {
    session: PriceSession,
    request: PriceRequest,
    lease: Lease,
    status: watch::Receiver<ConnectionStatus>,
    errors: broadcast::Receiver<StreamError>,
    last_error: Option<StreamError>,
    announced_generation: Option<u64>,
    connected: bool,
}

impl PriceConsumer {
    pub async fn activate(
        session: &PriceSession,
        token: impl Into<AuthToken>,
        request: PriceRequest,
    ) -> Result<Self, SessionError> {
        session.initialize(token).await?;

        let errors = session.errors();
        let mut status = session.watch_status();
        let lease = acquire_lease(session, request.clone()).await?;

        // Report the current connection on the first poll.
        status.mark_changed();

        Ok(Self {
            session: session.clone(),
            request,
            lease,
            status,
            errors,
            last_error: None,
            announced_generation: None,
            connected: false,
        })
    }

    pub async fn deactivate(self) -> Result<(), SessionError> {
        self.lease.release().await
    }

    pub fn key(&self) -> &RequestKey {
        self.lease.key()
    }

    pub fn request(&self) -> &PriceRequest {
        &self.request
    }

    pub fn price(&self) -> Option<Arc<PricePayload>> {
        self.lease.latest()
    }

    pub fn quote(&self) -> Option<Quote> {
        let stale = !self.is_connected();
        self.price().map(|payload| Quote { payload, stale })
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().is_connected()
    }

    pub fn last_error(&self) -> Option<&StreamError> {
        self.last_error.as_ref()
    }

    pub fn snapshot(&self) -> ConsumerSnapshot {
        ConsumerSnapshot {
            price: self.price(),
            is_connected: self.is_connected(),
            error: self.last_error.clone(),
        }
    }

    // Acquire the new key before releasing the old one so a shared stream is never torn down in between.
    pub async fn set_request(&mut self, request: PriceRequest) -> Result<bool, SessionError> {
        if derive_key(&request) == *self.lease.key() {
            self.request = request;
            return Ok(false);
        }

        let lease = acquire_lease(&self.session, request.clone()).await?;
        let previous = std::mem::replace(&mut self.lease, lease);
        self.request = request;
        tracing::debug!(from = %previous.key(), to = %self.lease.key(), "switched price stream");

        previous.release().await?;
        Ok(true)
    }

    pub async fn set_token(&self, token: impl Into<AuthToken>) -> Result<(), SessionError> {
        self.session.initialize(token).await
    }

    pub async fn next_event(&mut self) -> Option<ConsumerEvent> {
        loop {
            tokio::select! {
                changed = self.lease.prices.changed() => {
                    changed.ok()?;
                    let latest = self.lease.prices.borrow_and_update().clone();
                    if let Some(price) = latest {
                        return Some(ConsumerEvent::Price(price));
                    }
                }
                changed = self.status.changed() => {
                    changed.ok()?;
                    let status = *self.status.borrow_and_update();
                    if let Some(event) = self.observe_status(status) {
                        return Some(event);
                    }
                }
                received = self.errors.recv() => {
                    match received {
                        Ok(err) => {
                            self.last_error = Some(err.clone());
                            return Some(ConsumerEvent::Error(err));
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(key = %self.lease.key(), skipped, "price consumer missed stream errors");
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        }
    }

    pub async fn run<C: PriceCallbacks + Send>(mut self, callbacks: &mut C) {
        while let Some(event) = self.next_event().await {
            match event {
                ConsumerEvent::Price(price) => callbacks.on_price(&price),
                ConsumerEvent::Connected => callbacks.on_connect(),
                ConsumerEvent::Disconnected => callbacks.on_disconnect(),
                ConsumerEvent::Error(err) => callbacks.on_error(&err),
            }
        }
    }

    fn observe_status(&mut self, status: ConnectionStatus) -> Option<ConsumerEvent> {
        if !status.is_connected() {
            if self.connected {
                self.connected = false;
                return Some(ConsumerEvent::Disconnected);
            }
            return None;
        }

        if self.announced_generation == Some(status.generation) {
            return None;
        }

        // A drop and reconnect can coalesce into one update; report both edges.
        if self.connected {
            self.connected = false;
            self.status.mark_changed();
            return Some(ConsumerEvent::Disconnected);
        }

        if let Err(err) = self.session.ensure_subscribed(self.lease.key()) {
            tracing::warn!(key = %self.lease.key(), error = %err, "could not re-assert price stream");
        }
        self.announced_generation = Some(status.generation);
        self.connected = true;
        self.last_error = None;
        Some(ConsumerEvent::Connected)
    }
}

async fn acquire_lease(session: &PriceSession, request: PriceRequest) -> Result<Lease, SessionError> {
    let mut lease = session.subscribe(request).await?;
    if lease.latest().is_some() {
        // Another holder already has a price; surface it right away.
        lease.prices.mark_changed();
    }
    Ok(lease)
}
