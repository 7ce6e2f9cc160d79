use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::{sync::mpsc, time::timeout};

use crate::{
    connection::{AuthToken, Connector, PriceChannel},
    errors::StreamError,
};

#[derive(Default)]
struct MockState {
    attempts: usize,
    tokens: Vec<String>,
    fail_next: usize,
    fail_always: bool,
}

pub(crate) struct MockConnector {
    state: Mutex<MockState>,
    links: mpsc::UnboundedSender<MockLink>,
}

impl MockConnector {
    pub(crate) fn new() -> (Arc<Self>, MockLinks) {
        let (links, receiver) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            state: Mutex::new(MockState::default()),
            links,
        });
        (connector, MockLinks { receiver })
    }

    pub(crate) fn attempts(&self) -> usize {
        self.state.lock().expect("mock state poisoned").attempts
    }

    pub(crate) fn tokens(&self) -> Vec<String> {
        self.state.lock().expect("mock state poisoned").tokens.clone()
    }

    pub(crate) fn fail_next(&self, count: usize) {
        self.state.lock().expect("mock state poisoned").fail_next = count;
    }

    pub(crate) fn fail_always(&self, enabled: bool) {
        self.state.lock().expect("mock state poisoned").fail_always = enabled;
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, token: &AuthToken) -> Result<Box<dyn PriceChannel>, StreamError> {
        {
            let mut state = self.state.lock().expect("mock state poisoned");
            state.attempts += 1;
            state.tokens.push(token.expose().to_string());

            if state.fail_always {
                return Err(StreamError::Transport("mock upstream refused".to_string()));
            }
            if state.fail_next > 0 {
                state.fail_next -= 1;
                return Err(StreamError::Transport("mock upstream refused".to_string()));
            }
        }

        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let _ = self.links.send(MockLink {
            token: token.expose().to_string(),
            sent: sent_rx,
            frames: frames_tx,
        });

        Ok(Box::new(MockChannel {
            sent: sent_tx,
            frames: frames_rx,
        }))
    }
}

struct MockChannel {
    sent: mpsc::UnboundedSender<String>,
    frames: mpsc::UnboundedReceiver<Result<String, StreamError>>,
}

#[async_trait]
impl PriceChannel for MockChannel {
    async fn send_text(&mut self, text: String) -> Result<(), StreamError> {
        self.sent
            .send(text)
            .map_err(|_| StreamError::Transport("mock link closed".to_string()))
    }

    async fn next_frame(&mut self) -> Option<Result<String, StreamError>> {
        self.frames.recv().await
    }

    async fn close(&mut self) {
        self.frames.close();
    }
}

pub(crate) struct MockLinks {
    receiver: mpsc::UnboundedReceiver<MockLink>,
}

impl MockLinks {
    pub(crate) async fn next(&mut self) -> MockLink {
        timeout(Duration::from_millis(500), self.receiver.recv())
            .await
            .expect("timed out waiting for a link")
            .expect("connector dropped")
    }
}

// Server half of one mock link. Dropping it simulates the transport dying.
pub(crate) struct MockLink {
    pub(crate) token: String,
    sent: mpsc::UnboundedReceiver<String>,
    frames: mpsc::UnboundedSender<Result<String, StreamError>>,
}

impl MockLink {
    pub(crate) fn push(&self, frame: Value) {
        self.push_raw(&frame.to_string());
    }

    pub(crate) fn push_raw(&self, frame: &str) {
        let _ = self.frames.send(Ok(frame.to_string()));
    }

    pub(crate) async fn next_sent(&mut self) -> Value {
        let text = timeout(Duration::from_millis(500), self.sent.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client side closed");
        serde_json::from_str(&text).expect("client frames are JSON")
    }

    pub(crate) fn drain_sent(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(text) = self.sent.try_recv() {
            frames.push(serde_json::from_str(&text).expect("client frames are JSON"));
        }
        frames
    }

    pub(crate) async fn closed(&mut self) -> bool {
        timeout(Duration::from_millis(500), async {
            while self.sent.recv().await.is_some() {}
        })
        .await
        .is_ok()
    }
}
