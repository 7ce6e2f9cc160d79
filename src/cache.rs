use std::{collections::HashMap, sync::Arc};

use tokio::sync::watch;

use crate::{key::RequestKey, protocol::PricePayload};

pub type PriceSlot = Option<Arc<PricePayload>>;

#[derive(Debug, Default)]
pub struct PriceCache {
    slots: HashMap<RequestKey, watch::Sender<PriceSlot>>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watch(&mut self, key: &RequestKey) -> watch::Receiver<PriceSlot> {
        self.slots
            .entry(key.clone())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    pub fn update(&mut self, payload: PricePayload) {
        let payload = Arc::new(payload);
        match self.slots.get(&payload.key) {
            Some(sender) => {
                sender.send_replace(Some(payload));
            }
            None => {
                let key = payload.key.clone();
                let (sender, _) = watch::channel(Some(payload));
                self.slots.insert(key, sender);
            }
        }
    }

    pub fn get(&self, key: &RequestKey) -> PriceSlot {
        self.slots
            .get(key)
            .and_then(|sender| sender.borrow().clone())
    }

    pub fn evict(&mut self, key: &RequestKey) -> bool {
        self.slots.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.slots
            .values()
            .filter(|sender| sender.borrow().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
