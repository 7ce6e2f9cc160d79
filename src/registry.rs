use std::collections::HashMap;

use crate::{
    errors::ContractViolation,
    key::{derive_key, PriceRequest, RequestKey},
    protocol::ClientMessage,
};

#[derive(Debug, Clone)]
struct Subscription {
    refcount: usize,
    last_request: PriceRequest,
    sent_on_link: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acquired {
    pub key: RequestKey,
    pub first: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Released {
    pub key: RequestKey,
    pub request: PriceRequest,
    pub last: bool,
    // A subscribe for this key went out on the current link.
    pub was_sent: bool,
}

impl Released {
    pub fn unsubscribe_message(&self) -> Option<ClientMessage> {
        (self.last && self.was_sent).then(|| ClientMessage::Unsubscribe {
            key: self.key.clone(),
            request: self.request.clone(),
        })
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    subscriptions: HashMap<RequestKey, Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&mut self, request: PriceRequest) -> Result<Acquired, ContractViolation> {
        request.validate()?;
        let key = derive_key(&request);

        match self.subscriptions.get_mut(&key) {
            Some(existing) => {
                existing.refcount += 1;
                existing.last_request = request;
                Ok(Acquired { key, first: false })
            }
            None => {
                self.subscriptions.insert(
                    key.clone(),
                    Subscription {
                        refcount: 1,
                        last_request: request,
                        sent_on_link: false,
                    },
                );
                Ok(Acquired { key, first: true })
            }
        }
    }

    pub fn release(&mut self, key: &RequestKey) -> Result<Released, ContractViolation> {
        let Some(existing) = self.subscriptions.get_mut(key) else {
            return Err(ContractViolation::ReleaseWithoutAcquire { key: key.clone() });
        };

        if existing.refcount > 1 {
            existing.refcount -= 1;
            return Ok(Released {
                key: key.clone(),
                request: existing.last_request.clone(),
                last: false,
                was_sent: existing.sent_on_link,
            });
        }

        let removed = self
            .subscriptions
            .remove(key)
            .ok_or_else(|| ContractViolation::ReleaseWithoutAcquire { key: key.clone() })?;

        Ok(Released {
            key: key.clone(),
            request: removed.last_request,
            last: true,
            was_sent: removed.sent_on_link,
        })
    }

    // The only producer of subscribe frames. The per-link sent flag keeps it idempotent.
    pub fn ensure_subscribed(&mut self, key: &RequestKey) -> Option<ClientMessage> {
        let subscription = self.subscriptions.get_mut(key)?;
        if subscription.sent_on_link {
            return None;
        }

        subscription.sent_on_link = true;
        Some(ClientMessage::Subscribe {
            request: subscription.last_request.clone(),
        })
    }

    pub fn reset_link(&mut self) {
        for subscription in self.subscriptions.values_mut() {
            subscription.sent_on_link = false;
        }
    }

    pub fn held_keys(&self) -> Vec<RequestKey> {
        self.subscriptions.keys().cloned().collect()
    }

    pub fn contains(&self, key: &RequestKey) -> bool {
        self.subscriptions.contains_key(key)
    }

    pub fn refcount(&self, key: &RequestKey) -> usize {
        self.subscriptions
            .get(key)
            .map(|subscription| subscription.refcount)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
