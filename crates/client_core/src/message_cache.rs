//! Per-target message lists combining paginated fetches with pushed events.
//!
//! Every list is newest-first with unique ids. An incoming copy of a message
//! always replaces the copy already held for the same id, whatever its
//! timestamp: a pushed echo of a message we just sent must overwrite the
//! optimistic copy.

use std::{
    cmp::Ordering,
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use shared::{
    domain::{AuthorType, MessageId, TargetId},
    protocol::{CreateMessageResponse, Message},
};
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub type MessageMap = HashMap<TargetId, Vec<Message>>;

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Union of two message lists keyed by id, newest first.
///
/// With one side absent the other is returned as an owned copy, untouched.
pub fn merge(existing: Option<&[Message]>, incoming: Option<&[Message]>) -> Vec<Message> {
    match (existing, incoming) {
        (None, None) => Vec::new(),
        (Some(only), None) | (None, Some(only)) => only.to_vec(),
        (Some(existing), Some(incoming)) => {
            let mut by_id: HashMap<&MessageId, &Message> =
                HashMap::with_capacity(existing.len() + incoming.len());
            for message in existing.iter().chain(incoming) {
                by_id.insert(&message.id, message);
            }
            let mut merged: Vec<Message> = by_id.into_values().cloned().collect();
            merged.sort_by(newest_first);
            merged
        }
    }
}

/// Equal timestamps fall back to id order so repeated merges are stable.
fn newest_first(a: &Message, b: &Message) -> Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| b.id.cmp(&a.id))
}

/// Returns a new mapping with `message` merged into its target's list.
///
/// A message with neither a channel nor a group id is logged and dropped; the
/// returned mapping is then an unchanged copy.
pub fn apply_incoming_push(cache: &MessageMap, message: Message) -> MessageMap {
    match push_target(&message) {
        Some(target) => merge_pushed(cache, target, message),
        None => cache.clone(),
    }
}

fn push_target(message: &Message) -> Option<TargetId> {
    let target = message.target();
    if target.is_none() {
        warn!(
            message_id = %message.id,
            "cache: pushed message has no channel or group id; dropping"
        );
    }
    target
}

fn merge_pushed(cache: &MessageMap, target: TargetId, message: Message) -> MessageMap {
    let merged = merge(
        cache.get(&target).map(Vec::as_slice),
        Some(std::slice::from_ref(&message)),
    );
    let mut next = cache.clone();
    next.insert(target, merged);
    next
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    Fetch,
    Push,
    Sent,
    Removed,
}

#[derive(Debug, Clone)]
pub struct CacheUpdate {
    pub target: TargetId,
    pub origin: UpdateOrigin,
    pub messages: Vec<Message>,
}

/// Shared message cache. Writers swap in a fresh map, so a snapshot handed
/// out earlier never changes underneath its reader.
pub struct MessageCache {
    state: RwLock<Arc<MessageMap>>,
    updates: broadcast::Sender<CacheUpdate>,
}

impl Default for MessageCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCache {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(Arc::new(MessageMap::new())),
            updates,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheUpdate> {
        self.updates.subscribe()
    }

    pub fn snapshot(&self) -> Arc<MessageMap> {
        Arc::clone(&*self.state.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn get(&self, target: &TargetId) -> Vec<Message> {
        self.snapshot().get(target).cloned().unwrap_or_default()
    }

    /// Forget every cached list, e.g. when the session ends.
    pub fn clear(&self) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(MessageMap::new());
    }

    /// Merge a fetched page into the target's list.
    pub fn apply_fetch(&self, target: TargetId, messages: Vec<Message>) -> Vec<Message> {
        let merged = self.merge_into(&target, &messages);
        debug!(%target, count = merged.len(), "cache: applied fetched page");
        self.notify(target, UpdateOrigin::Fetch, merged.clone());
        merged
    }

    /// Merge one pushed message. Returns `None` when the message had no target.
    pub fn apply_push(&self, message: Message) -> Option<Vec<Message>> {
        let target = push_target(&message)?;
        let merged = {
            let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let next = merge_pushed(&**guard, target.clone(), message);
            let merged = next.get(&target).cloned().unwrap_or_default();
            *guard = Arc::new(next);
            merged
        };
        self.notify(target, UpdateOrigin::Push, merged.clone());
        Some(merged)
    }

    /// Insert the locally sent message built from the create response.
    pub fn apply_sent(
        &self,
        target: TargetId,
        created: &CreateMessageResponse,
        content: &str,
    ) -> Message {
        let (channel_id, group_id) = match &target {
            TargetId::Channel(id) => (Some(id.clone()), None),
            TargetId::Group(id) => (None, Some(id.clone())),
        };
        let message = Message {
            id: created.id.clone(),
            author: None,
            author_type: AuthorType::User,
            channel_id,
            group_id,
            message: content.to_string(),
            created_at: created.created_at,
            updated_at: created.created_at,
            avatar_url: String::new(),
            display_name: String::new(),
        };

        let merged = self.merge_into(&target, std::slice::from_ref(&message));
        self.notify(target, UpdateOrigin::Sent, merged);
        message
    }

    /// Drop one message from a target's list. Returns whether it was present.
    pub fn remove(&self, target: &TargetId, id: &MessageId) -> bool {
        let remaining = {
            let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let Some(current) = guard.get(target) else {
                return false;
            };
            if !current.iter().any(|message| &message.id == id) {
                return false;
            }
            let remaining: Vec<Message> = current
                .iter()
                .filter(|message| &message.id != id)
                .cloned()
                .collect();
            let mut next = MessageMap::clone(&**guard);
            next.insert(target.clone(), remaining.clone());
            *guard = Arc::new(next);
            remaining
        };
        self.notify(target.clone(), UpdateOrigin::Removed, remaining);
        true
    }

    /// Always merges against a list, even an empty one, so a first page is
    /// sorted and de-duplicated like any other.
    fn merge_into(&self, target: &TargetId, incoming: &[Message]) -> Vec<Message> {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let existing = guard.get(target).map(Vec::as_slice).unwrap_or_default();
        let merged = merge(Some(existing), Some(incoming));
        let mut next = MessageMap::clone(&**guard);
        next.insert(target.clone(), merged.clone());
        *guard = Arc::new(next);
        merged
    }

    fn notify(&self, target: TargetId, origin: UpdateOrigin, messages: Vec<Message>) {
        // No subscribers is fine.
        let _ = self.updates.send(CacheUpdate {
            target,
            origin,
            messages,
        });
    }
}

#[cfg(test)]
#[path = "tests/message_cache_tests.rs"]
mod tests;
