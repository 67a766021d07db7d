//! Registry
//!
//! Four independently locked tables shared by the engine and the
//! transport:
//! - client id -> topic subscriptions
//! - pipe <-> client id
//! - (target pipe, packet id) -> pending delivery record
//! - a generic key/value table
//!
//! No operation spans two tables atomically. Lookups on missing keys
//! return `None` or an empty list.

mod pending;


pub use pending::{Completion, DeliveryEntry, PendingDelivery};

use std::hash::Hash;
use std::sync::Arc;

use ahash::AHashMap;
use bytes::Bytes;
use compact_str::CompactString;
use parking_lot::Mutex;

use crate::policy::{reserve, Exhausted, Resource, SharedPolicy};
use crate::protocol::SubscriptionOptions;
use crate::PipeId;

/// A mutex-guarded hash map
#[derive(Debug)]
pub struct Table<K, V> {
    inner: Mutex<AHashMap<K, V>>,
}

impl<K: Eq + Hash, V> Default for Table<K, V> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(AHashMap::new()),
        }
    }
}

impl<K: Eq + Hash, V: Clone> Table<K, V> {
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().get(key).cloned()
    }

    /// Insert or replace, returning the previous value.
    pub fn set(&self, key: K, value: V) -> Option<V> {
        self.inner.lock().insert(key, value)
    }

    pub fn del(&self, key: &K) -> Option<V> {
        self.inner.lock().remove(key)
    }

    pub fn exists(&self, key: &K) -> bool {
        self.inner.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Run `f` with the table locked.
    pub fn with<R>(&self, f: impl FnOnce(&mut AHashMap<K, V>) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

/// One subscription held in a client's topic list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicEntry {
    pub filter: Arc<str>,
    pub pipe: PipeId,
    pub options: SubscriptionOptions,
    pub subscription_id: Option<u32>,
}

#[derive(Debug, Default)]
struct Bindings {
    by_pipe: AHashMap<PipeId, Arc<str>>,
    by_client: AHashMap<Arc<str>, PipeId>,
}

pub type PendingKey = (PipeId, u16);

pub struct Registry {
    topics: Table<Arc<str>, Vec<TopicEntry>>,
    bindings: Mutex<Bindings>,
    pending: Table<PendingKey, Arc<PendingDelivery>>,
    kv: Table<CompactString, Bytes>,
    max_pending: usize,
    policy: SharedPolicy,
}

impl Registry {
    /// `max_pending` of 0 leaves the pending table unbounded.
    pub fn new(max_pending: usize, policy: SharedPolicy) -> Self {
        Self {
            topics: Table::default(),
            bindings: Mutex::new(Bindings::default()),
            pending: Table::default(),
            kv: Table::default(),
            max_pending,
            policy,
        }
    }

    // ------------------------------------------------------------------
    // client -> topics
    // ------------------------------------------------------------------

    /// Append a subscription, replacing an entry for the same filter from
    /// the same pipe.
    pub fn add_topic(&self, client_id: &Arc<str>, entry: TopicEntry) {
        self.topics.with(|map| {
            let list = map.entry(client_id.clone()).or_default();
            match list
                .iter_mut()
                .find(|e| e.filter == entry.filter && e.pipe == entry.pipe)
            {
                Some(existing) => *existing = entry,
                None => list.push(entry),
            }
        });
    }

    /// Subscriptions of `client_id` in insertion order.
    pub fn topics(&self, client_id: &str) -> Vec<TopicEntry> {
        self.topics.with(|map| map.get(client_id).cloned().unwrap_or_default())
    }

    pub fn has_topics(&self, client_id: &str) -> bool {
        self.topics.with(|map| map.contains_key(client_id))
    }

    /// Remove the entries of `client_id` matching `pred`. The client key is
    /// dropped once its list is empty.
    pub fn remove_topics_where(
        &self,
        client_id: &str,
        mut pred: impl FnMut(&TopicEntry) -> bool,
    ) -> Vec<TopicEntry> {
        self.topics.with(|map| {
            let Some(list) = map.get_mut(client_id) else {
                return Vec::new();
            };
            let mut removed = Vec::new();
            list.retain(|e| {
                if pred(e) {
                    removed.push(e.clone());
                    false
                } else {
                    true
                }
            });
            if list.is_empty() {
                map.remove(client_id);
            }
            removed
        })
    }

    pub fn remove_topic(&self, client_id: &str, filter: &str, pipe: PipeId) -> bool {
        !self
            .remove_topics_where(client_id, |e| &*e.filter == filter && e.pipe == pipe)
            .is_empty()
    }

    // ------------------------------------------------------------------
    // pipe <-> client
    // ------------------------------------------------------------------

    /// Bind `pipe` to `client_id`. The client's previous pipe, if any,
    /// loses the reverse mapping (last writer wins) and is returned.
    pub fn bind(&self, pipe: PipeId, client_id: Arc<str>) -> Option<PipeId> {
        let mut b = self.bindings.lock();
        b.by_pipe.insert(pipe, client_id.clone());
        b.by_client.insert(client_id, pipe).filter(|&old| old != pipe)
    }

    /// Drop the bindings of `pipe`. The client mapping is only removed when
    /// it still points at this pipe.
    pub fn unbind(&self, pipe: PipeId) -> Option<Arc<str>> {
        let mut b = self.bindings.lock();
        let client = b.by_pipe.remove(&pipe)?;
        if b.by_client.get(&client) == Some(&pipe) {
            b.by_client.remove(&client);
        }
        Some(client)
    }

    pub fn client_of(&self, pipe: PipeId) -> Option<Arc<str>> {
        self.bindings.lock().by_pipe.get(&pipe).cloned()
    }

    pub fn pipe_of(&self, client_id: &str) -> Option<PipeId> {
        self.bindings.lock().by_client.get(client_id).copied()
    }

    // ------------------------------------------------------------------
    // pending deliveries
    // ------------------------------------------------------------------

    /// Register `record` under (target pipe, outbound packet id).
    pub fn insert_pending(
        &self,
        key: PendingKey,
        record: Arc<PendingDelivery>,
    ) -> Result<(), Exhausted> {
        self.pending.with(|map| {
            if !map.contains_key(&key) {
                reserve(&*self.policy, Resource::PendingDeliveries, map.len(), self.max_pending)?;
            }
            map.insert(key, record);
            Ok(())
        })
    }

    pub fn pending(&self, pipe: PipeId, packet_id: u16) -> Option<Arc<PendingDelivery>> {
        self.pending.get(&(pipe, packet_id))
    }

    /// Acknowledge the delivery sent to `pipe` as `packet_id`.
    ///
    /// The key is removed so a late or repeated ack finds nothing.
    pub fn ack_pending(&self, pipe: PipeId, packet_id: u16) -> Completion {
        match self.pending.del(&(pipe, packet_id)) {
            Some(record) => record.finish(pipe, packet_id),
            None => Completion::Ignored,
        }
    }

    /// Remove every key targeting `pipe` and finish those entries.
    pub fn drop_pending_for(&self, pipe: PipeId) -> usize {
        let removed: Vec<Arc<PendingDelivery>> = self.pending.with(|map| {
            let keys: Vec<PendingKey> = map.keys().filter(|(p, _)| *p == pipe).copied().collect();
            keys.iter().filter_map(|k| map.remove(k)).collect()
        });
        for record in &removed {
            record.abandon(pipe);
        }
        removed.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    // ------------------------------------------------------------------
    // key/value
    // ------------------------------------------------------------------

    pub fn kv(&self) -> &Table<CompactString, Bytes> {
        &self.kv
    }
}
