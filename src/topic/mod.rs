//! Topic matching and subscription index
//!
//! Topic name/filter validation and the [`SubscriptionTrie`] that maps
//! filters to subscribers and topic names to retained messages.

mod trie;
pub mod validation;


pub use trie::{InsertOutcome, NodeHandle, SubscriptionTrie};
pub use validation::{split_levels, topic_matches_filter, validate_topic_filter, validate_topic_name};

use std::sync::Arc;

use smallvec::SmallVec;

use crate::protocol::{Publish, QoS, SubscriptionOptions};
use crate::PipeId;

/// A subscriber entry stored at a filter's node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    pub client_id: Arc<str>,
    /// Pipe the subscription was made from
    pub pipe: PipeId,
    pub options: SubscriptionOptions,
    /// Subscription identifier (v5.0)
    pub subscription_id: Option<u32>,
}

/// One delivery target produced by [`SubscriptionTrie::search_client`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberMatch {
    pub client_id: Arc<str>,
    pub pipe: PipeId,
    /// Highest QoS among the client's matching subscriptions
    pub qos: QoS,
    pub retain_as_published: bool,
    pub subscription_ids: SmallVec<[u32; 2]>,
}

impl SubscriberMatch {
    fn merge(&mut self, other: &Subscriber) {
        self.qos = self.qos.max(other.options.qos);
        self.retain_as_published |= other.options.retain_as_published;
        if let Some(id) = other.subscription_id {
            if !self.subscription_ids.contains(&id) {
                self.subscription_ids.push(id);
            }
        }
    }
}

impl From<&Subscriber> for SubscriberMatch {
    fn from(sub: &Subscriber) -> Self {
        Self {
            client_id: sub.client_id.clone(),
            pipe: sub.pipe,
            qos: sub.options.qos,
            retain_as_published: sub.options.retain_as_published,
            subscription_ids: sub.subscription_id.into_iter().collect(),
        }
    }
}

/// Retained message owned by a topic node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedMessage {
    pub qos: QoS,
    pub publish: Arc<Publish>,
}

impl RetainedMessage {
    pub fn new(publish: Publish) -> Self {
        Self {
            qos: publish.qos,
            publish: Arc::new(publish),
        }
    }
}
