//! Subscription registry
//!
//! Owns every active subscription for the lifetime of the broker.
//!
//! - CLUSTERING subscriptions with the same (topic, group) form one consumer
//!   group; each message is handed to exactly one member. Ordered groups pick
//!   the member by partition key so a key always lands on the same member,
//!   concurrent groups rotate.
//! - BROADCAST subscriptions each receive every matching message.
//! - Ordered and concurrent consumers of one group are mutually exclusive, as
//!   are clustering and broadcast consumers sharing a group name.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::broker::delivery::{
    ActiveSubscription, DeliveryPolicy, DeliveryStatsSnapshot, SubscriptionId,
};
use crate::broker::message::MessageEnvelope;
use crate::client::subscription::{ConsumeMode, MessageModel, Subscription};
use crate::persistence::Persistence;
use crate::utils::{MqError, Result};

/// Returned by `subscribe`; pass it back to `unsubscribe` to tear the subscription down.
#[derive(Clone)]
pub struct RegistrationHandle {
    subscription: Arc<ActiveSubscription>,
}

impl RegistrationHandle {
    pub fn id(&self) -> SubscriptionId {
        self.subscription.id()
    }

    pub fn topic(&self) -> &str {
        self.subscription.topic()
    }

    pub fn group(&self) -> &str {
        self.subscription.group()
    }

    pub fn stats(&self) -> DeliveryStatsSnapshot {
        self.subscription.stats()
    }

    pub fn open_lanes(&self) -> usize {
        self.subscription.open_lanes()
    }
}

impl std::fmt::Debug for RegistrationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationHandle")
            .field("id", &self.id())
            .field("topic", &self.topic())
            .field("group", &self.group())
            .finish()
    }
}

#[derive(Default)]
struct ClusterGroup {
    mode: ConsumeMode,
    members: Vec<Arc<ActiveSubscription>>,
    cursor: usize,
}

impl ClusterGroup {
    fn pick(&mut self, envelope: &MessageEnvelope) -> Option<Arc<ActiveSubscription>> {
        let candidates: Vec<_> = self
            .members
            .iter()
            .filter(|member| member.matches(envelope))
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let index = match (self.mode, envelope.partition_key()) {
            (ConsumeMode::Ordered, Some(key)) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % candidates.len() as u64) as usize
            }
            (ConsumeMode::Ordered, None) => 0,
            (ConsumeMode::Concurrent, _) => {
                self.cursor = self.cursor.wrapping_add(1);
                self.cursor % candidates.len()
            }
        };
        Some(candidates[index].clone())
    }
}

#[derive(Default)]
struct RegistryState {
    next_id: SubscriptionId,
    /// topic -> group -> members
    clustering: HashMap<String, HashMap<String, ClusterGroup>>,
    /// topic -> subscribers
    broadcast: HashMap<String, Vec<Arc<ActiveSubscription>>>,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    state: Mutex<RegistryState>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(
        &self,
        subscription: Subscription,
        policy: DeliveryPolicy,
        dead_letters: Persistence,
    ) -> Result<RegistrationHandle> {
        let mut state = self.state.lock().unwrap();
        let topic = subscription.topic.clone();
        let group = subscription.group.clone();

        let conflict = match subscription.model {
            MessageModel::Clustering => {
                let mode_differs = state
                    .clustering
                    .get(&topic)
                    .and_then(|groups| groups.get(&group))
                    .is_some_and(|existing| existing.mode != subscription.mode);
                mode_differs || state.has_broadcast_group(&topic, &group)
            }
            MessageModel::Broadcast => state
                .clustering
                .get(&topic)
                .is_some_and(|groups| groups.contains_key(&group)),
        };
        if conflict {
            return Err(MqError::DuplicateSubscription { topic, group });
        }

        state.next_id += 1;
        let id = state.next_id;
        let model = subscription.model;
        let mode = subscription.mode;
        let active = ActiveSubscription::new(id, subscription, policy, dead_letters);

        match model {
            MessageModel::Clustering => {
                let cluster = state
                    .clustering
                    .entry(topic.clone())
                    .or_default()
                    .entry(group.clone())
                    .or_insert_with(|| ClusterGroup {
                        mode,
                        ..Default::default()
                    });
                cluster.members.push(active.clone());
            }
            MessageModel::Broadcast => {
                state
                    .broadcast
                    .entry(topic.clone())
                    .or_default()
                    .push(active.clone());
            }
        }

        info!(id, topic, group, ?model, ?mode, "subscription registered");
        Ok(RegistrationHandle {
            subscription: active,
        })
    }

    /// Detaches the subscription so no new envelope is routed to it.
    pub(crate) fn remove(&self, handle: &RegistrationHandle) -> Option<Arc<ActiveSubscription>> {
        let id = handle.id();
        let topic = handle.topic().to_string();
        let mut state = self.state.lock().unwrap();

        let mut removed = None;
        if let Some(groups) = state.clustering.get_mut(&topic) {
            for cluster in groups.values_mut() {
                if let Some(pos) = cluster.members.iter().position(|m| m.id() == id) {
                    removed = Some(cluster.members.remove(pos));
                }
            }
            groups.retain(|_, cluster| !cluster.members.is_empty());
            if groups.is_empty() {
                state.clustering.remove(&topic);
            }
        }
        if removed.is_none() {
            if let Some(subscribers) = state.broadcast.get_mut(&topic) {
                if let Some(pos) = subscribers.iter().position(|s| s.id() == id) {
                    removed = Some(subscribers.remove(pos));
                }
                if subscribers.is_empty() {
                    state.broadcast.remove(&topic);
                }
            }
        }
        removed
    }

    /// Every subscription that should receive `envelope`.
    pub(crate) fn targets(&self, envelope: &MessageEnvelope) -> Vec<Arc<ActiveSubscription>> {
        let mut state = self.state.lock().unwrap();
        let mut targets = Vec::new();

        if let Some(groups) = state.clustering.get_mut(envelope.topic()) {
            targets.extend(groups.values_mut().filter_map(|cluster| cluster.pick(envelope)));
        }
        if let Some(subscribers) = state.broadcast.get(envelope.topic()) {
            targets.extend(subscribers.iter().filter(|s| s.matches(envelope)).cloned());
        }
        targets
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock().unwrap();
        let clustered: usize = state
            .clustering
            .values()
            .flat_map(|groups| groups.values())
            .map(|cluster| cluster.members.len())
            .sum();
        let broadcast: usize = state.broadcast.values().map(Vec::len).sum();
        clustered + broadcast
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RegistryState {
    fn has_broadcast_group(&self, topic: &str, group: &str) -> bool {
        self.broadcast
            .get(topic)
            .is_some_and(|subscribers| subscribers.iter().any(|s| s.group() == group))
    }
}
