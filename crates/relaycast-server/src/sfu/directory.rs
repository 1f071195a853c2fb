//! Producer Directory
//!
//! Cross-session index of live producers. `consume` resolves producer ids
//! here, and teardown uses it to find consumers left dangling by a producer
//! that went away.

use relaycast_protocol::{MediaKind, RtpParameters};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// A consumer sourced from some producer, identified by its owning session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerRef {
    pub connection_id: Uuid,
    pub consumer_id: String,
}

/// What `consume` needs to know about a producer owned by another session
#[derive(Debug, Clone)]
pub struct ProducerSummary {
    pub owner: Uuid,
    pub kind: MediaKind,
    pub consumable_rtp_parameters: Arc<RtpParameters>,
}

struct ProducerRecord {
    summary: ProducerSummary,
    consumers: HashSet<ConsumerRef>,
}

#[derive(Default)]
pub struct ProducerDirectory {
    producers: RwLock<HashMap<String, ProducerRecord>>,
}

impl ProducerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, producer_id: String, summary: ProducerSummary) {
        self.producers.write().await.insert(
            producer_id,
            ProducerRecord {
                summary,
                consumers: HashSet::new(),
            },
        );
    }

    pub async fn lookup(&self, producer_id: &str) -> Option<ProducerSummary> {
        self.producers
            .read()
            .await
            .get(producer_id)
            .map(|record| record.summary.clone())
    }

    /// Record a consumer of `producer_id`. Returns false when the producer
    /// has been removed in the meantime.
    pub async fn attach_consumer(&self, producer_id: &str, consumer: ConsumerRef) -> bool {
        match self.producers.write().await.get_mut(producer_id) {
            Some(record) => {
                record.consumers.insert(consumer);
                true
            }
            None => false,
        }
    }

    pub async fn detach_consumer(&self, producer_id: &str, consumer: &ConsumerRef) {
        if let Some(record) = self.producers.write().await.get_mut(producer_id) {
            record.consumers.remove(consumer);
        }
    }

    /// Remove a producer, returning the consumers that depended on it
    pub async fn remove(&self, producer_id: &str) -> Vec<ConsumerRef> {
        self.producers
            .write()
            .await
            .remove(producer_id)
            .map(|record| record.consumers.into_iter().collect())
            .unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        self.producers.read().await.len()
    }
}
