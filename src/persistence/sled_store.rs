use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sled::Db;
use tracing::{debug, warn};

use crate::broker::message::MessageEnvelope;
use crate::utils::Result;

/// An envelope that exhausted its redeliveries, as kept in the store.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DeadLetter {
    pub group: String,
    pub envelope: MessageEnvelope,
    /// Unix timestamp in seconds.
    pub dead_lettered_at: i64,
}

/// Name of the tree holding the dead letters of a consumer group.
pub fn dead_letter_tree(group: &str) -> String {
    format!("%DLQ%{group}")
}

#[derive(Clone)]
pub struct Persistence {
    db: Db,
    ttl_seconds: Option<i64>,
}

impl Persistence {
    pub fn open(path: impl AsRef<Path>, ttl_seconds: Option<i64>) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db, ttl_seconds })
    }

    /// A store that lives in memory and is discarded on drop.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self {
            db,
            ttl_seconds: None,
        })
    }

    pub fn store_dead_letter(&self, group: &str, envelope: &MessageEnvelope) -> Result<()> {
        let letter = DeadLetter {
            group: group.to_string(),
            envelope: envelope.clone(),
            dead_lettered_at: Utc::now().timestamp(),
        };

        let serialized = serde_json::to_vec(&letter)?;
        let tree = self.db.open_tree(dead_letter_tree(group))?;
        // monotonic ids keep insertion order and never collide
        let key = self.db.generate_id()?;
        tree.insert(key.to_be_bytes(), serialized)?;
        tree.flush()?;
        debug!(group, message_id = ?envelope.message_id(), "dead letter stored");
        Ok(())
    }

    /// Dead letters of `group`, oldest first. Expired entries are purged first.
    pub fn load_dead_letters(&self, group: &str) -> Result<Vec<DeadLetter>> {
        self.cleanup_old_dead_letters(group)?;
        let tree = self.db.open_tree(dead_letter_tree(group))?;

        let mut letters = Vec::new();
        for entry in tree.iter() {
            let (_, value) = entry?;
            match serde_json::from_slice(&value) {
                Ok(letter) => letters.push(letter),
                Err(e) => warn!(group, "skipping unreadable dead letter: {e}"),
            }
        }
        Ok(letters)
    }

    fn cleanup_old_dead_letters(&self, group: &str) -> Result<()> {
        let Some(ttl) = self.ttl_seconds else {
            return Ok(());
        };
        let expiry_time = Utc::now().timestamp() - ttl;

        let tree = self.db.open_tree(dead_letter_tree(group))?;
        let old_keys: Vec<_> = tree
            .iter()
            .filter_map(|res| res.ok())
            .filter_map(|(key, value)| {
                let letter: DeadLetter = serde_json::from_slice(&value).ok()?;
                (letter.dead_lettered_at < expiry_time).then_some(key)
            })
            .collect();

        for key in old_keys {
            tree.remove(key)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("db", &"sled::Db")
            .field("ttl_seconds", &self.ttl_seconds)
            .finish()
    }
}
