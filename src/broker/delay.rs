//! Delay scheduler
//!
//! Delayed messages are parked in one bucket per delay level. Every bucket
//! has its own timer task; since all envelopes in a bucket share the same
//! delay, the bucket is a FIFO ordered by due time and the timer only ever
//! has to wait for its front entry. Released envelopes are handed to the
//! release callback, which feeds them back into normal dispatch.
//!
//! The pending queue is shared between `schedule` and the timer task and is
//! only touched under its mutex, so an envelope is released exactly once.
//! Dropping the scheduler stops every timer task; envelopes still parked are
//! discarded with it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::broker::message::{MAX_DELAY_LEVEL, MessageEnvelope};
use crate::utils::{MqError, Result};

/// Fixed mapping from delay level (1-based) to duration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayLadder {
    durations: Vec<Duration>,
}

impl DelayLadder {
    /// Parses a whitespace separated ladder such as `"1s 5s 10s 30s 1m 2h"`.
    /// Units: `s`, `m`, `h`, `d`.
    pub fn parse(levels: &str) -> Result<Self> {
        let durations = levels
            .split_whitespace()
            .map(parse_duration)
            .collect::<Result<Vec<_>>>()?;

        if durations.is_empty() {
            return Err(MqError::validation("delay ladder must have at least one level"));
        }
        if durations.len() > MAX_DELAY_LEVEL as usize {
            return Err(MqError::validation(format!(
                "delay ladder has {} levels, at most {MAX_DELAY_LEVEL} are supported",
                durations.len()
            )));
        }
        Ok(Self { durations })
    }

    pub fn duration(&self, level: u8) -> Option<Duration> {
        let index = usize::from(level).checked_sub(1)?;
        self.durations.get(index).copied()
    }

    pub fn max_level(&self) -> u8 {
        // bounded by MAX_DELAY_LEVEL in parse
        self.durations.len() as u8
    }
}

fn parse_duration(token: &str) -> Result<Duration> {
    let invalid = || MqError::validation(format!("invalid delay '{token}'"));

    let split = token
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(invalid)?;
    let (value, unit) = token.split_at(split);
    let value: u64 = value.parse().map_err(|_| invalid())?;

    let unit_secs: u64 = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        _ => return Err(invalid()),
    };
    let secs = value.checked_mul(unit_secs).ok_or_else(invalid)?;
    Ok(Duration::from_secs(secs))
}

type Release = Arc<dyn Fn(MessageEnvelope) + Send + Sync>;

struct DelayBucket {
    level: u8,
    pending: Mutex<VecDeque<(Instant, MessageEnvelope)>>,
    wakeup: Notify,
    stopped: AtomicBool,
}

impl DelayBucket {
    fn take_due(&self, now: Instant) -> Vec<MessageEnvelope> {
        let mut pending = self.pending.lock().unwrap();
        let mut ready = Vec::new();
        while pending.front().is_some_and(|(due, _)| *due <= now) {
            if let Some((_, envelope)) = pending.pop_front() {
                ready.push(envelope);
            }
        }
        ready
    }
}

pub struct DelayScheduler {
    ladder: DelayLadder,
    buckets: Mutex<HashMap<u8, Arc<DelayBucket>>>,
    release: Release,
}

impl DelayScheduler {
    pub fn new<F>(ladder: DelayLadder, release: F) -> Self
    where
        F: Fn(MessageEnvelope) + Send + Sync + 'static,
    {
        Self {
            ladder,
            buckets: Mutex::new(HashMap::new()),
            release: Arc::new(release),
        }
    }

    pub fn ladder(&self) -> &DelayLadder {
        &self.ladder
    }

    /// Parks `envelope` until the duration of `level` has elapsed.
    ///
    /// Must be called from within a Tokio runtime; the first call for a level
    /// spawns that level's timer task.
    pub fn schedule(&self, envelope: MessageEnvelope, level: u8) -> Result<()> {
        let delay = self.ladder.duration(level).ok_or_else(|| {
            MqError::validation(format!(
                "delay level {level} is outside 1..={}",
                self.ladder.max_level()
            ))
        })?;

        let bucket = self.bucket(level);
        let due = Instant::now() + delay;
        debug!(
            level,
            ?delay,
            topic = envelope.topic(),
            "parking delayed message"
        );
        bucket.pending.lock().unwrap().push_back((due, envelope));
        bucket.wakeup.notify_one();
        Ok(())
    }

    /// Number of envelopes still waiting in the bucket of `level`.
    pub fn pending(&self, level: u8) -> usize {
        self.buckets
            .lock()
            .unwrap()
            .get(&level)
            .map_or(0, |bucket| bucket.pending.lock().unwrap().len())
    }

    fn bucket(&self, level: u8) -> Arc<DelayBucket> {
        let mut buckets = self.buckets.lock().unwrap();
        buckets
            .entry(level)
            .or_insert_with(|| {
                let bucket = Arc::new(DelayBucket {
                    level,
                    pending: Mutex::new(VecDeque::new()),
                    wakeup: Notify::new(),
                    stopped: AtomicBool::new(false),
                });
                tokio::spawn(run_bucket(bucket.clone(), self.release.clone()));
                bucket
            })
            .clone()
    }
}

impl Drop for DelayScheduler {
    fn drop(&mut self) {
        for bucket in self.buckets.lock().unwrap().values() {
            bucket.stopped.store(true, Ordering::SeqCst);
            bucket.wakeup.notify_one();
        }
    }
}

async fn run_bucket(bucket: Arc<DelayBucket>, release: Release) {
    while !bucket.stopped.load(Ordering::SeqCst) {
        let next_due = bucket.pending.lock().unwrap().front().map(|(due, _)| *due);
        match next_due {
            None => bucket.wakeup.notified().await,
            Some(due) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(due) => {}
                    // a new entry or a stop request; re-check before sleeping again
                    _ = bucket.wakeup.notified() => continue,
                }
                for envelope in bucket.take_due(Instant::now()) {
                    trace!(level = bucket.level, topic = envelope.topic(), "releasing delayed message");
                    release(envelope);
                }
            }
        }
    }
    debug!(level = bucket.level, "delay bucket stopped");
}
