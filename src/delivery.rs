//! Reliable unicast delivery.
//!
//! Each outbound unicast is registered as a [`PendingDelivery`] and armed
//! with a retransmission timer. Timers are not cancelled in place: each arm
//! gets a fresh generation number and a fired timer whose generation no
//! longer matches (acked, or superseded by a later arm) is ignored.
//!
//! Attempt accounting: one initial send plus up to `max_retries`
//! retransmissions. The timer that fires after the last retransmission gives
//! the delivery up.

use std::collections::HashMap;

use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::identity::NodeId;
use crate::messages::{Envelope, MessageId};

#[derive(Debug, Clone)]
pub struct PendingDelivery {
    pub message_id: MessageId,
    pub target: NodeId,
    pub envelope: Envelope,
    pub retry_count: u32,
    pub next_deadline: Instant,
    generation: u64,
    first_sent: Instant,
}

/// Instruction to schedule a timer for `message_id` after `delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Armed {
    pub message_id: MessageId,
    pub generation: u64,
    pub delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub message_id: MessageId,
    pub target: NodeId,
    pub retries: u32,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub enum TimerOutcome {
    /// Send `envelope` again and schedule `armed`.
    Retransmit { target: NodeId, envelope: Envelope, armed: Armed },
    /// Retries used up; the entry has been removed.
    Exhausted { message_id: MessageId, target: NodeId, retries: u32 },
    /// Stale or unknown timer.
    Ignored,
}

pub struct DeliveryTracker {
    base: Duration,
    cap: Duration,
    max_retries: u32,
    pending: HashMap<MessageId, PendingDelivery>,
    next_generation: u64,
}

impl DeliveryTracker {
    pub fn new(base: Duration, cap: Duration, max_retries: u32) -> Self {
        Self {
            base,
            cap: cap.max(base),
            max_retries,
            pending: HashMap::new(),
            next_generation: 0,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn get(&self, message_id: &MessageId) -> Option<&PendingDelivery> {
        self.pending.get(message_id)
    }

    /// `base * 2^retry`, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    pub fn register(&mut self, target: NodeId, envelope: Envelope, now: Instant) -> Armed {
        let message_id = envelope.id();
        let generation = self.next_generation();
        let delay = self.backoff(0);
        self.pending.insert(
            message_id,
            PendingDelivery {
                message_id,
                target,
                envelope,
                retry_count: 0,
                next_deadline: now + delay,
                generation,
                first_sent: now,
            },
        );
        Armed { message_id, generation, delay }
    }

    /// Acknowledgement received. Unknown ids are ignored.
    pub fn on_ack(&mut self, message_id: &MessageId, now: Instant) -> Option<Delivered> {
        let entry = self.pending.remove(message_id)?;
        debug!(msg_id = %message_id, retries = entry.retry_count, "delivery acknowledged");
        Some(Delivered {
            message_id: entry.message_id,
            target: entry.target,
            retries: entry.retry_count,
            elapsed: now.saturating_duration_since(entry.first_sent),
        })
    }

    pub fn on_timer(&mut self, message_id: &MessageId, generation: u64, now: Instant) -> TimerOutcome {
        let Some(entry) = self.pending.get(message_id) else {
            trace!(msg_id = %message_id, "timer for settled delivery");
            return TimerOutcome::Ignored;
        };
        if entry.generation != generation {
            return TimerOutcome::Ignored;
        }

        if entry.retry_count >= self.max_retries {
            let retries = entry.retry_count;
            let target = entry.target;
            self.pending.remove(message_id);
            debug!(msg_id = %message_id, retries, "delivery exhausted");
            return TimerOutcome::Exhausted {
                message_id: *message_id,
                target,
                retries,
            };
        }

        let retry = entry.retry_count + 1;
        let generation = self.next_generation();
        let delay = self.backoff(retry);
        let Some(entry) = self.pending.get_mut(message_id) else {
            return TimerOutcome::Ignored;
        };
        entry.retry_count = retry;
        entry.generation = generation;
        entry.next_deadline = now + delay;
        TimerOutcome::Retransmit {
            target: entry.target,
            envelope: entry.envelope.clone(),
            armed: Armed {
                message_id: *message_id,
                generation,
                delay,
            },
        }
    }

    /// Drop a delivery without reporting, e.g. on shutdown.
    pub fn cancel(&mut self, message_id: &MessageId) -> bool {
        self.pending.remove(message_id).is_some()
    }
}
