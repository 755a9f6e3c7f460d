//! Sliding-window flow control for the sending side.

use std::collections::BTreeMap;

use filexfer_transfer::AckSet;
use tokio::time::Instant;

use crate::config::RetryPolicy;

/// A chunk ran out of retransmissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("chunk {index} exhausted {attempts} attempts")]
pub struct RetryExhausted {
    pub index: u64,
    /// Total sends of the chunk, including the first.
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    sent_at: Instant,
    deadline: Instant,
    retries: u32,
}

/// Bounds the chunks in flight and schedules retransmissions.
///
/// Every outstanding index has been sent and not acknowledged. A slot
/// is freed only by an acknowledgment; retransmissions reuse the slot of
/// the chunk they resend.
#[derive(Debug)]
pub struct FlowController {
    window: usize,
    acked: AckSet,
    next_index: u64,
    outstanding: BTreeMap<u64, InFlight>,
    policy: RetryPolicy,
    highest_sent: Option<u64>,
    retransmissions: u64,
}

impl FlowController {
    /// Creates a controller for `total` chunks with `0..cursor` already
    /// held by the receiver.
    pub fn new(total: u64, cursor: u64, window: usize, policy: RetryPolicy) -> Self {
        let cursor = cursor.min(total);
        Self {
            window: window.max(1),
            acked: AckSet::with_prefix(total, cursor),
            next_index: cursor,
            outstanding: BTreeMap::new(),
            policy,
            highest_sent: None,
            retransmissions: 0,
        }
    }

    /// Claims a free slot for the next chunk that has never been sent.
    pub fn next_to_send(&mut self, now: Instant) -> Option<u64> {
        if self.outstanding.len() >= self.window {
            return None;
        }
        let index = self.acked.next_missing(self.next_index)?;
        self.next_index = index + 1;
        self.outstanding.insert(
            index,
            InFlight {
                sent_at: now,
                deadline: now + self.policy.timeout_for(0),
                retries: 0,
            },
        );
        self.highest_sent = Some(self.highest_sent.map_or(index, |h| h.max(index)));
        Some(index)
    }

    /// Records an acknowledgment for `index` plus every index below
    /// `cursor`. Returns how many chunks became newly acknowledged.
    pub fn on_ack(&mut self, index: u64, cursor: u64) -> u64 {
        let before = self.acked.count();
        let cursor = cursor.min(self.acked.total());
        for i in self.acked.cursor()..cursor {
            self.acked.insert(i);
        }
        self.acked.insert(index);
        let acked = &self.acked;
        self.outstanding.retain(|i, _| !acked.contains(*i));
        self.acked.count() - before
    }

    /// Handles a negative acknowledgment. Returns `Ok(true)` when the chunk
    /// must be resent now.
    pub fn on_nack(&mut self, index: u64, now: Instant) -> Result<bool, RetryExhausted> {
        let max_retries = self.policy.max_retries;
        let Some(entry) = self.outstanding.get_mut(&index) else {
            return Ok(false);
        };
        entry.retries += 1;
        if entry.retries > max_retries {
            return Err(RetryExhausted {
                index,
                attempts: entry.retries,
            });
        }
        entry.sent_at = now;
        entry.deadline = now + self.policy.timeout_for(entry.retries);
        self.retransmissions += 1;
        Ok(true)
    }

    /// Returns the outstanding indices whose timeout elapsed, rescheduling
    /// each for retransmission.
    pub fn poll_expired(&mut self, now: Instant) -> Result<Vec<u64>, RetryExhausted> {
        let mut expired = Vec::new();
        for (&index, entry) in self.outstanding.iter_mut() {
            if entry.deadline > now {
                continue;
            }
            entry.retries += 1;
            if entry.retries > self.policy.max_retries {
                return Err(RetryExhausted {
                    index,
                    attempts: entry.retries,
                });
            }
            entry.sent_at = now;
            entry.deadline = now + self.policy.timeout_for(entry.retries);
            expired.push(index);
        }
        self.retransmissions += expired.len() as u64;
        Ok(expired)
    }

    /// Earliest retransmission deadline, if anything is in flight.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.outstanding.values().map(|e| e.deadline).min()
    }

    pub fn is_complete(&self) -> bool {
        self.acked.is_complete()
    }

    pub fn cursor(&self) -> u64 {
        self.acked.cursor()
    }

    pub fn acked_count(&self) -> u64 {
        self.acked.count()
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn highest_sent(&self) -> Option<u64> {
        self.highest_sent
    }

    pub fn retransmissions(&self) -> u64 {
        self.retransmissions
    }

    /// Time since `index` was last sent.
    pub fn age(&self, index: u64, now: Instant) -> Option<std::time::Duration> {
        self.outstanding
            .get(&index)
            .map(|e| now.saturating_duration_since(e.sent_at))
    }
}
