//! Bounded double-ended priority queue with backpressure bands.
//!
//! Below the backpressure threshold everything is admitted. Between the
//! threshold and the cap only high-priority signals get in. High-priority
//! bypass admissions are always accepted, evicting exactly one
//! lowest-priority entry when the queue is full.

use crate::detectors::SignalCandidate;
use std::collections::BTreeMap;
use tracing::debug;
use uuid::Uuid;

/// Queue ordering key: higher score first, FIFO within a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    /// Negated milli-score so the BTreeMap's ascending order yields the
    /// highest score first.
    neg_score_milli: i64,
    seq: u64,
}

#[derive(Debug)]
pub struct QueuedSignal {
    pub candidate: SignalCandidate,
    pub priority_score: f64,
    pub enqueued_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted,
    /// Bypass admission; carries the id of the evicted entry if any.
    AcceptedBypass(Option<Uuid>),
    DroppedBackpressure,
    DroppedFull,
}

pub struct SignalQueue {
    entries: BTreeMap<QueueKey, QueuedSignal>,
    seq: u64,
    max_size: usize,
    backpressure_threshold: usize,
    high_threshold: f64,
    pub high_watermark: usize,
}

impl SignalQueue {
    pub fn new(max_size: usize, backpressure_threshold: usize, high_threshold: f64) -> Self {
        Self {
            entries: BTreeMap::new(),
            seq: 0,
            max_size: max_size.max(1),
            backpressure_threshold,
            high_threshold,
            high_watermark: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn offer(
        &mut self,
        candidate: SignalCandidate,
        priority_score: f64,
        bypass: bool,
        now_ms: i64,
    ) -> EnqueueOutcome {
        let len = self.entries.len();
        if !bypass {
            if len >= self.max_size {
                return EnqueueOutcome::DroppedFull;
            }
            if len >= self.backpressure_threshold && priority_score < self.high_threshold {
                debug!(
                    score = priority_score,
                    queue = len,
                    "backpressure drop"
                );
                return EnqueueOutcome::DroppedBackpressure;
            }
            self.insert(candidate, priority_score, now_ms);
            return EnqueueOutcome::Accepted;
        }

        // Bypass path: always admitted; a full queue sheds exactly one
        // lowest-priority entry.
        let evicted = if len >= self.max_size {
            self.entries.pop_last().map(|(_, v)| v.candidate.id)
        } else {
            None
        };
        self.insert(candidate, priority_score, now_ms);
        EnqueueOutcome::AcceptedBypass(evicted)
    }

    fn insert(&mut self, candidate: SignalCandidate, priority_score: f64, now_ms: i64) {
        let key = QueueKey {
            neg_score_milli: -(priority_score * 1_000.0) as i64,
            seq: self.seq,
        };
        self.seq += 1;
        self.entries.insert(
            key,
            QueuedSignal {
                candidate,
                priority_score,
                enqueued_ms: now_ms,
            },
        );
        self.high_watermark = self.high_watermark.max(self.entries.len());
    }

    /// Highest-priority entry, FIFO within equal priority.
    pub fn pop(&mut self) -> Option<QueuedSignal> {
        self.entries.pop_first().map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::SignalData;
    use crate::num::fixed::FixedPoint;
    use crate::types::{BookSide, Side, SignalType};

    fn candidate(conf: f64) -> SignalCandidate {
        SignalCandidate::new(
            SignalType::Absorption,
            Side::Sell,
            FixedPoint::from_int(89),
            FixedPoint::from_f64(conf),
            0,
            "absorption",
            SignalData::Absorption {
                efficiency: FixedPoint::ZERO,
                passive_ratio: FixedPoint::ZERO,
                dominant_side: BookSide::Bid,
                zone_confluence: 0,
                refill_boost_applied: false,
            },
        )
    }

    #[test]
    fn test_accepts_all_below_backpressure() {
        let mut q = SignalQueue::new(8, 4, 7.5);
        for _ in 0..4 {
            assert_eq!(q.offer(candidate(0.1), 1.0, false, 0), EnqueueOutcome::Accepted);
        }
        assert_eq!(q.len(), 4);
    }

    #[test]
    fn test_backpressure_band_requires_high_priority() {
        let mut q = SignalQueue::new(8, 2, 7.5);
        q.offer(candidate(0.5), 5.0, false, 0);
        q.offer(candidate(0.5), 5.0, false, 0);
        // Band engaged: low score dropped, high score admitted.
        assert_eq!(
            q.offer(candidate(0.5), 5.0, false, 0),
            EnqueueOutcome::DroppedBackpressure
        );
        assert_eq!(q.offer(candidate(0.9), 8.0, false, 0), EnqueueOutcome::Accepted);
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn test_full_queue_drops_normal_offers() {
        let mut q = SignalQueue::new(2, 1, 0.0);
        q.offer(candidate(0.5), 5.0, false, 0);
        q.offer(candidate(0.5), 5.0, false, 0);
        assert_eq!(q.offer(candidate(0.5), 9.9, false, 0), EnqueueOutcome::DroppedFull);
    }

    #[test]
    fn test_bypass_evicts_exactly_one_lowest() {
        let mut q = SignalQueue::new(2, 1, 7.5);
        q.offer(candidate(0.5), 5.0, false, 0);
        q.offer(candidate(0.9), 8.0, false, 0);
        let out = q.offer(candidate(0.95), 9.5, true, 0);
        assert!(matches!(out, EnqueueOutcome::AcceptedBypass(Some(_))));
        assert_eq!(q.len(), 2);
        // The survivor set is the two highest scores.
        assert!(q.pop().unwrap().priority_score >= 9.5 - f64::EPSILON);
        assert!(q.pop().unwrap().priority_score >= 8.0 - f64::EPSILON);
    }

    #[test]
    fn test_pop_order_is_priority_then_fifo() {
        let mut q = SignalQueue::new(8, 8, 7.5);
        q.offer(candidate(0.2), 5.0, false, 1);
        q.offer(candidate(0.3), 9.0, false, 2);
        q.offer(candidate(0.4), 5.0, false, 3);
        assert_eq!(q.pop().unwrap().enqueued_ms, 2);
        assert_eq!(q.pop().unwrap().enqueued_ms, 1);
        assert_eq!(q.pop().unwrap().enqueued_ms, 3);
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_size_never_exceeds_cap() {
        let mut q = SignalQueue::new(4, 2, 0.0);
        for i in 0..20 {
            q.offer(candidate(0.99), 9.0, i % 3 == 0, i as i64);
            assert!(q.len() <= 4);
        }
    }
}
