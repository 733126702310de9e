//! Receive-side sequence diagnostics
//!
//! Sequence numbers never drive retransmission. The monitor only reports
//! gaps and reordering so they show up in the logs while debugging.

/// Classification of one observed sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceEvent {
    /// First datagram seen from this peer
    First,
    /// Exactly one past the previous datagram
    InOrder,
    /// Sequence numbers were skipped
    Gap { expected: u32, missing: u32 },
    /// Older than the last datagram seen
    Reordered { expected: u32 },
}

/// Tracks the sequence stream of one remote sender
#[derive(Debug, Clone)]
pub struct SequenceMonitor {
    peer: String,
    expected: Option<u32>,
    received: u64,
    gaps: u64,
    missing: u64,
    reordered: u64,
}

impl SequenceMonitor {
    pub fn new(peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            expected: None,
            received: 0,
            gaps: 0,
            missing: 0,
            reordered: 0,
        }
    }

    /// Record a received sequence number.
    ///
    /// Distances are taken modulo 2^32, so `0xFFFFFFFF -> 0` is in order.
    pub fn observe(&mut self, sequence: u32) -> SequenceEvent {
        self.received += 1;

        let Some(expected) = self.expected else {
            self.expected = Some(sequence.wrapping_add(1));
            return SequenceEvent::First;
        };

        let distance = sequence.wrapping_sub(expected);
        if distance == 0 {
            self.expected = Some(sequence.wrapping_add(1));
            SequenceEvent::InOrder
        } else if distance < (1 << 31) {
            self.gaps += 1;
            self.missing += distance as u64;
            self.expected = Some(sequence.wrapping_add(1));
            tracing::debug!(
                peer = %self.peer,
                "Sequence gap: expected {}, got {} ({} missing)",
                expected,
                sequence,
                distance
            );
            SequenceEvent::Gap {
                expected,
                missing: distance,
            }
        } else {
            self.reordered += 1;
            tracing::warn!(
                peer = %self.peer,
                "Out-of-order packet {} (expected {})",
                sequence,
                expected
            );
            SequenceEvent::Reordered { expected }
        }
    }

    /// Forget the stream position, e.g. after a reconnect
    pub fn reset(&mut self) {
        self.expected = None;
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn gaps(&self) -> u64 {
        self.gaps
    }

    /// Total sequence numbers skipped across all gaps
    pub fn missing(&self) -> u64 {
        self.missing
    }

    pub fn reordered(&self) -> u64 {
        self.reordered
    }
}
