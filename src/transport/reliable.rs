use std::collections::BTreeMap;

use bytes::Bytes;
use tracing::{debug, trace};


/// Sender side bookkeeping of the reliable channel: datagrams that were sent but not yet
///  acknowledged, and the debounce for retransmitting them.
///
/// Acks are cumulative, and the peer keeps acking its highest in-order sequence number. An ack
///  that trails the highest sent sequence number is 'stale' - either the peer is missing
///  something, or later datagrams are simply still in flight. Only after `threshold` stale acks
///  in a row are the trailing datagrams sent again.
pub struct PendingAcks {
    pending: BTreeMap<u32, Bytes>,
    highest_sent: Option<u32>,
    stale_acks: u32,
    threshold: u32,
}

impl PendingAcks {
    pub fn new(threshold: u32) -> PendingAcks {
        PendingAcks {
            pending: BTreeMap::new(),
            highest_sent: None,
            stale_acks: 0,
            threshold,
        }
    }

    pub fn on_sent(&mut self, seq: u32, datagram: Bytes) {
        self.pending.insert(seq, datagram);
        self.highest_sent = Some(seq);
    }

    /// Returns the datagrams that are due for retransmission, in sequence order
    pub fn on_ack(&mut self, acked_seq: u32) -> Vec<Bytes> {
        let Some(highest_sent) = self.highest_sent else {
            trace!("ack for {} before anything was sent - ignoring", acked_seq);
            return Vec::new();
        };

        // everything up to the acked sequence number arrived
        self.pending.retain(|&seq, _| seq > acked_seq);

        if acked_seq >= highest_sent {
            self.pending.clear();
            self.stale_acks = 0;
            return Vec::new();
        }

        self.stale_acks += 1;
        if self.stale_acks < self.threshold {
            trace!("stale ack {} of {} for {}", self.stale_acks, self.threshold, acked_seq);
            return Vec::new();
        }

        self.stale_acks = 0;
        let resend = std::mem::take(&mut self.pending)
            .into_values()
            .collect::<Vec<_>>();
        debug!("{} stale acks for {} - re-sending {} datagrams up to {}", self.threshold, acked_seq, resend.len(), highest_sent);
        resend
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    pub fn stale_acks(&self) -> u32 {
        self.stale_acks
    }
}
