use {
    super::rtp::RtpPacket,
    std::collections::BTreeMap,
};

/// Per-track RTP reorder buffer keyed on the extended (wrap-free)
/// sequence number.
///
/// A packet that arrives up to `window - 1` positions out of order is
/// re-sequenced; one that arrives `window + 1` late is dropped and
/// counted. Gaps left by genuinely lost packets are surfaced so the
/// session can NACK them.
pub struct JitterBuffer {
    window: usize,
    pending: BTreeMap<i64, RtpPacket>,
    next_expected: Option<i64>,
    highest_seen: i64,
    cycles: i64,
    last_raw_sequence: Option<u16>,
    pub late_drops: u64,
    pub duplicate_drops: u64,
    pub lost: u64,
}

impl JitterBuffer {
    #[must_use]
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            pending: BTreeMap::new(),
            next_expected: None,
            highest_seen: 0,
            cycles: 0,
            last_raw_sequence: None,
            late_drops: 0,
            duplicate_drops: 0,
            lost: 0,
        }
    }

    /// Extend the 16-bit sequence counter across wraps.
    fn extend(&mut self, sequence: u16) -> i64 {
        if let Some(last) = self.last_raw_sequence {
            let delta = i32::from(sequence) - i32::from(last);
            if delta < -32_768 {
                self.cycles += 1;
            } else if delta > 32_768 {
                self.cycles -= 1;
            }
        }
        self.last_raw_sequence = Some(sequence);
        (self.cycles << 16) | i64::from(sequence)
    }

    /// Insert one packet; in-order packets (and any this one unblocks)
    /// are appended to `ready`.
    pub fn push(&mut self, packet: RtpPacket, ready: &mut Vec<RtpPacket>) {
        let seq = self.extend(packet.sequence);
        if seq > self.highest_seen {
            self.highest_seen = seq;
        }

        if let Some(next) = self.next_expected {
            if seq < next {
                self.late_drops += 1;
                return;
            }
        }
        if self.pending.contains_key(&seq) {
            self.duplicate_drops += 1;
            return;
        }
        self.pending.insert(seq, packet);
        self.release(ready);
    }

    fn release(&mut self, ready: &mut Vec<RtpPacket>) {
        loop {
            let Some((&head, _)) = self.pending.first_key_value() else {
                return;
            };
            let deliver = match self.next_expected {
                // Contiguous with the last delivered packet.
                Some(next) if head == next => true,
                // The window slid past a hole: give up on the missing
                // packets and resume from the oldest we hold.
                Some(next) => {
                    if self.pending.len() > self.window {
                        self.lost += (head - next) as u64;
                        true
                    } else {
                        false
                    }
                }
                None => true,
            };
            if !deliver {
                return;
            }
            if let Some((seq, packet)) = self.pending.pop_first() {
                self.next_expected = Some(seq + 1);
                ready.push(packet);
            }
        }
    }

    /// Sequence numbers currently missing inside the window, for NACK.
    #[must_use]
    pub fn missing(&self) -> Vec<u16> {
        let Some(next) = self.next_expected else {
            return Vec::new();
        };
        let mut missing = Vec::new();
        let mut cursor = next;
        for &held in self.pending.keys() {
            while cursor < held {
                missing.push((cursor & 0xFFFF) as u16);
                cursor += 1;
            }
            cursor = held + 1;
        }
        missing
    }

    /// Flush everything held, in order (end of stream).
    pub fn flush(&mut self, ready: &mut Vec<RtpPacket>) {
        while let Some((seq, packet)) = self.pending.pop_first() {
            self.next_expected = Some(seq + 1);
            ready.push(packet);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn packet(sequence: u16) -> RtpPacket {
        RtpPacket {
            marker: false,
            payload_type: 96,
            sequence,
            timestamp: u32::from(sequence) * 3_000,
            ssrc: 1,
            payload: Bytes::from_static(b"p"),
        }
    }

    fn sequences(packets: &[RtpPacket]) -> Vec<u16> {
        packets.iter().map(|p| p.sequence).collect()
    }

    #[test]
    fn test_in_order_passthrough() {
        let mut buffer = JitterBuffer::new(8);
        let mut ready = Vec::new();
        for seq in 0..5u16 {
            buffer.push(packet(seq), &mut ready);
        }
        assert_eq!(sequences(&ready), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_reorder_within_window_delivered() {
        let mut buffer = JitterBuffer::new(8);
        let mut ready = Vec::new();
        buffer.push(packet(0), &mut ready);
        // 1 is late by window-1 positions: still delivered in order.
        for seq in [2u16, 3, 4, 5, 6, 7, 1] {
            buffer.push(packet(seq), &mut ready);
        }
        assert_eq!(sequences(&ready), vec![0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(buffer.lost, 0);
    }

    #[test]
    fn test_packet_beyond_window_dropped() {
        let window = 4;
        let mut buffer = JitterBuffer::new(window);
        let mut ready = Vec::new();
        buffer.push(packet(0), &mut ready);
        // Hole at 1; fill far enough that the window slides past it.
        for seq in [2u16, 3, 4, 5, 6] {
            buffer.push(packet(seq), &mut ready);
        }
        // 1 finally shows up window+1 out of order: too late.
        buffer.push(packet(1), &mut ready);
        assert_eq!(buffer.late_drops, 1);
        assert!(buffer.lost >= 1);
        let seqs = sequences(&ready);
        assert!(!seqs.contains(&1));
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        assert_eq!(seqs, sorted, "delivery must stay ordered");
    }

    #[test]
    fn test_sequence_wrap() {
        let mut buffer = JitterBuffer::new(8);
        let mut ready = Vec::new();
        for seq in [65_533u16, 65_534, 65_535, 0, 1, 2] {
            buffer.push(packet(seq), &mut ready);
        }
        assert_eq!(sequences(&ready), vec![65_533, 65_534, 65_535, 0, 1, 2]);
        assert_eq!(buffer.lost, 0);
    }

    #[test]
    fn test_missing_reported_for_nack() {
        let mut buffer = JitterBuffer::new(16);
        let mut ready = Vec::new();
        buffer.push(packet(10), &mut ready);
        buffer.push(packet(13), &mut ready);
        assert_eq!(buffer.missing(), vec![11, 12]);
    }

    #[test]
    fn test_duplicates_dropped() {
        let mut buffer = JitterBuffer::new(8);
        let mut ready = Vec::new();
        buffer.push(packet(5), &mut ready);
        buffer.push(packet(7), &mut ready);
        buffer.push(packet(7), &mut ready);
        assert_eq!(buffer.duplicate_drops, 1);
        // A duplicate of an already-delivered packet counts as late.
        buffer.push(packet(5), &mut ready);
        assert_eq!(buffer.late_drops, 1);
        assert_eq!(sequences(&ready), vec![5]);
    }
}
