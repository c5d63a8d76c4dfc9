//! # Reliability System
//!
//! Per-link sequence numbers, acknowledgement bitfields, RTT and bandwidth
//! estimation over an unreliable datagram channel.
//!
//! Every packet sent is stamped with the next local sequence. Every packet
//! header also carries the most recent remote sequence seen (`ack`) and a
//! 32-bit field whose bit `n` acknowledges `ack - 1 - n`. A sent packet is
//! considered delivered when any later header acknowledges it, and lost when
//! nothing has acknowledged it within `rtt_maximum`.
//!
//! State lives in four queues, each kept sorted by sequence with wraparound
//! taken into account, and each bounded by time rather than by count:
//!
//! | queue | contents | evicted after |
//! |---|---|---|
//! | sent | every packet sent | `rtt_maximum` |
//! | pending ack | sent, not yet acknowledged | `rtt_maximum` (counted lost) |
//! | received | packets received | 34 sequences behind the newest |
//! | acked | acknowledged packets | `2 * rtt_maximum` |

use std::collections::VecDeque;

/// Default wrap point of the sequence space
pub const DEFAULT_MAX_SEQUENCE: u32 = 0xFFFF_FFFF;

/// Default time a packet may stay unacknowledged before it counts as lost
pub const DEFAULT_RTT_MAXIMUM: f32 = 1.0;

const RECEIVED_WINDOW: u32 = 34;
const EPSILON: f32 = 0.001;
const RTT_SMOOTHING: f32 = 0.1;

/// True when `s1` is more recent than `s2` in a space wrapping after `max_sequence`
pub fn sequence_more_recent(s1: u32, s2: u32, max_sequence: u32) -> bool {
    let half = max_sequence / 2;
    (s1 > s2 && s1 - s2 <= half) || (s2 > s1 && s2 - s1 > half)
}

/// Bit of the ack field that acknowledges `sequence` relative to `ack`
///
/// `sequence` must be older than `ack`.
pub fn bit_index_for_sequence(sequence: u32, ack: u32, max_sequence: u32) -> u32 {
    debug_assert!(sequence != ack);
    debug_assert!(!sequence_more_recent(sequence, ack, max_sequence));
    if sequence > ack {
        // wrapped: ack is just past zero, sequence just below max
        ack.wrapping_add(max_sequence - sequence)
    } else {
        ack - 1 - sequence
    }
}

/// One entry of a packet queue
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacketData {
    pub sequence: u32,
    /// Seconds since the entry was queued
    pub time: f32,
    pub size: usize,
}

/// Deque of packets ordered oldest first
#[derive(Debug, Clone, Default)]
pub struct PacketQueue {
    entries: VecDeque<PacketData>,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn exists(&self, sequence: u32) -> bool {
        self.entries.iter().any(|p| p.sequence == sequence)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PacketData> {
        self.entries.iter()
    }

    /// Insert keeping the queue sorted oldest to newest
    pub fn insert_sorted(&mut self, packet: PacketData, max_sequence: u32) {
        let newer = |a: u32, b: u32| sequence_more_recent(a, b, max_sequence);
        match (self.entries.front(), self.entries.back()) {
            (None, _) | (_, None) => self.entries.push_back(packet),
            (Some(front), _) if !newer(packet.sequence, front.sequence) => {
                self.entries.push_front(packet)
            }
            (_, Some(back)) if newer(packet.sequence, back.sequence) => {
                self.entries.push_back(packet)
            }
            _ => {
                let position = self
                    .entries
                    .iter()
                    .position(|p| newer(p.sequence, packet.sequence))
                    .unwrap_or(self.entries.len());
                self.entries.insert(position, packet);
            }
        }
    }

    /// True when every adjacent pair is in order
    pub fn is_sorted(&self, max_sequence: u32) -> bool {
        self.entries
            .iter()
            .zip(self.entries.iter().skip(1))
            .all(|(a, b)| sequence_more_recent(b.sequence, a.sequence, max_sequence))
    }

    fn age(&mut self, dt: f32) {
        for packet in &mut self.entries {
            packet.time += dt;
        }
    }

    fn total_bytes(&self) -> usize {
        self.entries.iter().map(|p| p.size).sum()
    }
}

/// Reliability state for one link
#[derive(Debug, Clone)]
pub struct ReliabilitySystem {
    max_sequence: u32,
    local_sequence: u32,
    remote_sequence: u32,

    sent_packets: u32,
    recv_packets: u32,
    lost_packets: u32,
    acked_packets: u32,

    sent_bandwidth: f32,
    acked_bandwidth: f32,
    rtt: f32,
    rtt_maximum: f32,

    acks: Vec<u32>,

    sent_queue: PacketQueue,
    pending_ack_queue: PacketQueue,
    received_queue: PacketQueue,
    acked_queue: PacketQueue,
}

impl Default for ReliabilitySystem {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SEQUENCE)
    }
}

impl ReliabilitySystem {
    pub fn new(max_sequence: u32) -> Self {
        Self {
            max_sequence,
            local_sequence: 0,
            // nothing received yet: acks name the sequence just before zero
            remote_sequence: max_sequence,
            sent_packets: 0,
            recv_packets: 0,
            lost_packets: 0,
            acked_packets: 0,
            sent_bandwidth: 0.0,
            acked_bandwidth: 0.0,
            rtt: 0.0,
            rtt_maximum: DEFAULT_RTT_MAXIMUM,
            acks: Vec::new(),
            sent_queue: PacketQueue::new(),
            pending_ack_queue: PacketQueue::new(),
            received_queue: PacketQueue::new(),
            acked_queue: PacketQueue::new(),
        }
    }

    /// Builder-style override of `rtt_maximum`
    pub fn with_rtt_maximum(mut self, rtt_maximum: f32) -> Self {
        self.rtt_maximum = rtt_maximum;
        self
    }

    /// Forget everything; used on every connect and disconnect
    pub fn reset(&mut self) {
        *self = Self::new(self.max_sequence).with_rtt_maximum(self.rtt_maximum);
    }

    /// Record a packet of `size` bytes sent with the current local sequence
    pub fn packet_sent(&mut self, size: usize) {
        let sequence = self.local_sequence;
        if self.sent_queue.exists(sequence) {
            tracing::warn!(sequence, "Local sequence already in the sent queue");
        } else {
            let packet = PacketData {
                sequence,
                time: 0.0,
                size,
            };
            self.sent_queue.entries.push_back(packet);
            self.pending_ack_queue.entries.push_back(packet);
        }
        self.sent_packets = self.sent_packets.wrapping_add(1);
        self.local_sequence = if self.local_sequence >= self.max_sequence {
            0
        } else {
            self.local_sequence + 1
        };
    }

    /// Record a received packet; returns false when `sequence` was already seen
    pub fn packet_received(&mut self, sequence: u32, size: usize) -> bool {
        self.recv_packets = self.recv_packets.wrapping_add(1);
        if self.received_queue.exists(sequence) {
            return false;
        }
        self.received_queue.insert_sorted(
            PacketData {
                sequence,
                time: 0.0,
                size,
            },
            self.max_sequence,
        );
        if sequence_more_recent(sequence, self.remote_sequence, self.max_sequence) {
            self.remote_sequence = sequence;
        }
        true
    }

    /// Ack bitfield for the packets received before `remote_sequence`
    pub fn generate_ack_bits(&self) -> u32 {
        let ack = self.remote_sequence;
        let mut ack_bits = 0u32;
        for packet in self.received_queue.iter() {
            if packet.sequence == ack
                || sequence_more_recent(packet.sequence, ack, self.max_sequence)
            {
                break;
            }
            let bit = bit_index_for_sequence(packet.sequence, ack, self.max_sequence);
            if bit <= 31 {
                ack_bits |= 1 << bit;
            }
        }
        ack_bits
    }

    /// Apply an incoming `(ack, ack_bits)` pair to the pending queue
    pub fn process_ack(&mut self, ack: u32, ack_bits: u32) {
        let max_sequence = self.max_sequence;
        let mut still_pending = VecDeque::with_capacity(self.pending_ack_queue.len());
        for packet in self.pending_ack_queue.entries.drain(..) {
            let acked = if packet.sequence == ack {
                true
            } else if !sequence_more_recent(packet.sequence, ack, max_sequence) {
                let bit = bit_index_for_sequence(packet.sequence, ack, max_sequence);
                bit <= 31 && (ack_bits >> bit) & 1 == 1
            } else {
                false
            };

            if acked {
                self.rtt += (packet.time - self.rtt) * RTT_SMOOTHING;
                self.acked_queue.insert_sorted(packet, max_sequence);
                self.acks.push(packet.sequence);
                self.acked_packets = self.acked_packets.wrapping_add(1);
            } else {
                still_pending.push_back(packet);
            }
        }
        self.pending_ack_queue.entries = still_pending;
    }

    /// Sequences acknowledged since the last call (or the last `update`)
    pub fn take_acks(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.acks)
    }

    /// Sequences acknowledged during the current tick
    pub fn acks(&self) -> &[u32] {
        &self.acks
    }

    /// Advance time, evict expired entries and refresh the bandwidth estimates
    pub fn update(&mut self, dt: f32) {
        self.acks.clear();
        self.sent_queue.age(dt);
        self.pending_ack_queue.age(dt);
        self.received_queue.age(dt);
        self.acked_queue.age(dt);
        self.update_queues();
        self.update_stats();
    }

    fn update_queues(&mut self) {
        let rtt_maximum = self.rtt_maximum;

        while self
            .sent_queue
            .entries
            .front()
            .is_some_and(|p| p.time > rtt_maximum + EPSILON)
        {
            self.sent_queue.entries.pop_front();
        }

        if let Some(latest) = self.received_queue.entries.back().map(|p| p.sequence) {
            let minimum = if latest >= RECEIVED_WINDOW {
                latest - RECEIVED_WINDOW
            } else {
                // latest - RECEIVED_WINDOW taken modulo max_sequence + 1
                self.max_sequence - (RECEIVED_WINDOW - latest - 1)
            };
            while self
                .received_queue
                .entries
                .front()
                .is_some_and(|p| !sequence_more_recent(p.sequence, minimum, self.max_sequence))
            {
                self.received_queue.entries.pop_front();
            }
        }

        while self
            .acked_queue
            .entries
            .front()
            .is_some_and(|p| p.time > rtt_maximum * 2.0 - EPSILON)
        {
            self.acked_queue.entries.pop_front();
        }

        while self
            .pending_ack_queue
            .entries
            .front()
            .is_some_and(|p| p.time > rtt_maximum + EPSILON)
        {
            self.pending_ack_queue.entries.pop_front();
            self.lost_packets = self.lost_packets.wrapping_add(1);
        }
    }

    fn update_stats(&mut self) {
        let sent_bytes_per_second = self.sent_queue.total_bytes() as f32 / self.rtt_maximum;
        let acked_bytes_per_second = self.acked_queue.total_bytes() as f32 / self.rtt_maximum;
        self.sent_bandwidth = sent_bytes_per_second * (8.0 / 1000.0);
        self.acked_bandwidth = acked_bytes_per_second * (8.0 / 1000.0);
    }

    pub fn max_sequence(&self) -> u32 {
        self.max_sequence
    }

    /// Sequence the next sent packet will carry
    pub fn local_sequence(&self) -> u32 {
        self.local_sequence
    }

    /// Most recent sequence received
    pub fn remote_sequence(&self) -> u32 {
        self.remote_sequence
    }

    pub fn sent_packets(&self) -> u32 {
        self.sent_packets
    }

    pub fn received_packets(&self) -> u32 {
        self.recv_packets
    }

    pub fn lost_packets(&self) -> u32 {
        self.lost_packets
    }

    pub fn acked_packets(&self) -> u32 {
        self.acked_packets
    }

    /// Smoothed round trip time in seconds
    pub fn rtt(&self) -> f32 {
        self.rtt
    }

    pub fn rtt_maximum(&self) -> f32 {
        self.rtt_maximum
    }

    /// Outgoing bandwidth in kbps
    pub fn sent_bandwidth(&self) -> f32 {
        self.sent_bandwidth
    }

    /// Acknowledged bandwidth in kbps
    pub fn acked_bandwidth(&self) -> f32 {
        self.acked_bandwidth
    }

    pub fn sent_queue(&self) -> &PacketQueue {
        &self.sent_queue
    }

    pub fn pending_ack_queue(&self) -> &PacketQueue {
        &self.pending_ack_queue
    }

    pub fn received_queue(&self) -> &PacketQueue {
        &self.received_queue
    }

    pub fn acked_queue(&self) -> &PacketQueue {
        &self.acked_queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: u32 = DEFAULT_MAX_SEQUENCE;

    #[test]
    fn test_more_recent_wraps() {
        assert!(sequence_more_recent(1, 0, MAX));
        assert!(!sequence_more_recent(0, 1, MAX));
        assert!(sequence_more_recent(5, 0xFFFF_FFFE, MAX));
        assert!(!sequence_more_recent(5, 10, MAX));
        assert!(!sequence_more_recent(7, 7, MAX));
        assert!(sequence_more_recent(0, 255, 255));
    }

    #[test]
    fn test_bit_index() {
        assert_eq!(bit_index_for_sequence(99, 100, MAX), 0);
        assert_eq!(bit_index_for_sequence(90, 100, MAX), 9);
        assert_eq!(bit_index_for_sequence(MAX, 0, MAX), 0);
        assert_eq!(bit_index_for_sequence(MAX - 1, 1, MAX), 2);
        assert_eq!(bit_index_for_sequence(254, 2, 255), 3);
    }

    #[test]
    fn test_insert_sorted_with_wrap() {
        let mut queue = PacketQueue::new();
        for sequence in [253u32, 1, 255, 0, 254, 2] {
            queue.insert_sorted(
                PacketData {
                    sequence,
                    time: 0.0,
                    size: 0,
                },
                255,
            );
        }
        let order: Vec<u32> = queue.iter().map(|p| p.sequence).collect();
        assert_eq!(order, vec![253, 254, 255, 0, 1, 2]);
        assert!(queue.is_sorted(255));
    }

    #[test]
    fn test_sequence_wraps_at_max() {
        let mut system = ReliabilitySystem::new(3);
        for _ in 0..4 {
            system.packet_sent(10);
        }
        assert_eq!(system.local_sequence(), 0);
        assert_eq!(system.sent_packets(), 4);
    }

    #[test]
    fn test_fresh_link_acknowledges_nothing() {
        let mut sender = ReliabilitySystem::default();
        let receiver = ReliabilitySystem::default();
        sender.packet_sent(10);
        sender.process_ack(receiver.remote_sequence(), receiver.generate_ack_bits());
        assert!(sender.take_acks().is_empty());
        assert_eq!(sender.pending_ack_queue().len(), 1);
    }

    #[test]
    fn test_duplicate_receive() {
        let mut system = ReliabilitySystem::default();
        assert!(system.packet_received(3, 10));
        assert!(!system.packet_received(3, 10));
        assert_eq!(system.remote_sequence(), 3);
        assert_eq!(system.received_packets(), 2);
    }

    #[test]
    fn test_ack_bits_from_received() {
        let mut system = ReliabilitySystem::default();
        for sequence in [10u32, 8, 7, 3] {
            system.packet_received(sequence, 0);
        }
        assert_eq!(system.remote_sequence(), 10);
        let expected = (1 << 1) | (1 << 2) | (1 << 6);
        assert_eq!(system.generate_ack_bits(), expected);
    }

    #[test]
    fn test_process_ack_updates_rtt_and_counts() {
        let mut system = ReliabilitySystem::default();
        for _ in 0..5 {
            system.packet_sent(100);
        }
        system.update(0.05);
        system.process_ack(4, 0b0101);
        let mut acks = system.take_acks();
        acks.sort_unstable();
        assert_eq!(acks, vec![1, 3, 4]);
        assert_eq!(system.acked_packets(), 3);
        assert_eq!(system.pending_ack_queue().len(), 2);
        assert!(system.rtt() > 0.0);
        assert!(system.acked_queue().is_sorted(MAX));
    }

    #[test]
    fn test_unacked_packets_are_lost_after_rtt_maximum() {
        let mut system = ReliabilitySystem::default();
        system.packet_sent(50);
        system.packet_sent(50);
        system.update(0.5);
        assert_eq!(system.lost_packets(), 0);
        assert!(system.sent_bandwidth() > 0.0);
        system.update(0.6);
        assert_eq!(system.lost_packets(), 2);
        assert!(system.pending_ack_queue().is_empty());
        assert!(system.sent_queue().is_empty());
    }

    #[test]
    fn test_received_window_is_bounded() {
        let mut system = ReliabilitySystem::default();
        for sequence in 0..100u32 {
            system.packet_received(sequence, 0);
        }
        system.update(0.0);
        assert_eq!(system.received_queue().len(), 34);
        assert!(system.received_queue().iter().all(|p| p.sequence > 65));
    }

    #[test]
    fn test_received_window_same_size_across_wrap() {
        let mut system = ReliabilitySystem::new(255);
        for sequence in (200..=255u32).chain(0..=10) {
            system.packet_received(sequence, 0);
        }
        system.update(0.0);
        assert_eq!(system.received_queue().len(), 34);
        let oldest = system.received_queue().iter().next().map(|p| p.sequence);
        assert_eq!(oldest, Some(233));
    }

    #[test]
    fn test_reset_clears_state() {
        let mut system = ReliabilitySystem::default().with_rtt_maximum(2.0);
        system.packet_sent(1);
        system.packet_received(4, 1);
        system.reset();
        assert_eq!(system.local_sequence(), 0);
        assert_eq!(system.remote_sequence(), system.max_sequence());
        assert_eq!(system.sent_packets(), 0);
        assert_eq!(system.rtt_maximum(), 2.0);
    }
}
