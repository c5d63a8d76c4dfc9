//! # Fragment Buffer
//!
//! Splits a payload too large for one packet into bounded fragments and
//! reassembles it on the other side.
//!
//! A buffer is single-use per transfer and is in exactly one of three states:
//! empty, sending or receiving. The sender tracks which packet sequences carried
//! which fragment so an acknowledgement can retire it; when the last fragment is
//! retired the buffer clears itself. The receiver copies fragments into their
//! slot of one contiguous allocation and is complete once every index arrived,
//! in any order.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{NetError, Result};

/// Fragment ids and counts travel as single bytes
pub const MAX_FRAGMENTS: usize = 255;

/// Identity of an inbound transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentSource {
    pub node_id: usize,
    pub transfer: u8,
}

#[derive(Debug)]
struct Sending {
    data: Vec<u8>,
    fragment_size: usize,
    fragment_count: usize,
    pending: BTreeSet<u8>,
    in_flight: BTreeMap<u32, u8>,
    cursor: usize,
}

#[derive(Debug)]
struct Receiving {
    source: FragmentSource,
    data: Vec<u8>,
    fragment_size: usize,
    fragment_count: usize,
    arrived: Vec<bool>,
    arrived_count: usize,
    total_len: Option<usize>,
}

#[derive(Debug, Default)]
enum State {
    #[default]
    Empty,
    Sending(Sending),
    Receiving(Receiving),
}

/// One fragmented transfer, outbound or inbound
#[derive(Debug, Default)]
pub struct FragmentBuffer {
    state: State,
}

/// Number of fragments `len` bytes need at `fragment_size` bytes each
pub fn fragment_count(len: usize, fragment_size: usize) -> usize {
    len.div_ceil(fragment_size).max(1)
}

impl FragmentBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.state, State::Empty)
    }

    pub fn is_sending(&self) -> bool {
        matches!(self.state, State::Sending(_))
    }

    pub fn is_receiving(&self) -> bool {
        matches!(self.state, State::Receiving(_))
    }

    /// Drop whatever transfer is in progress
    pub fn clear(&mut self) {
        self.state = State::Empty;
    }

    pub fn fragment_count(&self) -> usize {
        match &self.state {
            State::Empty => 0,
            State::Sending(s) => s.fragment_count,
            State::Receiving(r) => r.fragment_count,
        }
    }

    /// Take ownership of `data` for sending, returning the fragment count
    pub fn setup_send(&mut self, data: Vec<u8>, max_fragment_size: usize) -> Result<usize> {
        if !self.is_empty() {
            return Err(NetError::FragmentBusy);
        }
        let count = fragment_count(data.len(), max_fragment_size);
        if count > MAX_FRAGMENTS {
            return Err(NetError::TooManyFragments(count));
        }
        self.state = State::Sending(Sending {
            data,
            fragment_size: max_fragment_size,
            fragment_count: count,
            pending: (0..count as u8).collect(),
            in_flight: BTreeMap::new(),
            cursor: 0,
        });
        Ok(count)
    }

    /// Bytes of fragment `index` of the outbound payload
    pub fn fragment(&self, index: u8) -> Option<&[u8]> {
        match &self.state {
            State::Sending(s) if usize::from(index) < s.fragment_count => {
                let start = usize::from(index) * s.fragment_size;
                let end = (start + s.fragment_size).min(s.data.len());
                Some(&s.data[start..end])
            }
            _ => None,
        }
    }

    /// Next unacknowledged fragment, cycling round-robin
    pub fn next_fragment_to_send(&mut self) -> Option<u8> {
        let State::Sending(s) = &mut self.state else {
            return None;
        };
        let after = s.cursor as u8;
        let next = s
            .pending
            .range(after..)
            .next()
            .or_else(|| s.pending.iter().next())
            .copied()?;
        s.cursor = (usize::from(next) + 1) % s.fragment_count;
        Some(next)
    }

    /// Remember that packet `sequence` carried fragment `index`
    pub fn on_fragment_sent(&mut self, sequence: u32, index: u8) {
        if let State::Sending(s) = &mut self.state {
            s.in_flight.insert(sequence, index);
        }
    }

    /// Retire the fragment carried by `sequence`
    ///
    /// Returns true when this acknowledgement completed the transfer; the
    /// buffer is empty afterwards.
    pub fn on_packet_acked(&mut self, sequence: u32) -> bool {
        let State::Sending(s) = &mut self.state else {
            return false;
        };
        let Some(index) = s.in_flight.remove(&sequence) else {
            return false;
        };
        if s.pending.remove(&index) {
            s.in_flight.retain(|_, carried| *carried != index);
        }
        if s.pending.is_empty() {
            self.state = State::Empty;
            return true;
        }
        false
    }

    /// Fragments still waiting for an acknowledgement
    pub fn pending_fragments(&self) -> usize {
        match &self.state {
            State::Sending(s) => s.pending.len(),
            _ => 0,
        }
    }

    /// Prepare to assemble `fragment_count` fragments from `source`
    pub fn setup_receive(
        &mut self,
        source: FragmentSource,
        fragment_count: usize,
        max_fragment_size: usize,
    ) -> Result<()> {
        if fragment_count == 0 || fragment_count > MAX_FRAGMENTS {
            return Err(NetError::TooManyFragments(fragment_count));
        }
        self.state = State::Receiving(Receiving {
            source,
            data: vec![0u8; fragment_count * max_fragment_size],
            fragment_size: max_fragment_size,
            fragment_count,
            arrived: vec![false; fragment_count],
            arrived_count: 0,
            total_len: None,
        });
        Ok(())
    }

    /// Sender of the transfer being assembled
    pub fn source(&self) -> Option<FragmentSource> {
        match &self.state {
            State::Receiving(r) => Some(r.source),
            _ => None,
        }
    }

    /// Copy fragment `index` into place
    ///
    /// Every fragment but the last must be exactly the fragment size; the last
    /// may be shorter and fixes the payload length. Repeated fragments are
    /// ignored.
    pub fn on_fragment_received(&mut self, index: u8, bytes: &[u8]) -> Result<()> {
        let State::Receiving(r) = &mut self.state else {
            return Err(NetError::InvalidHeader);
        };
        let index = usize::from(index);
        if index >= r.fragment_count || bytes.len() > r.fragment_size {
            return Err(NetError::InvalidHeader);
        }
        let last = index == r.fragment_count - 1;
        if !last && bytes.len() != r.fragment_size {
            return Err(NetError::InvalidHeader);
        }
        if r.arrived[index] {
            return Ok(());
        }
        let start = index * r.fragment_size;
        r.data[start..start + bytes.len()].copy_from_slice(bytes);
        if last {
            r.total_len = Some(start + bytes.len());
        }
        r.arrived[index] = true;
        r.arrived_count += 1;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        matches!(&self.state, State::Receiving(r) if r.arrived_count == r.fragment_count)
    }

    /// Reassembled payload, clearing the buffer; `None` until complete
    pub fn take_payload(&mut self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        match std::mem::take(&mut self.state) {
            State::Receiving(mut r) => {
                let len = r.total_len.unwrap_or(r.data.len());
                r.data.truncate(len);
                Some(r.data)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: FragmentSource = FragmentSource {
        node_id: 1,
        transfer: 0,
    };

    #[test]
    fn test_fragment_count() {
        assert_eq!(fragment_count(1000, 100), 10);
        assert_eq!(fragment_count(1001, 100), 11);
        assert_eq!(fragment_count(1, 100), 1);
    }

    #[test]
    fn test_too_many_fragments() {
        let mut buffer = FragmentBuffer::new();
        assert!(matches!(
            buffer.setup_send(vec![0; 256 * 10], 10),
            Err(NetError::TooManyFragments(256))
        ));
        assert!(buffer.is_empty());
        assert_eq!(buffer.setup_send(vec![0; 255 * 10], 10).expect("fits"), 255);
    }

    #[test]
    fn test_busy_while_sending() {
        let mut buffer = FragmentBuffer::new();
        buffer.setup_send(vec![1; 30], 10).expect("setup");
        assert!(matches!(
            buffer.setup_send(vec![2; 30], 10),
            Err(NetError::FragmentBusy)
        ));
    }

    #[test]
    fn test_round_robin_skips_acked() {
        let mut buffer = FragmentBuffer::new();
        buffer.setup_send(vec![7; 25], 10).expect("setup");
        assert_eq!(buffer.fragment(2).map(<[u8]>::len), Some(5));

        let order: Vec<u8> = (0..4).filter_map(|_| buffer.next_fragment_to_send()).collect();
        assert_eq!(order, vec![0, 1, 2, 0]);

        buffer.on_fragment_sent(10, 1);
        assert!(!buffer.on_packet_acked(10));
        let order: Vec<u8> = (0..3).filter_map(|_| buffer.next_fragment_to_send()).collect();
        assert_eq!(order, vec![2, 0, 2]);
    }

    #[test]
    fn test_ack_retires_all_carrying_sequences() {
        let mut buffer = FragmentBuffer::new();
        buffer.setup_send(vec![0; 20], 10).expect("setup");
        buffer.on_fragment_sent(1, 0);
        buffer.on_fragment_sent(2, 1);
        buffer.on_fragment_sent(3, 0);
        assert!(!buffer.on_packet_acked(3));
        assert_eq!(buffer.pending_fragments(), 1);
        // Sequence 1 carried the already retired fragment 0.
        assert!(!buffer.on_packet_acked(1));
        assert!(buffer.on_packet_acked(2));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_reassembly_any_order() {
        let payload: Vec<u8> = (0..95u8).collect();
        let mut sender = FragmentBuffer::new();
        let count = sender.setup_send(payload.clone(), 10).expect("setup");

        let mut receiver = FragmentBuffer::new();
        receiver.setup_receive(SOURCE, count, 10).expect("receive");
        for index in (0..count as u8).rev() {
            assert!(!receiver.is_complete());
            let bytes = sender.fragment(index).expect("fragment").to_vec();
            receiver.on_fragment_received(index, &bytes).expect("copy");
        }
        assert!(receiver.is_complete());
        assert_eq!(receiver.take_payload(), Some(payload));
        assert!(receiver.is_empty());
    }

    #[test]
    fn test_malformed_fragments_rejected() {
        let mut receiver = FragmentBuffer::new();
        receiver.setup_receive(SOURCE, 3, 10).expect("receive");
        assert!(receiver.on_fragment_received(3, &[0; 10]).is_err());
        assert!(receiver.on_fragment_received(0, &[0; 9]).is_err());
        assert!(receiver.on_fragment_received(2, &[0; 11]).is_err());
        assert_eq!(receiver.source(), Some(SOURCE));
    }
}
