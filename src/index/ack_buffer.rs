use crate::messages::message::{ChannelIndex, Message, MessageBody};
use crate::node::node_id::NodeId;


/// Any number of acknowledgements for the same flow, merged into a single entry
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AckRecord {
    pub count: usize,
    /// the index the acks were sent from, i.e. the acknowledging channel
    pub source_index: ChannelIndex,
    pub source_node: Option<NodeId>,
}

impl AckRecord {
    fn is_same_flow(&self, msg: &Message) -> bool {
        self.source_index == msg.source_index && self.source_node == msg.source_node
    }
}

#[derive(Debug)]
pub enum Buffered {
    Message(Message),
    Acks(AckRecord),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BufferState {
    Empty,
    NonEmpty,
}

/// An unbounded FIFO of received messages that keeps acknowledgements from piling up: an `Ack`
///  arriving while the most recently enqueued entry is an ack record for the same flow only
///  increments that record's count.
///
/// Only the tail is ever merged into. Acks separated by other traffic stay separate entries, so
///  memory is bounded by the number of interleaved flows without ever scanning the buffer.
///
/// The ring grows by doubling and never shrinks.
pub struct AckCompactingBuffer {
    slots: Vec<Option<Buffered>>,
    first: usize,
    len: usize,
    /// physical slot of the ack record that further acks may be merged into
    compaction_slot: Option<usize>,
}

impl AckCompactingBuffer {
    pub fn new(initial_capacity: usize) -> AckCompactingBuffer {
        let mut slots = Vec::new();
        slots.resize_with(initial_capacity.max(1), || None);

        AckCompactingBuffer {
            slots,
            first: 0,
            len: 0,
            compaction_slot: None,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn state(&self) -> BufferState {
        if self.is_empty() {
            BufferState::Empty
        }
        else {
            BufferState::NonEmpty
        }
    }

    pub fn put(&mut self, msg: Message) {
        if !matches!(msg.body, MessageBody::Ack) {
            self.compaction_slot = None;
            self.push_back(Buffered::Message(msg));
            return;
        }

        if let Some(slot) = self.compaction_slot {
            if let Some(Buffered::Acks(record)) = &mut self.slots[slot] {
                if record.is_same_flow(&msg) {
                    record.count += 1;
                    return;
                }
            }
        }

        let slot = self.push_back(Buffered::Acks(AckRecord {
            count: 1,
            source_index: msg.source_index,
            source_node: msg.source_node,
        }));
        self.compaction_slot = Some(slot);
    }

    /// first phase of a two-phase take: look at the head without removing it
    pub fn start_get(&self) -> Option<&Buffered> {
        if self.is_empty() {
            return None;
        }
        self.slots[self.first].as_ref()
    }

    /// second phase of a two-phase take: remove the head that was returned by `start_get`
    pub fn end_get(&mut self) -> Option<Buffered> {
        if self.is_empty() {
            return None;
        }

        let slot = self.first;
        let result = self.slots[slot].take();

        if self.compaction_slot == Some(slot) {
            self.compaction_slot = None;
        }

        self.first = (self.first + 1) % self.slots.len();
        self.len -= 1;
        result
    }

    pub fn get(&mut self) -> Option<Buffered> {
        self.end_get()
    }

    /// returns the physical slot the entry was stored in
    fn push_back(&mut self, entry: Buffered) -> usize {
        if self.len == self.slots.len() {
            self.grow();
        }

        let slot = (self.first + self.len) % self.slots.len();
        self.slots[slot] = Some(entry);
        self.len += 1;
        slot
    }

    fn grow(&mut self) {
        let old_capacity = self.slots.len();
        let mut new_slots: Vec<Option<Buffered>> = Vec::with_capacity(2 * old_capacity);

        for i in 0..self.len {
            new_slots.push(self.slots[(self.first + i) % old_capacity].take());
        }
        new_slots.resize_with(2 * old_capacity, || None);

        self.slots = new_slots;
        self.first = 0;
        // NB: growing only happens when a new entry is appended, which replaces or clears the
        //      compaction slot anyway
        self.compaction_slot = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::serialized::SerializedObject;
    use rstest::rstest;

    fn ack(source: i64) -> Message {
        Message::new(ChannelIndex(1), ChannelIndex(source), MessageBody::Ack)
    }

    fn ack_from(source: i64, node: u64) -> Message {
        let mut msg = ack(source);
        msg.source_node = Some(NodeId { unique: node });
        msg
    }

    fn data(source: i64) -> Message {
        Message::data(ChannelIndex(1), ChannelIndex(source), SerializedObject::empty(), true)
    }

    fn ack_count(entry: Option<Buffered>) -> usize {
        match entry {
            Some(Buffered::Acks(record)) => record.count,
            other => panic!("expected an ack record, was {:?}", other),
        }
    }

    #[rstest]
    #[case::one(1)]
    #[case::two(2)]
    #[case::beyond_capacity(100)]
    fn test_consecutive_acks_are_compacted(#[case] n: usize) {
        let mut buf = AckCompactingBuffer::new(2);
        for _ in 0..n {
            buf.put(ack(5));
        }

        assert_eq!(buf.len(), 1);
        match buf.get() {
            Some(Buffered::Acks(record)) => {
                assert_eq!(record.count, n);
                assert_eq!(record.source_index, ChannelIndex(5));
            }
            other => panic!("expected an ack record, was {:?}", other),
        }
        assert_eq!(buf.state(), BufferState::Empty);
    }

    #[test]
    fn test_non_ack_separates_records() {
        let mut buf = AckCompactingBuffer::new(2);
        buf.put(ack(5));
        buf.put(ack(5));
        buf.put(data(7));
        buf.put(ack(5));

        assert_eq!(buf.len(), 3);
        assert_eq!(ack_count(buf.get()), 2);
        assert!(matches!(buf.get(), Some(Buffered::Message(_))));
        assert_eq!(ack_count(buf.get()), 1);
        assert!(buf.get().is_none());
    }

    #[rstest]
    #[case::different_index(ack(5), ack(6))]
    #[case::different_node(ack_from(5, 1), ack_from(5, 2))]
    fn test_different_flows_are_not_merged(#[case] first: Message, #[case] second: Message) {
        let mut buf = AckCompactingBuffer::new(4);
        buf.put(first);
        buf.put(second);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_dequeue_ends_compaction() {
        let mut buf = AckCompactingBuffer::new(4);
        buf.put(ack(5));
        buf.put(ack(5));
        assert_eq!(ack_count(buf.get()), 2);

        buf.put(ack(5));
        assert_eq!(buf.len(), 1);
        assert_eq!(ack_count(buf.get()), 1);
    }

    #[test]
    fn test_dequeue_of_other_entry_keeps_compaction() {
        let mut buf = AckCompactingBuffer::new(4);
        buf.put(data(7));
        buf.put(ack(5));
        assert!(matches!(buf.get(), Some(Buffered::Message(_))));

        buf.put(ack(5));
        assert_eq!(buf.len(), 1);
        assert_eq!(ack_count(buf.get()), 2);
    }

    #[test]
    fn test_two_phase_get() {
        let mut buf = AckCompactingBuffer::new(4);
        assert!(buf.start_get().is_none());

        buf.put(data(7));
        assert!(matches!(buf.start_get(), Some(Buffered::Message(_))));
        assert_eq!(buf.len(), 1);
        assert!(matches!(buf.end_get(), Some(Buffered::Message(_))));
        assert!(buf.end_get().is_none());
    }

    #[test]
    fn test_growth_keeps_fifo() {
        let mut buf = AckCompactingBuffer::new(2);
        // move the ring's start away from slot 0 so growth has to unwrap it
        buf.put(data(0));
        buf.put(data(0));
        buf.get();

        for i in 1..=5 {
            buf.put(data(i));
        }
        buf.put(ack(9));
        assert_eq!(buf.capacity(), 8);

        buf.put(ack(9));
        assert_eq!(buf.len(), 7);

        for i in 0..=5 {
            match buf.get() {
                Some(Buffered::Message(msg)) => assert_eq!(msg.source_index, ChannelIndex(i)),
                other => panic!("expected a message, was {:?}", other),
            }
        }
        assert_eq!(ack_count(buf.get()), 2);
        assert_eq!(buf.state(), BufferState::Empty);
    }
}
