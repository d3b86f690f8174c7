use std::collections::hash_map::Entry;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::channels::error::{ChannelError, ChannelResult};
use crate::index::inbox::Inbox;
use crate::link::LinkId;
use crate::messages::message::{ChannelIndex, Message, MessageBody, ReplySink};


/// Distinguishes plain network inputs from the reply channels that output ends use to receive
///  acknowledgements. Link loss is reported to the two kinds differently.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EntryKind {
    Input,
    /// `link` is the link the owning output end sends over, if it is bound to one
    Reply { link: Option<LinkId> },
}

struct TableEntry {
    inbox: Arc<Inbox>,
    kind: EntryKind,
    label: Option<String>,
}

struct TableState {
    entries: FxHashMap<ChannelIndex, TableEntry>,
    labels: FxHashMap<String, ChannelIndex>,
    next_index: i64,
}

/// How a link loss was fanned out
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct LinkLostFanOut {
    /// plain inputs that received a `LinkLost` notice
    pub inputs: usize,
    /// reply channels tracked against the lost link that were failed
    pub reply_channels: usize,
}

/// The per-node table of network addressable channel ends, mapping each live index (and
///  optionally a label) to the inbox that receives messages for it.
///
/// At most one live entry exists per index. Removing an entry poisons its inbox, so anything
///  still holding on to it gets rejected rather than delivered to a dead end.
pub struct IndexTable {
    state: RwLock<TableState>,
    inbox_capacity: usize,
}

impl IndexTable {
    pub fn new(inbox_capacity: usize) -> IndexTable {
        IndexTable {
            state: RwLock::new(TableState {
                entries: Default::default(),
                labels: Default::default(),
                next_index: 0,
            }),
            inbox_capacity,
        }
    }

    /// Registers a new channel end at the next free index. A label that is already in use fails
    ///  the call without allocating anything.
    pub async fn allocate(&self, label: Option<&str>, kind: EntryKind) -> ChannelResult<(ChannelIndex, Arc<Inbox>)> {
        let mut state = self.state.write().await;

        if let Some(label) = label {
            if state.labels.contains_key(label) {
                return Err(ChannelError::DuplicateLabel(label.to_string()));
            }
        }

        // indices wrap around after a very long time, so the counter may point at an index that
        //  is still in use
        let index = loop {
            let candidate = ChannelIndex(state.next_index);
            state.next_index = if state.next_index == i64::MAX { 0 } else { state.next_index + 1 };
            if !state.entries.contains_key(&candidate) {
                break candidate;
            }
        };

        let inbox = Arc::new(Inbox::new(self.inbox_capacity));
        if let Some(label) = label {
            state.labels.insert(label.to_string(), index);
        }
        state.entries.insert(index, TableEntry {
            inbox: inbox.clone(),
            kind,
            label: label.map(|l| l.to_string()),
        });

        debug!(?index, ?label, ?kind, "allocated channel index");
        Ok((index, inbox))
    }

    /// Registers a channel end at an explicitly chosen index, e.g. a well-known index agreed on
    ///  out of band.
    pub async fn reserve(&self, index: ChannelIndex, kind: EntryKind) -> ChannelResult<Arc<Inbox>> {
        if !index.is_valid() {
            return Err(ChannelError::IndexInUse(index));
        }

        let mut state = self.state.write().await;
        match state.entries.entry(index) {
            Entry::Occupied(_) => Err(ChannelError::IndexInUse(index)),
            Entry::Vacant(e) => {
                let inbox = Arc::new(Inbox::new(self.inbox_capacity));
                e.insert(TableEntry {
                    inbox: inbox.clone(),
                    kind,
                    label: None,
                });
                debug!(?index, ?kind, "reserved channel index");
                Ok(inbox)
            }
        }
    }

    pub async fn lookup(&self, index: ChannelIndex) -> Option<Arc<Inbox>> {
        self.state.read().await
            .entries.get(&index)
            .map(|e| e.inbox.clone())
    }

    pub async fn lookup_label(&self, label: &str) -> Option<(ChannelIndex, Arc<Inbox>)> {
        let state = self.state.read().await;
        let index = *state.labels.get(label)?;
        state.entries.get(&index)
            .map(|e| (index, e.inbox.clone()))
    }

    pub async fn label_of(&self, index: ChannelIndex) -> Option<String> {
        self.state.read().await
            .entries.get(&index)
            .and_then(|e| e.label.clone())
    }

    /// Removes the entry for `index`, but only if it is still the entry the caller registered:
    ///  a stale or repeated removal must not remove a newer entry that reuses the index.
    pub async fn remove(&self, index: ChannelIndex, expected: &Arc<Inbox>) -> bool {
        let removed = {
            let mut state = self.state.write().await;
            match state.entries.get(&index) {
                Some(entry) if Arc::ptr_eq(&entry.inbox, expected) => {
                    let entry = state.entries.remove(&index);
                    if let Some(label) = entry.as_ref().and_then(|e| e.label.as_ref()) {
                        state.labels.remove(label);
                    }
                    true
                }
                _ => false,
            }
        };

        if removed {
            expected.poison().await;
            debug!(?index, "removed channel index");
        }
        else {
            trace!(?index, "channel index was already removed");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.state.read().await
            .entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn entry_kind(&self, index: ChannelIndex) -> Option<EntryKind> {
        self.state.read().await
            .entries.get(&index)
            .map(|e| e.kind)
    }

    async fn snapshot(&self) -> Vec<(ChannelIndex, EntryKind, Arc<Inbox>)> {
        self.state.read().await
            .entries.iter()
            .map(|(&index, e)| (index, e.kind, e.inbox.clone()))
            .collect()
    }

    /// Puts a copy of `msg` into every plain input's inbox, returning the number of inputs that
    ///  accepted it. Entries removed while the broadcast is in progress are skipped.
    pub async fn broadcast(&self, msg: &Message) -> usize {
        let mut delivered = 0;
        for (index, kind, inbox) in self.snapshot().await {
            if kind != EntryKind::Input {
                continue;
            }

            let mut msg = msg.clone();
            msg.dest_index = index;
            if inbox.put(msg).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Fans out the loss of a link: plain inputs receive a `LinkLost` notice (acknowledged to
    ///  `reply_to`), and reply channels tracked against the lost link get the link-failure
    ///  callback instead. Reply channels bound to other links are left alone.
    pub async fn broadcast_link_lost(&self, link: LinkId, reply_to: Arc<dyn ReplySink>) -> LinkLostFanOut {
        let mut result = LinkLostFanOut::default();

        for (index, kind, inbox) in self.snapshot().await {
            match kind {
                EntryKind::Input => {
                    let mut msg = Message::new(index, ChannelIndex::INVALID, MessageBody::LinkLost { link });
                    msg.reply_to = Some(reply_to.clone());
                    if inbox.put(msg).await.is_ok() {
                        result.inputs += 1;
                    }
                }
                EntryKind::Reply { link: Some(l) } if l == link => {
                    inbox.fail_link(link).await;
                    result.reply_channels += 1;
                }
                EntryKind::Reply { .. } => {}
            }
        }

        debug!(%link, ?result, "fanned out link loss");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::ack_buffer::Buffered;
    use crate::messages::serialized::SerializedObject;
    use async_trait::async_trait;
    use rstest::rstest;
    use std::collections::BTreeSet;

    struct NoReply;
    #[async_trait]
    impl ReplySink for NoReply {
        async fn reply(&self, _msg: Message) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_allocate_is_unique() {
        let table = IndexTable::new(4);
        let mut live = BTreeSet::new();
        let mut inboxes = Vec::new();

        for round in 0..5 {
            for _ in 0..10 {
                let (index, inbox) = table.allocate(None, EntryKind::Input).await.unwrap();
                assert!(live.insert(index), "index {:?} allocated twice", index);
                inboxes.push((index, inbox));
            }
            // remove every other entry
            for (index, inbox) in inboxes.iter().skip(round % 2).step_by(2) {
                if live.remove(index) {
                    assert!(table.remove(*index, inbox).await);
                }
            }
            assert_eq!(table.len().await, live.len());
        }
    }

    #[tokio::test]
    async fn test_allocate_skips_occupied_after_wraparound() {
        let table = IndexTable::new(4);
        let (first, _) = table.allocate(None, EntryKind::Input).await.unwrap();
        assert_eq!(first, ChannelIndex(0));

        table.reserve(ChannelIndex(1), EntryKind::Input).await.unwrap();
        table.state.write().await.next_index = i64::MAX;

        let (a, _) = table.allocate(None, EntryKind::Input).await.unwrap();
        let (b, _) = table.allocate(None, EntryKind::Input).await.unwrap();
        assert_eq!(a, ChannelIndex(i64::MAX));
        assert_eq!(b, ChannelIndex(2));
    }

    #[tokio::test]
    async fn test_duplicate_label_has_no_side_effect() {
        let table = IndexTable::new(4);
        let (index, _) = table.allocate(Some("echo"), EntryKind::Input).await.unwrap();

        let next_before = table.state.read().await.next_index;
        assert_eq!(table.allocate(Some("echo"), EntryKind::Input).await.err().unwrap(), ChannelError::DuplicateLabel("echo".to_string()));
        assert_eq!(table.state.read().await.next_index, next_before);
        assert_eq!(table.len().await, 1);
        assert_eq!(table.lookup_label("echo").await.unwrap().0, index);
        assert_eq!(table.label_of(index).await.as_deref(), Some("echo"));
    }

    #[tokio::test]
    async fn test_remove_frees_label_and_poisons() {
        let table = IndexTable::new(4);
        let (index, inbox) = table.allocate(Some("echo"), EntryKind::Input).await.unwrap();

        assert!(table.remove(index, &inbox).await);
        assert!(inbox.is_poisoned().await);
        assert!(table.lookup(index).await.is_none());
        assert!(table.lookup_label("echo").await.is_none());

        // the label can be used again
        table.allocate(Some("echo"), EntryKind::Input).await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_remove_keeps_newer_entry() {
        let table = IndexTable::new(4);
        let (index, old_inbox) = table.allocate(None, EntryKind::Input).await.unwrap();
        assert!(table.remove(index, &old_inbox).await);

        let new_inbox = table.reserve(index, EntryKind::Input).await.unwrap();
        assert!(!table.remove(index, &old_inbox).await);
        assert!(!new_inbox.is_poisoned().await);
        assert!(Arc::ptr_eq(&table.lookup(index).await.unwrap(), &new_inbox));
    }

    #[rstest]
    #[case::occupied(ChannelIndex(0))]
    #[case::invalid(ChannelIndex::INVALID)]
    #[tokio::test]
    async fn test_reserve_rejected(#[case] index: ChannelIndex) {
        let table = IndexTable::new(4);
        table.allocate(None, EntryKind::Input).await.unwrap();
        assert_eq!(table.reserve(index, EntryKind::Input).await.err().unwrap(), ChannelError::IndexInUse(index));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_inputs_only() {
        let table = IndexTable::new(4);
        let (a, inbox_a) = table.allocate(None, EntryKind::Input).await.unwrap();
        let (_, inbox_b) = table.allocate(None, EntryKind::Input).await.unwrap();
        let (_, reply) = table.allocate(None, EntryKind::Reply { link: None }).await.unwrap();
        let (c, inbox_c) = table.allocate(None, EntryKind::Input).await.unwrap();
        table.remove(c, &inbox_c).await;

        let msg = Message::data(ChannelIndex::INVALID, ChannelIndex(99), SerializedObject::new(&1u64), false);
        assert_eq!(table.broadcast(&msg).await, 2);

        match inbox_a.try_get().await {
            Some(Buffered::Message(m)) => assert_eq!(m.dest_index, a),
            other => panic!("unexpected {:?}", other),
        }
        assert!(inbox_b.try_get().await.is_some());
        assert!(reply.try_get().await.is_none());
    }

    #[tokio::test]
    async fn test_link_lost_fan_out() {
        let table = IndexTable::new(4);
        let lost = LinkId::new_random();
        let other = LinkId::new_random();

        let (_, input_1) = table.allocate(None, EntryKind::Input).await.unwrap();
        let (_, input_2) = table.allocate(Some("x"), EntryKind::Input).await.unwrap();
        let (_, reply) = table.allocate(None, EntryKind::Reply { link: Some(lost) }).await.unwrap();
        let (_, other_reply) = table.allocate(None, EntryKind::Reply { link: Some(other) }).await.unwrap();

        let fan_out = table.broadcast_link_lost(lost, Arc::new(NoReply)).await;
        assert_eq!(fan_out, LinkLostFanOut { inputs: 2, reply_channels: 1 });

        for input in [&input_1, &input_2] {
            match input.try_get().await {
                Some(Buffered::Message(m)) => {
                    assert_eq!(m.body, MessageBody::LinkLost { link: lost });
                    assert!(m.reply_to.is_some());
                }
                other => panic!("unexpected {:?}", other),
            }
            assert!(input.try_get().await.is_none());
        }

        // the reply channel got the callback and no notice
        assert!(reply.try_get().await.is_none());
        assert_eq!(reply.get().await.unwrap_err(), ChannelError::LinkLost(lost));

        assert!(other_reply.try_get().await.is_none());
        assert!(!other_reply.is_poisoned().await);
    }
}
