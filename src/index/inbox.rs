use tokio::sync::{Mutex, Notify};
use tracing::trace;

use crate::channels::error::{ChannelError, ChannelResult};
use crate::index::ack_buffer::{AckCompactingBuffer, BufferState, Buffered};
use crate::link::LinkId;
use crate::messages::message::Message;


struct InboxState {
    buffer: AckCompactingBuffer,
    poisoned: bool,
    link_failure: Option<LinkId>,
}

/// The receiving side of a network addressable channel end as the index table sees it: incoming
///  messages are buffered here until the owning endpoint (a delivery process or a writer waiting
///  for its reply) takes them.
///
/// An inbox has a single consumer at any time. Producers never block.
pub struct Inbox {
    state: Mutex<InboxState>,
    notify: Notify,
}

impl Inbox {
    pub fn new(initial_capacity: usize) -> Inbox {
        Inbox {
            state: Mutex::new(InboxState {
                buffer: AckCompactingBuffer::new(initial_capacity),
                poisoned: false,
                link_failure: None,
            }),
            notify: Notify::new(),
        }
    }

    /// Buffers a message, handing it back if the inbox is poisoned. The caller is then
    ///  responsible for rejecting it.
    pub async fn put(&self, msg: Message) -> Result<(), Message> {
        {
            let mut state = self.state.lock().await;
            if state.poisoned {
                trace!("inbox is poisoned - rejecting {:?}", msg);
                return Err(msg);
            }
            state.buffer.put(msg);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Waits for the next buffered entry. Entries that were buffered before the inbox was
    ///  poisoned or its link failed are still returned before the failure is reported.
    ///
    /// NB: this is cancellation safe - an entry is removed from the buffer only when it is
    ///      returned
    pub async fn get(&self) -> ChannelResult<Buffered> {
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(entry) = state.buffer.get() {
                    return Ok(entry);
                }
                if let Some(link) = state.link_failure {
                    return Err(ChannelError::LinkLost(link));
                }
                if state.poisoned {
                    return Err(ChannelError::Poisoned);
                }
            }
            self.notify.notified().await;
        }
    }

    /// non-blocking take, used for draining an inbox after it was poisoned
    pub async fn try_get(&self) -> Option<Buffered> {
        self.state.lock().await
            .buffer.get()
    }

    pub async fn state(&self) -> BufferState {
        self.state.lock().await
            .buffer.state()
    }

    /// Marks the inbox as permanently rejecting. This can not be undone.
    pub async fn poison(&self) {
        self.state.lock().await
            .poisoned = true;
        self.notify.notify_one();
    }

    pub async fn is_poisoned(&self) -> bool {
        self.state.lock().await
            .poisoned
    }

    /// The link-failure callback for reply channels: a consumer waiting for a reply that can no
    ///  longer arrive is woken up with `LinkLost`.
    pub async fn fail_link(&self, link: LinkId) {
        self.state.lock().await
            .link_failure = Some(link);
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::message::{ChannelIndex, MessageBody};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    fn ack() -> Message {
        Message::new(ChannelIndex(1), ChannelIndex(2), MessageBody::Ack)
    }

    #[tokio::test]
    async fn test_get_waits_for_put() {
        let inbox = Arc::new(Inbox::new(4));

        let inbox2 = inbox.clone();
        let consumer = tokio::spawn(async move { inbox2.get().await });

        tokio::task::yield_now().await;
        inbox.put(ack()).await.unwrap();

        let entry = timeout(Duration::from_secs(1), consumer).await.unwrap().unwrap().unwrap();
        assert!(matches!(entry, Buffered::Acks(_)));
    }

    #[tokio::test]
    async fn test_poisoned_rejects_but_drains() {
        let inbox = Inbox::new(4);
        inbox.put(ack()).await.unwrap();
        inbox.poison().await;

        let rejected = inbox.put(ack()).await.unwrap_err();
        assert_eq!(rejected.body, MessageBody::Ack);

        assert!(matches!(inbox.get().await, Ok(Buffered::Acks(_))));
        assert_eq!(inbox.get().await.unwrap_err(), ChannelError::Poisoned);
        assert!(inbox.try_get().await.is_none());
    }

    #[tokio::test]
    async fn test_link_failure_wakes_waiting_consumer() {
        let inbox = Arc::new(Inbox::new(4));
        let link = LinkId::new_random();

        let inbox2 = inbox.clone();
        let consumer = tokio::spawn(async move { inbox2.get().await });

        tokio::task::yield_now().await;
        inbox.fail_link(link).await;

        let result = timeout(Duration::from_secs(1), consumer).await.unwrap().unwrap();
        assert_eq!(result.unwrap_err(), ChannelError::LinkLost(link));
    }

    #[tokio::test]
    async fn test_buffered_reply_wins_over_link_failure() {
        let inbox = Inbox::new(4);
        inbox.put(ack()).await.unwrap();
        inbox.fail_link(LinkId::new_random()).await;

        assert!(matches!(inbox.get().await, Ok(Buffered::Acks(_))));
        assert!(matches!(inbox.get().await, Err(ChannelError::LinkLost(_))));
    }
}
