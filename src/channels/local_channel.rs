use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::select;
use tokio::sync::{mpsc, oneshot, Notify};

use crate::channels::error::{ChannelError, ChannelResult};


struct Poison {
    poisoned: AtomicBool,
    notify: Notify,
}

impl Poison {
    fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register before checking the flag so a concurrent poison() can not be missed
            notified.as_mut().enable();
            if self.is_poisoned() {
                return;
            }
            notified.await;
        }
    }
}

/// Poisons a local channel from outside, without owning either end
#[derive(Clone)]
pub struct PoisonHandle(Arc<Poison>);

impl PoisonHandle {
    /// Marks the channel as permanently rejecting. Both a blocked reader and a blocked writer
    ///  return with `ChannelError::Poisoned`.
    pub fn poison(&self) {
        self.0.poisoned.store(true, Ordering::Release);
        self.0.notify.notify_waiters();
    }

    pub fn is_poisoned(&self) -> bool {
        self.0.is_poisoned()
    }
}

/// A poisonable rendezvous channel: `write` returns only after a reader took the value.
pub fn local_channel<T: Send>() -> (LocalWriter<T>, LocalReader<T>) {
    let (send, recv) = mpsc::channel(1);
    let poison = Arc::new(Poison {
        poisoned: AtomicBool::new(false),
        notify: Notify::new(),
    });

    (
        LocalWriter { send, poison: poison.clone() },
        LocalReader { recv, poison },
    )
}

pub struct LocalWriter<T> {
    send: mpsc::Sender<(T, oneshot::Sender<()>)>,
    poison: Arc<Poison>,
}

impl<T: Send> LocalWriter<T> {
    pub fn poison_handle(&self) -> PoisonHandle {
        PoisonHandle(self.poison.clone())
    }

    pub async fn write(&self, value: T) -> ChannelResult<()> {
        if self.poison.is_poisoned() {
            return Err(ChannelError::Poisoned);
        }

        let (done_send, mut done_recv) = oneshot::channel();
        select! {
            biased;
            sent = self.send.send((value, done_send)) => {
                if sent.is_err() {
                    return Err(ChannelError::Poisoned);
                }
            }
            _ = self.poison.wait() => return Err(ChannelError::Poisoned),
        }

        // a value the reader already took counts as written, even if poison follows
        select! {
            biased;
            done = &mut done_recv => done.map_err(|_| ChannelError::Poisoned),
            _ = self.poison.wait() => Err(ChannelError::Poisoned),
        }
    }
}

pub struct LocalReader<T> {
    recv: mpsc::Receiver<(T, oneshot::Sender<()>)>,
    poison: Arc<Poison>,
}

impl<T: Send> LocalReader<T> {
    pub fn poison_handle(&self) -> PoisonHandle {
        PoisonHandle(self.poison.clone())
    }

    pub async fn read(&mut self) -> ChannelResult<T> {
        let (value, done) = select! {
            biased;
            _ = self.poison.wait() => return Err(ChannelError::Poisoned),
            item = self.recv.recv() => match item {
                Some(item) => item,
                None => return Err(ChannelError::Poisoned),
            },
        };
        // the writer may have given up in the meantime, which is fine
        done.send(()).ok();
        Ok(value)
    }
}
