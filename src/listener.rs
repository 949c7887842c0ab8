//! Fan-out of received [Message]s to filtered subscribers.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::channel::mpsc::{channel, Receiver, Sender, TryRecvError};
use futures::stream::{FusedStream, Stream};
use log::trace;
use parking_lot::Mutex;

use crate::message::{Address, Command, Message, MessageType};

/// Opaque handle naming one subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Which messages a subscription wants. `None` and an empty command list
/// match anything.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Filter {
    pub from: Option<Address>,
    pub message_type: Option<MessageType>,
    pub commands: Vec<Command>,
}

impl Filter {
    pub fn matches(&self, message: &Message) -> bool {
        if let Some(from) = self.from {
            if message.from != from {
                return false;
            }
        }

        if let Some(message_type) = self.message_type {
            if message.flags.message_type() != message_type {
                return false;
            }
        }

        self.commands.is_empty()
            || self
                .commands
                .iter()
                .any(|command| command.matches(&message.command))
    }
}

struct Entry {
    id: ListenerId,
    filter: Filter,
    sender: Sender<Message>,
}

/// The set of live subscriptions. Delivery never blocks: a subscriber whose
/// queue is full misses the message, and a subscriber that went away is
/// dropped from the set.
#[derive(Default)]
pub struct Listeners {
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
}

impl Listeners {
    pub fn new() -> Arc<Listeners> {
        Arc::new(Listeners::default())
    }

    /// Subscribes to messages matching `filter`. At most `capacity` messages
    /// are held for the returned [Listener] before new ones are dropped.
    pub fn add(self: &Arc<Self>, filter: Filter, capacity: usize) -> Listener {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        // A channel holds its buffer plus one slot per sender.
        let (sender, receiver) = channel(capacity.max(1) - 1);
        self.entries.lock().push(Entry { id, filter, sender });

        Listener {
            id,
            registry: Arc::downgrade(self),
            receiver,
        }
    }

    /// Removes a subscription. Returns false if it was already gone.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    /// Offers `message` to every matching subscription and returns how many
    /// took it.
    pub fn deliver(&self, message: &Message) -> usize {
        let mut delivered = 0;
        self.entries.lock().retain_mut(|entry| {
            if !entry.filter.matches(message) {
                return true;
            }

            match entry.sender.try_send(message.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(e) if e.is_full() => {
                    trace!("Listener {:?} is full, dropping {}", entry.id, message);
                    true
                }
                Err(_) => false,
            }
        });
        delivered
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// A subscription to received messages. Dropping it unsubscribes.
pub struct Listener {
    id: ListenerId,
    registry: Weak<Listeners>,
    receiver: Receiver<Message>,
}

impl Listener {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Takes a queued message without waiting. `Err` means the queue is
    /// empty but still open.
    pub fn try_next(&mut self) -> Result<Option<Message>, TryRecvError> {
        self.receiver.try_next()
    }
}

impl Stream for Listener {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        Pin::new(&mut self.receiver).poll_next(cx)
    }
}

impl FusedStream for Listener {
    fn is_terminated(&self) -> bool {
        self.receiver.is_terminated()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}
