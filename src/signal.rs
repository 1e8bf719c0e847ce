// src/signal.rs

use std::fmt;

/// Handle returned by [`Signal::connect`], used to unsubscribe later.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SignalId(u64);

/// A broadcast point with zero or more subscribers.
///
/// The connection raises two of these: `need_flush` after a message is
/// committed to the outbound buffer, and `destroy` when the connection is
/// dropped. Subscribers run synchronously, in subscription order.
#[derive(Default)]
pub struct Signal {
    subscribers: Vec<(u64, Box<dyn FnMut()>)>,
    next_id: u64,
}

impl Signal {
    pub fn new() -> Self {
        Signal::default()
    }

    /// Subscribe a callback. It stays registered until [`disconnect`] is
    /// called with the returned id.
    ///
    /// [`disconnect`]: Signal::disconnect
    pub fn connect(&mut self, callback: impl FnMut() + 'static) -> SignalId {
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.push((id, Box::new(callback)));
        SignalId(id)
    }

    /// Remove a subscriber. Returns false if the id was already gone.
    pub fn disconnect(&mut self, id: SignalId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sub_id, _)| *sub_id != id.0);
        self.subscribers.len() != before
    }

    /// Invoke every subscriber, in subscription order.
    pub fn emit(&mut self) {
        for (_, callback) in &mut self.subscribers {
            callback();
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}
