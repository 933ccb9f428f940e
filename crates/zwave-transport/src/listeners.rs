//! Queue-empty listener registry

use std::fmt;

pub type QueueEmptyListener = Box<dyn FnMut() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u32);

/// Callbacks run, in registration order, each time the transmit queue drains
#[derive(Default)]
pub struct Listeners {
    entries: Vec<(ListenerId, QueueEmptyListener)>,
    next_id: u32,
}

impl Listeners {
    pub fn new() -> Self {
        Listeners::default()
    }

    pub fn register(&mut self, listener: QueueEmptyListener) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.entries.push((id, listener));
        id
    }

    pub fn unregister(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| *entry != id);
        self.entries.len() != before
    }

    pub fn notify(&mut self) {
        for (_, listener) in self.entries.iter_mut() {
            listener();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("registered", &self.entries.len())
            .finish()
    }
}
