use std::sync::{Arc, RwLock};

use crate::message::Message;

/// Append-only sequence of message records.
///
/// Growth is unbounded within the process lifetime; callers that need to
/// cap memory are expected to drain. Appends may race with readers, which
/// tolerate a changing tail.
#[derive(Clone, Debug, Default)]
pub struct MessageLog {
    entries: Arc<RwLock<Vec<Arc<Message>>>>,
}

impl MessageLog {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn append(&self, message: Arc<Message>) {
        self.write().push(message);
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<Message>> {
        self.read().clone()
    }

    /// First record matching the predicate, in append order.
    pub fn find(&self, predicate: impl Fn(&Message) -> bool) -> Option<Arc<Message>> {
        self.read()
            .iter()
            .find(|message| predicate(message))
            .cloned()
    }

    /// Every record matching the predicate, traversing each record and its
    /// redirect `prev` chain.
    pub fn search(&self, predicate: impl Fn(&Message) -> bool) -> Vec<Arc<Message>> {
        let mut found = Vec::new();
        for entry in self.read().iter() {
            let mut cursor = Some(Arc::clone(entry));
            while let Some(message) = cursor {
                if predicate(&message) {
                    found.push(Arc::clone(&message));
                }
                cursor = message.prev();
            }
        }
        found
    }

    /// Projects every record (and redirect hop) through `projection`.
    pub fn select<T>(&self, projection: impl Fn(&Message) -> T) -> Vec<T> {
        let mut selected = Vec::new();
        for entry in self.read().iter() {
            let mut cursor = Some(Arc::clone(entry));
            while let Some(message) = cursor {
                selected.push(projection(&message));
                cursor = message.prev();
            }
        }
        selected
    }

    /// The most recent `count` records, newest last.
    pub(crate) fn recent(&self, count: usize) -> Vec<Arc<Message>> {
        let entries = self.read();
        let start = entries.len().saturating_sub(count);
        entries[start..].to_vec()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<Message>>> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<Message>>> {
        match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
