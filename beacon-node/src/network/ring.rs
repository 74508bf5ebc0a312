// Round-robin ring
//
// INTENTION: Cycle through live providers of one alias. The ring is an arena
// keyed by provider id; each slot stores the ids of its neighbours instead
// of references, plus head, tail and a "next to serve" cursor. Every
// operation is a short synchronous step so callers can serialize them
// behind a plain mutex.
//
// Invariants:
// - at most one entry per provider id
// - the cursor, when set, names a present entry
// - the ring is empty iff head, tail and cursor are all `None`

use std::collections::HashMap;

struct Slot<T> {
    entry: T,
    next: String,
    prev: String,
}

pub struct RoundRobinRing<T> {
    slots: HashMap<String, Slot<T>>,
    head: Option<String>,
    tail: Option<String>,
    cursor: Option<String>,
}

impl<T> Default for RoundRobinRing<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RoundRobinRing<T> {
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
            head: None,
            tail: None,
            cursor: None,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.slots.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.slots.get(id).map(|slot| &slot.entry)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut T> {
        self.slots.get_mut(id).map(|slot| &mut slot.entry)
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    /// Append after the tail. Returns false (and drops `entry`) when the id
    /// is already present.
    pub fn insert(&mut self, id: impl Into<String>, entry: T) -> bool {
        let id = id.into();
        if self.slots.contains_key(&id) {
            return false;
        }

        match (self.head.clone(), self.tail.clone()) {
            (Some(head), Some(tail)) => {
                self.slots.insert(
                    id.clone(),
                    Slot {
                        entry,
                        next: head.clone(),
                        prev: tail.clone(),
                    },
                );
                if let Some(slot) = self.slots.get_mut(&tail) {
                    slot.next = id.clone();
                }
                if let Some(slot) = self.slots.get_mut(&head) {
                    slot.prev = id.clone();
                }
                self.tail = Some(id);
            }
            _ => {
                self.slots.insert(
                    id.clone(),
                    Slot {
                        entry,
                        next: id.clone(),
                        prev: id.clone(),
                    },
                );
                self.head = Some(id.clone());
                self.tail = Some(id.clone());
                self.cursor = Some(id);
            }
        }
        true
    }

    /// The entry under the cursor; the cursor then moves to its next link
    pub fn select(&mut self) -> Option<&T> {
        let current = self.cursor.clone()?;
        let slot = self.slots.get(&current)?;
        self.cursor = Some(slot.next.clone());
        Some(&slot.entry)
    }

    /// Unlink an entry, repairing head, tail and cursor
    pub fn remove(&mut self, id: &str) -> Option<T> {
        let slot = self.slots.remove(id)?;

        if self.slots.is_empty() {
            self.head = None;
            self.tail = None;
            self.cursor = None;
            return Some(slot.entry);
        }

        if let Some(prev) = self.slots.get_mut(&slot.prev) {
            prev.next = slot.next.clone();
        }
        if let Some(next) = self.slots.get_mut(&slot.next) {
            next.prev = slot.prev.clone();
        }
        if self.head.as_deref() == Some(id) {
            self.head = Some(slot.next.clone());
        }
        if self.tail.as_deref() == Some(id) {
            self.tail = Some(slot.prev.clone());
        }
        if self.cursor.as_deref() == Some(id) {
            self.cursor = Some(slot.next.clone());
        }
        Some(slot.entry)
    }

    /// Remove `id` only if `predicate` holds for its entry
    pub fn remove_if(&mut self, id: &str, predicate: impl FnOnce(&T) -> bool) -> Option<T> {
        match self.slots.get(id) {
            Some(slot) if predicate(&slot.entry) => self.remove(id),
            _ => None,
        }
    }

    /// Provider ids in ring order starting at the head
    pub fn ids(&self) -> Vec<String> {
        let mut ids = Vec::with_capacity(self.slots.len());
        let mut current = self.head.clone();
        while let Some(id) = current {
            let Some(slot) = self.slots.get(&id) else {
                break;
            };
            ids.push(id);
            if Some(&slot.next) == self.head.as_ref() {
                break;
            }
            current = Some(slot.next.clone());
        }
        ids
    }

    /// Drain every entry, leaving the ring empty
    pub fn clear(&mut self) -> Vec<T> {
        self.head = None;
        self.tail = None;
        self.cursor = None;
        self.slots.drain().map(|(_, slot)| slot.entry).collect()
    }
}
