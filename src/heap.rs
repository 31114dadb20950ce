//! A binary min-heap of job ids that supports removing any element.
//!
//! `kick`, `delete`, `release` and `touch` all need to pull a job out of the
//! middle of a heap, so every entry's slot is tracked in a side table that is
//! kept in step with each swap made while sifting.
use std::collections::HashMap;

use crate::types::job::JobId;

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
struct Entry<K> {
    key: K,
    // Secondary key: ids are allocated in insertion order, so equal keys pop
    // first-in first-out.
    id: JobId,
}

#[derive(Debug)]
pub struct IndexedHeap<K> {
    entries: Vec<Entry<K>>,
    slots: HashMap<JobId, usize>,
}

impl<K> Default for IndexedHeap<K> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            slots: HashMap::new(),
        }
    }
}

impl<K: Ord + Copy> IndexedHeap<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts `id` under `key`. Returns false, changing nothing, if `id` is
    /// already present.
    pub fn push(&mut self, key: K, id: JobId) -> bool {
        if self.slots.contains_key(&id) {
            return false;
        }

        let at = self.entries.len();
        self.entries.push(Entry { key, id });
        self.slots.insert(id, at);
        self.sift_up(at);

        true
    }

    /// Smallest entry as `(key, id)`.
    pub fn peek(&self) -> Option<(K, JobId)> {
        self.entries.first().map(|e| (e.key, e.id))
    }

    pub fn pop(&mut self) -> Option<(K, JobId)> {
        let id = self.entries.first()?.id;
        self.remove(id).map(|key| (key, id))
    }

    /// Removes `id` from wherever it sits, returning its key.
    pub fn remove(&mut self, id: JobId) -> Option<K> {
        let at = self.slots.remove(&id)?;
        let last = self.entries.len() - 1;

        if at != last {
            self.entries.swap(at, last);
            self.slots.insert(self.entries[at].id, at);
        }
        let removed = self.entries.pop()?;

        if at < self.entries.len() {
            // The entry moved into the hole may need to go either way.
            let at = self.sift_up(at);
            self.sift_down(at);
        }

        Some(removed.key)
    }

    /// Entries in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (K, JobId)> + '_ {
        self.entries.iter().map(|e| (e.key, e.id))
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.entries.swap(a, b);
        self.slots.insert(self.entries[a].id, a);
        self.slots.insert(self.entries[b].id, b);
    }

    fn sift_up(&mut self, mut at: usize) -> usize {
        while at > 0 {
            let parent = (at - 1) / 2;
            if self.entries[at] >= self.entries[parent] {
                break;
            }
            self.swap(at, parent);
            at = parent;
        }
        at
    }

    fn sift_down(&mut self, mut at: usize) {
        let len = self.entries.len();
        loop {
            let left = 2 * at + 1;
            let right = left + 1;
            let mut least = at;

            if left < len && self.entries[left] < self.entries[least] {
                least = left;
            }
            if right < len && self.entries[right] < self.entries[least] {
                least = right;
            }
            if least == at {
                return;
            }

            self.swap(at, least);
            at = least;
        }
    }
}
