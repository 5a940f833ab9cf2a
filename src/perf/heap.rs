//! Indexed binary min-heap over ring indices.
//!
//! Each ring appears at most once, keyed by the timestamp of its head
//! record. A position table makes membership checks, in-place key updates
//! and removal of arbitrary rings O(log n) without rebuilding the heap.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapEntry {
    pub timestamp: u64,
    pub ring_index: usize,
}

impl HeapEntry {
    /// Ties on timestamp go to the lower ring index.
    #[inline]
    fn key(&self) -> (u64, usize) {
        (self.timestamp, self.ring_index)
    }
}

#[derive(Debug, Default)]
pub struct RingHeap {
    entries: Vec<HeapEntry>,
    /// `positions[ring]` is the ring's slot in `entries`, if present.
    positions: Vec<Option<usize>>,
}

impl RingHeap {
    pub fn with_capacity(rings: usize) -> Self {
        Self {
            entries: Vec::with_capacity(rings),
            positions: Vec::with_capacity(rings),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, ring_index: usize) -> bool {
        matches!(self.positions.get(ring_index), Some(Some(_)))
    }

    /// The ring with the smallest key.
    pub fn peek(&self) -> Option<&HeapEntry> {
        self.entries.first()
    }

    /// Insert the ring or update its key if already present.
    pub fn set(&mut self, ring_index: usize, timestamp: u64) {
        if ring_index >= self.positions.len() {
            self.positions.resize(ring_index + 1, None);
        }

        match self.positions[ring_index] {
            Some(pos) => {
                let old = self.entries[pos].timestamp;
                self.entries[pos].timestamp = timestamp;
                if timestamp < old {
                    self.sift_up(pos);
                } else {
                    self.sift_down(pos);
                }
            }
            None => {
                let pos = self.entries.len();
                self.entries.push(HeapEntry {
                    timestamp,
                    ring_index,
                });
                self.positions[ring_index] = Some(pos);
                self.sift_up(pos);
            }
        }
    }

    /// Remove the ring, returning its entry if it was present.
    pub fn remove(&mut self, ring_index: usize) -> Option<HeapEntry> {
        let pos = self.positions.get_mut(ring_index)?.take()?;
        let last = self.entries.len() - 1;
        if pos != last {
            self.entries.swap(pos, last);
            self.positions[self.entries[pos].ring_index] = Some(pos);
        }
        let removed = self.entries.pop();
        if pos < self.entries.len() {
            self.sift_down(pos);
            self.sift_up(pos);
        }
        removed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.positions.iter_mut().for_each(|p| *p = None);
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.entries[pos].key() >= self.entries[parent].key() {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.entries.len();
        loop {
            let left = 2 * pos + 1;
            let right = left + 1;
            let mut smallest = pos;
            if left < len && self.entries[left].key() < self.entries[smallest].key() {
                smallest = left;
            }
            if right < len && self.entries[right].key() < self.entries[smallest].key() {
                smallest = right;
            }
            if smallest == pos {
                break;
            }
            self.swap(pos, smallest);
            pos = smallest;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.entries.swap(a, b);
        self.positions[self.entries[a].ring_index] = Some(a);
        self.positions[self.entries[b].ring_index] = Some(b);
    }
}
