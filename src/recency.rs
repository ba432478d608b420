//! A [RecencyList] orders keys by how recently they were used, and is what the purge pass walks to pick eviction
//! victims.
//!
//! This is implemented as a vec-backed doubly linked list plus an auxiliary hash-based index.  Freed cells are chained
//! into an empty list and reused, so a long-running cache doesn't grow the backing vec past its high-water mark.
use std::collections::HashMap;
use std::hash::Hash;

use ahash::RandomState;

struct OccupiedCell<K> {
    key: K,
    prev: Option<usize>,
    next: Option<usize>,
}

struct EmptyCell {
    next_empty: Option<usize>,
}

enum Cell<K> {
    /// This cell is empty, possibly with a pointer at the next empty cell.
    Empty(EmptyCell),
    /// This cell is occupied, and doubly linked to the previous (more recent) and next (less recent) cell.
    Occupied(OccupiedCell<K>),
}

impl<K> Cell<K> {
    fn as_occupied_mut(&mut self) -> &mut OccupiedCell<K> {
        match self {
            Self::Occupied(ref mut x) => x,
            _ => panic!("Cell should be occupied"),
        }
    }

    fn as_occupied(&self) -> &OccupiedCell<K> {
        match self {
            Self::Occupied(ref x) => x,
            _ => panic!("Cell should be occupied"),
        }
    }

    fn as_empty_mut(&mut self) -> &mut EmptyCell {
        match self {
            Cell::Empty(ref mut x) => x,
            _ => panic!("Cell should be empty"),
        }
    }
}

pub struct RecencyList<K: Hash + Eq + Clone> {
    cells: Vec<Cell<K>>,
    /// Points at the cell of the key.
    index: HashMap<K, usize, RandomState>,
    /// Most recently used.
    head: Option<usize>,
    /// Least recently used.
    tail: Option<usize>,
    empty_head: Option<usize>,
}

impl<K: Hash + Eq + Clone + std::fmt::Debug> std::fmt::Debug for RecencyList<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<K: Hash + Eq + Clone> Default for RecencyList<K> {
    fn default() -> Self {
        RecencyList::new()
    }
}

impl<K: Hash + Eq + Clone> RecencyList<K> {
    pub fn new() -> RecencyList<K> {
        RecencyList {
            cells: Default::default(),
            index: Default::default(),
            head: None,
            tail: None,
            empty_head: None,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Entirely unlink an occupied cell from the list.
    fn unlink(&mut self, cell: usize) {
        if Some(cell) == self.tail {
            self.tail = self.cells[cell].as_occupied().prev;
        }

        if Some(cell) == self.head {
            self.head = self.cells[cell].as_occupied().next;
            if let Some(n) = self.head {
                self.cells[n].as_occupied_mut().prev = None;
            }
            return;
        }

        let old_prev = self.cells[cell].as_occupied().prev.expect("Isn't the head");
        let old_next = self.cells[cell].as_occupied().next;
        self.cells[old_prev].as_occupied_mut().next = old_next;
        if let Some(n) = old_next {
            self.cells[n].as_occupied_mut().prev = Some(old_prev);
        }
    }

    /// Link an occupied but unlinked cell in as the head.
    fn link_as_head(&mut self, cell: usize) {
        {
            let occupied = self.cells[cell].as_occupied_mut();
            occupied.prev = None;
            occupied.next = self.head;
        }
        if let Some(h) = self.head {
            self.cells[h].as_occupied_mut().prev = Some(cell);
        }
        self.head = Some(cell);

        if self.tail.is_none() {
            self.tail = Some(cell);
        }
    }

    /// Find an available empty cell, or make one if necessary.
    fn find_empty(&mut self) -> usize {
        if let Some(e) = self.empty_head {
            self.empty_head = self.cells[e].as_empty_mut().next_empty;
            return e;
        }

        self.cells.push(Cell::Empty(EmptyCell { next_empty: None }));
        self.cells.len() - 1
    }

    /// Mark a key as the most recently used one, adding it if it isn't present.
    ///
    /// Returns true if the key was already present.
    pub fn touch(&mut self, key: K) -> bool {
        if let Some(&cell) = self.index.get(&key) {
            self.unlink(cell);
            self.link_as_head(cell);
            return true;
        }

        let cell = self.find_empty();
        self.cells[cell] = Cell::Occupied(OccupiedCell {
            key: key.clone(),
            prev: None,
            next: None,
        });
        self.index.insert(key, cell);
        self.link_as_head(cell);
        false
    }

    pub fn remove(&mut self, key: &K) -> bool {
        let cell = match self.index.remove(key) {
            Some(c) => c,
            None => return false,
        };
        self.unlink(cell);
        self.cells[cell] = Cell::Empty(EmptyCell {
            next_empty: self.empty_head,
        });
        self.empty_head = Some(cell);
        true
    }

    pub fn clear(&mut self) {
        self.cells.clear();
        self.index.clear();
        self.head = None;
        self.tail = None;
        self.empty_head = None;
    }

    /// The least recently used key.
    pub fn oldest(&self) -> Option<&K> {
        self.tail.map(|t| &self.cells[t].as_occupied().key)
    }

    /// Iterator visiting keys in most-recently-used order.
    pub fn iter(&self) -> impl Iterator<Item = &K> {
        let mut cur = self.head;
        std::iter::from_fn(move || {
            let c = self.cells[cur?].as_occupied();
            cur = c.next;
            Some(&c.key)
        })
    }

    /// Iterator visiting keys in least-recently-used order, which is eviction order.
    pub fn iter_oldest_first(&self) -> impl Iterator<Item = &K> {
        let mut cur = self.tail;
        std::iter::from_fn(move || {
            let c = self.cells[cur?].as_occupied();
            cur = c.prev;
            Some(&c.key)
        })
    }
}
