use std::fmt;

use itertools::Itertools;
use parking_lot::RwLock;

struct RingState<T> {
  slots: Vec<Option<T>>,
  /// index of the oldest element
  head: usize,
  /// index the next push writes to
  tail: usize,
  size: usize,
}

impl<T> RingState<T> {
  fn capacity(&self) -> usize {
    self.slots.len()
  }
  fn is_full(&self) -> bool {
    self.size == self.capacity()
  }
  fn advance(&self, index: usize) -> usize {
    (index + 1) % self.capacity()
  }
  /// Positions of live elements, oldest first.
  fn live_indices(&self) -> impl Iterator<Item = usize> + '_ {
    (0..self.size).map(move |i| (self.head + i) % self.capacity())
  }
}

/// Fixed-capacity FIFO which overwrites its oldest element when full.
///
/// All operations take an internal lock, so a `RingBuffer` can be shared between
/// a packet-delivery task that pushes and a reader that samples the window.
pub struct RingBuffer<T> {
  state: RwLock<RingState<T>>,
}

impl<T> RingBuffer<T> {
  /// # Panics
  /// If `capacity` is 0.
  pub fn new(capacity: usize) -> Self {
    assert!(capacity > 0, "ring buffer capacity must be greater than 0");
    Self {
      state: RwLock::new(RingState {
        slots: (0..capacity).map(|_| None).collect_vec(),
        head: 0,
        tail: 0,
        size: 0,
      }),
    }
  }

  /// Appends `item`, evicting the oldest element if the buffer is full.
  pub fn push(&self, item: T) {
    let mut st = self.state.write();
    let tail = st.tail;
    st.slots[tail] = Some(item);
    st.tail = st.advance(tail);
    if st.is_full() {
      st.head = st.advance(st.head);
    } else {
      st.size += 1;
    }
  }

  /// Removes and returns the oldest element.
  pub fn pop(&self) -> Option<T> {
    let mut st = self.state.write();
    if st.size == 0 {
      return None;
    }
    let head = st.head;
    let item = st.slots[head].take();
    st.head = st.advance(head);
    st.size -= 1;
    item
  }

  pub fn len(&self) -> usize {
    self.state.read().size
  }

  pub fn capacity(&self) -> usize {
    self.state.read().capacity()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn is_full(&self) -> bool {
    self.state.read().is_full()
  }

  pub fn clear(&self) {
    let mut st = self.state.write();
    st.slots.iter_mut().for_each(|slot| *slot = None);
    st.head = 0;
    st.tail = 0;
    st.size = 0;
  }
}

impl<T: Clone> RingBuffer<T> {
  /// Returns a copy of the oldest element without removing it.
  pub fn peek(&self) -> Option<T> {
    let st = self.state.read();
    if st.size == 0 {
      return None;
    }
    st.slots[st.head].clone()
  }

  /// Copies the current contents, oldest first.
  pub fn to_vec(&self) -> Vec<T> {
    let st = self.state.read();
    st.live_indices().filter_map(|i| st.slots[i].clone()).collect()
  }

  /// Iterator over a point-in-time copy of the buffer.
  /// Pushes made after this call are not visible through the returned iterator.
  pub fn iter(&self) -> Iter<T> {
    Iter { snapshot: self.to_vec().into_iter() }
  }
}

impl<T: Clone + fmt::Debug> fmt::Display for RingBuffer<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let st = self.state.read();
    let elements = st.live_indices().filter_map(|i| st.slots[i].clone()).collect_vec();
    write!(f, "RingBuffer{{size: {}, capacity: {}, elements: {:?}}}", st.size, st.capacity(), elements)
  }
}

/// Snapshot iterator returned by [`RingBuffer::iter`].
pub struct Iter<T> {
  snapshot: std::vec::IntoIter<T>,
}

impl<T> Iterator for Iter<T> {
  type Item = T;
  fn next(&mut self) -> Option<T> {
    self.snapshot.next()
  }
  fn size_hint(&self) -> (usize, Option<usize>) {
    self.snapshot.size_hint()
  }
}

impl<T> ExactSizeIterator for Iter<T> {}
