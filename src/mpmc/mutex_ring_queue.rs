// Serialized ring buffer queue: one mutex around the counters and slots,
// two condition variables. Small and obviously correct, which is the point:
// it serves as the behavioral oracle the lock-free variant is tested
// against under identical workloads.
use std::sync::{Condvar, Mutex};

use crate::MpmcQueue;

struct RingState<T> {
    head: usize,
    tail: usize,
    slots: Box<[Option<T>]>,
}

pub struct MutexRingQueue<T> {
    state: Mutex<RingState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    mask: usize,
}

impl<T: Send> MutexRingQueue<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(
            capacity >= 2 && capacity.is_power_of_two(),
            "capacity must be a power of two >= 2"
        );
        let slots: Box<[Option<T>]> = (0..capacity).map(|_| None).collect();
        Self {
            state: Mutex::new(RingState {
                head: 0,
                tail: 0,
                slots,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            mask: capacity - 1,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.head - state.tail
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    // Inserts an item, waiting on not_full while the ring is at capacity.
    pub fn push(&self, item: T) {
        let mut state = self.state.lock().unwrap();
        while state.head - state.tail == self.capacity() {
            state = self.not_full.wait(state).unwrap();
        }
        let slot = state.head & self.mask;
        state.slots[slot] = Some(item);
        state.head += 1;
        drop(state);
        self.not_empty.notify_one();
    }

    // Removes the next item, waiting on not_empty while the ring is empty.
    pub fn pop(&self) -> T {
        let mut state = self.state.lock().unwrap();
        while state.head == state.tail {
            state = self.not_empty.wait(state).unwrap();
        }
        let slot = state.tail & self.mask;
        let item = state.slots[slot].take().expect("claimed slot is filled");
        state.tail += 1;
        drop(state);
        self.not_full.notify_one();
        item
    }
}

impl<T: Send + 'static> MpmcQueue<T> for MutexRingQueue<T> {
    fn push(&self, item: T) {
        MutexRingQueue::push(self, item)
    }

    fn pop(&self) -> T {
        MutexRingQueue::pop(self)
    }

    fn capacity(&self) -> usize {
        MutexRingQueue::capacity(self)
    }

    fn is_empty(&self) -> bool {
        MutexRingQueue::is_empty(self)
    }

    fn is_full(&self) -> bool {
        MutexRingQueue::is_full(self)
    }
}
