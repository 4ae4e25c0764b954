pub mod mpmc;
pub mod thread_index;

pub use mpmc::MutexRingQueue;
pub use mpmc::RingQueue;

pub use thread_index::current_thread_index;
pub use thread_index::set_thread_index;

// Common interface for both bounded MPMC queues.
//
// Both operations block: push waits for a free slot, pop waits for an
// element. Callers of the lock-free variant must have assigned themselves a
// dense thread index via `set_thread_index` before the first operation; the
// serialized variant ignores it, so identical workloads drive both.
pub trait MpmcQueue<T: Send>: Send + Sync + 'static {
    // Inserts an item, waiting while the queue is full.
    fn push(&self, item: T);

    // Removes the next item, waiting while the queue is empty.
    fn pop(&self) -> T;

    fn capacity(&self) -> usize;

    /// True when the queue currently appears to hold no elements (racy).
    fn is_empty(&self) -> bool;

    /// True when the queue currently appears to be at capacity (racy).
    fn is_full(&self) -> bool;
}
