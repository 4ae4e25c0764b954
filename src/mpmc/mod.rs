pub mod mutex_ring_queue;
pub mod ring_queue;

pub use mutex_ring_queue::MutexRingQueue;
pub use ring_queue::RingQueue;
