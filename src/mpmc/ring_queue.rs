// Lock-free N-producer M-consumer ring buffer queue in the style of
// Krizhanovsky's MPMC queue (Linux Journal #228).
//
// Producers and consumers claim monotone reservations off two global
// counters with fetch_add and publish their in-flight position in a
// per-thread registry. Each side derives a safe bound on the other side's
// slowest member from the registry and waits on it instead of on a lock.
use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::cell::UnsafeCell;
use std::cmp;
use std::mem::{self, MaybeUninit};
use std::ptr;
use std::sync::atomic::{fence, AtomicUsize, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

use crate::thread_index::current_thread_index;
use crate::MpmcQueue;

const CACHE_LINE_SIZE: usize = 64;
const PAGE_SIZE: usize = 4096;

// A registry entry holding the sentinel constrains nobody: it loses every
// comparison in the bound scans.
const SENTINEL: usize = usize::MAX;

// One registry entry per dense thread index. `head` is written only by the
// producer owning the index, `tail` only by the consumer owning it; the
// opposite side reads all entries when refreshing its safe bound.
#[repr(C, align(64))]
struct ThreadPos {
    head: AtomicUsize,
    tail: AtomicUsize,
    _padding: [u8; CACHE_LINE_SIZE - 16],
}

impl ThreadPos {
    fn idle() -> Self {
        Self {
            head: AtomicUsize::new(SENTINEL),
            tail: AtomicUsize::new(SENTINEL),
            _padding: [0; CACHE_LINE_SIZE - 16],
        }
    }
}

// Bounded MPMC FIFO queue over a power-of-two ring of slots.
//
// `push` and `pop` block (spin-then-yield) until they complete. Before its
// first operation every worker must register a dense index via
// `set_thread_index`: producers in [0, producers), consumers in
// [0, consumers). The element moves from pusher to popper; the queue never
// inspects it.
#[repr(C)]
pub struct RingQueue<T: Send + 'static> {
    n_producers: usize,
    n_consumers: usize,
    mask: usize,
    // next index a producer will claim
    head: CachePadded<AtomicUsize>,
    // next index a consumer will claim
    tail: CachePadded<AtomicUsize>,
    // lower bound on the least live producer reservation
    last_head: CachePadded<AtomicUsize>,
    // lower bound on the least live consumer reservation
    last_tail: CachePadded<AtomicUsize>,
    registry: *mut ThreadPos,
    slots: *mut UnsafeCell<MaybeUninit<T>>,
    owns_memory: bool,
    _phantom: std::marker::PhantomData<T>,
}

// Safety: all cross-thread state is accessed through atomics; elements are
// handed over wholesale, so `T: Send` is all the transfer needs.
unsafe impl<T: Send + 'static> Send for RingQueue<T> {}
unsafe impl<T: Send + 'static> Sync for RingQueue<T> {}

impl<T: Send + 'static> RingQueue<T> {
    fn check_config(n_producers: usize, n_consumers: usize, capacity: usize) {
        assert!(n_producers > 0, "queue needs at least one producer");
        assert!(n_consumers > 0, "queue needs at least one consumer");
        assert!(
            capacity >= 2 && capacity.is_power_of_two(),
            "capacity must be a power of two >= 2"
        );
        assert!(
            mem::align_of::<T>() <= CACHE_LINE_SIZE,
            "element alignment above one cache line is not supported"
        );
    }

    fn registry_entries(n_producers: usize, n_consumers: usize) -> usize {
        // Producer and consumer index ranges overlap in one registry; an
        // entry carries one cell for each role.
        cmp::max(n_producers, n_consumers)
    }

    fn registry_layout(n_producers: usize, n_consumers: usize) -> Layout {
        let entries = Self::registry_entries(n_producers, n_consumers);
        Layout::from_size_align(entries * mem::size_of::<ThreadPos>(), PAGE_SIZE).unwrap()
    }

    fn slots_layout(capacity: usize) -> Layout {
        let size = capacity * mem::size_of::<UnsafeCell<MaybeUninit<T>>>();
        Layout::from_size_align(size, PAGE_SIZE).unwrap()
    }

    // Allocates the registry and the slot array as two page-aligned blocks
    // owned by the queue. Panics on invalid configuration; aborts on
    // allocation failure.
    pub fn with_capacity(n_producers: usize, n_consumers: usize, capacity: usize) -> Self {
        Self::check_config(n_producers, n_consumers, capacity);

        unsafe {
            let registry_layout = Self::registry_layout(n_producers, n_consumers);
            let registry = alloc(registry_layout) as *mut ThreadPos;
            if registry.is_null() {
                handle_alloc_error(registry_layout);
            }
            for i in 0..Self::registry_entries(n_producers, n_consumers) {
                ptr::write(registry.add(i), ThreadPos::idle());
            }

            let slots_layout = Self::slots_layout(capacity);
            let slots = alloc(slots_layout) as *mut UnsafeCell<MaybeUninit<T>>;
            if slots.is_null() {
                handle_alloc_error(slots_layout);
            }
            // Slots stay logically uninitialized until their first
            // reservation is written.

            Self {
                n_producers,
                n_consumers,
                mask: capacity - 1,
                head: CachePadded::new(AtomicUsize::new(0)),
                tail: CachePadded::new(AtomicUsize::new(0)),
                last_head: CachePadded::new(AtomicUsize::new(0)),
                last_tail: CachePadded::new(AtomicUsize::new(0)),
                registry,
                slots,
                owns_memory: true,
                _phantom: std::marker::PhantomData,
            }
        }
    }

    /// Bytes needed by `init_in_shared` for this configuration.
    pub fn shared_size(n_producers: usize, n_consumers: usize, capacity: usize) -> usize {
        let queue_size = mem::size_of::<Self>();
        let queue_aligned = (queue_size + CACHE_LINE_SIZE - 1) & !(CACHE_LINE_SIZE - 1);

        let entries = Self::registry_entries(n_producers, n_consumers);
        let registry_size = entries * mem::size_of::<ThreadPos>();
        let registry_aligned = (registry_size + CACHE_LINE_SIZE - 1) & !(CACHE_LINE_SIZE - 1);

        let slots_size = capacity * mem::size_of::<UnsafeCell<MaybeUninit<T>>>();

        let total = queue_aligned + registry_aligned + slots_size;
        (total + PAGE_SIZE - 1) & !(PAGE_SIZE - 1) // Page align
    }

    // Places the queue header, registry and slot array into caller-provided
    // memory, e.g. a MAP_SHARED mapping used across forked processes. The
    // memory is reclaimed externally; dropping the returned queue frees
    // nothing.
    //
    // Safety: `mem` must be page-aligned, writable, zeroed or otherwise
    // unaliased, and at least `shared_size(..)` bytes for the same
    // configuration.
    pub unsafe fn init_in_shared(
        mem: *mut u8,
        n_producers: usize,
        n_consumers: usize,
        capacity: usize,
    ) -> &'static mut Self {
        Self::check_config(n_producers, n_consumers, capacity);

        let queue_ptr = mem as *mut Self;

        let queue_size = mem::size_of::<Self>();
        let queue_aligned = (queue_size + CACHE_LINE_SIZE - 1) & !(CACHE_LINE_SIZE - 1);

        let entries = Self::registry_entries(n_producers, n_consumers);
        let registry_size = entries * mem::size_of::<ThreadPos>();
        let registry_aligned = (registry_size + CACHE_LINE_SIZE - 1) & !(CACHE_LINE_SIZE - 1);

        let registry = mem.add(queue_aligned) as *mut ThreadPos;
        for i in 0..entries {
            ptr::write(registry.add(i), ThreadPos::idle());
        }

        let slots = mem.add(queue_aligned + registry_aligned) as *mut UnsafeCell<MaybeUninit<T>>;

        ptr::write(
            queue_ptr,
            Self {
                n_producers,
                n_consumers,
                mask: capacity - 1,
                head: CachePadded::new(AtomicUsize::new(0)),
                tail: CachePadded::new(AtomicUsize::new(0)),
                last_head: CachePadded::new(AtomicUsize::new(0)),
                last_tail: CachePadded::new(AtomicUsize::new(0)),
                registry,
                slots,
                owns_memory: false,
                _phantom: std::marker::PhantomData,
            },
        );

        &mut *queue_ptr
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    // Racy estimate; consumers blocked on an empty queue can run `tail`
    // ahead of `head`, hence the saturation.
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        head.saturating_sub(tail)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    #[inline]
    fn thread_pos(&self, index: usize) -> &ThreadPos {
        debug_assert!(
            index < Self::registry_entries(self.n_producers, self.n_consumers),
            "thread index {} outside the registry",
            index
        );
        unsafe { &*self.registry.add(index) }
    }

    // Recomputes the consumer-side safe bound: no live consumer sits below
    // the published value, so slots under it are free to rewrite. Idle
    // entries hold the sentinel and lose every comparison.
    fn refresh_last_tail(&self) {
        let mut min = self.tail.load(Ordering::SeqCst);
        // Pairs with the fence a claimant issues between pre-publishing its
        // position and bumping the counter: having observed the bumped
        // counter above, this scan cannot miss the pre-published entry.
        fence(Ordering::SeqCst);
        for i in 0..self.n_consumers {
            let tail = self.thread_pos(i).tail.load(Ordering::Acquire);
            if tail < min {
                min = tail;
            }
        }
        // A scanned minimum stays a valid lower bound forever (positions
        // only advance), so advancing to the max of published bounds keeps
        // the bound monotone under concurrent republication.
        self.last_tail.fetch_max(min, Ordering::AcqRel);
    }

    // Producer-side twin of refresh_last_tail: no live producer sits below
    // the published value, so slots under it are fully written.
    fn refresh_last_head(&self) {
        let mut min = self.head.load(Ordering::SeqCst);
        fence(Ordering::SeqCst);
        for i in 0..self.n_producers {
            let head = self.thread_pos(i).head.load(Ordering::Acquire);
            if head < min {
                min = head;
            }
        }
        self.last_head.fetch_max(min, Ordering::AcqRel);
    }

    // Inserts an item, waiting while the queue is full.
    pub fn push(&self, item: T) {
        let index = current_thread_index();
        debug_assert!(
            index < self.n_producers,
            "producer index {} out of range",
            index
        );
        let pos = self.thread_pos(index);

        // Pre-publish the current head as an under-approximation of the
        // reservation about to be claimed. Without it there is a window
        // after the fetch_add where the registry still reads idle while the
        // counter has moved, and a concurrent scan would overestimate the
        // producer-side minimum. A stale-low entry is harmless; bounds are
        // minima.
        pos.head
            .store(self.head.load(Ordering::Relaxed), Ordering::Release);
        fence(Ordering::SeqCst);
        let my_head = self.head.fetch_add(1, Ordering::SeqCst);
        pos.head.store(my_head, Ordering::Release);

        // The slot position recycles every `capacity` reservations; it may
        // still be read by a consumer of its previous occupant until the
        // consumer-side bound passes that occupant.
        let backoff = Backoff::new();
        while my_head >= self.last_tail.load(Ordering::Acquire) + self.capacity() {
            backoff.snooze();
            self.refresh_last_tail();
        }

        unsafe {
            (*(*self.slots.add(my_head & self.mask)).get()).write(item);
        }
        // Hand the slot over to consumers.
        pos.head.store(SENTINEL, Ordering::Release);
    }

    // Removes the next item, waiting while the queue is empty.
    pub fn pop(&self) -> T {
        let index = current_thread_index();
        debug_assert!(
            index < self.n_consumers,
            "consumer index {} out of range",
            index
        );
        let pos = self.thread_pos(index);

        // Same two-step publication as push, against the tail counter.
        pos.tail
            .store(self.tail.load(Ordering::Relaxed), Ordering::Release);
        fence(Ordering::SeqCst);
        let my_tail = self.tail.fetch_add(1, Ordering::SeqCst);
        pos.tail.store(my_tail, Ordering::Release);

        // The producer owning this reservation has published its payload
        // only once the producer-side bound passes it.
        let backoff = Backoff::new();
        while my_tail >= self.last_head.load(Ordering::Acquire) {
            backoff.snooze();
            self.refresh_last_head();
        }

        let item = unsafe { (*(*self.slots.add(my_tail & self.mask)).get()).assume_init_read() };
        // Allow producers to rewrite the slot.
        pos.tail.store(SENTINEL, Ordering::Release);
        item
    }
}

impl<T: Send + 'static> MpmcQueue<T> for RingQueue<T> {
    fn push(&self, item: T) {
        RingQueue::push(self, item)
    }

    fn pop(&self) -> T {
        RingQueue::pop(self)
    }

    fn capacity(&self) -> usize {
        RingQueue::capacity(self)
    }

    fn is_empty(&self) -> bool {
        RingQueue::is_empty(self)
    }

    fn is_full(&self) -> bool {
        RingQueue::is_full(self)
    }
}

impl<T: Send + 'static> Drop for RingQueue<T> {
    fn drop(&mut self) {
        if !self.owns_memory {
            // Placement-constructed queues borrow their memory; the mapping
            // owner reclaims it.
            return;
        }
        unsafe {
            if mem::needs_drop::<T>() {
                // The caller quiesced all workers, so [tail, head) is the
                // exact set of undelivered elements.
                let head = self.head.load(Ordering::Relaxed);
                let mut pos = self.tail.load(Ordering::Relaxed);
                while pos < head {
                    (*(*self.slots.add(pos & self.mask)).get()).assume_init_drop();
                    pos += 1;
                }
            }
            dealloc(
                self.registry as *mut u8,
                Self::registry_layout(self.n_producers, self.n_consumers),
            );
            dealloc(self.slots as *mut u8, Self::slots_layout(self.capacity()));
        }
    }
}
