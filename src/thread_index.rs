// Dense per-thread indices for queue registry addressing, as opposed to the
// opaque ids the OS hands out. Producers take indices in [0, producers),
// consumers in [0, consumers); the two ranges are independent because the
// registry holds a separate head and tail cell per entry.
use std::cell::Cell;

const UNSET: usize = usize::MAX;

thread_local! {
    static THREAD_INDEX: Cell<usize> = const { Cell::new(UNSET) };
}

// Assigns the calling thread its index. Must run before the thread's first
// queue operation. Reassignment overwrites, which lets a harness thread run
// several scenarios back to back.
pub fn set_thread_index(index: usize) {
    THREAD_INDEX.with(|slot| slot.set(index));
}

pub fn current_thread_index() -> usize {
    let index = THREAD_INDEX.with(Cell::get);
    debug_assert!(index != UNSET, "thread index used before set_thread_index");
    index
}
