// The queue placed in a MAP_SHARED mapping must coordinate forked
// processes exactly as it coordinates threads: same checkerboard
// verification, one process per producer/consumer. Children communicate
// failures through their exit status and touch nothing but the shared
// region, so the post-fork path stays allocation-free.
#![cfg(not(miri))]

use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult};
use ring_queues::{set_thread_index, RingQueue};
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

const PRODUCERS: usize = 2;
const CONSUMERS: usize = 2;
const CAPACITY: usize = 8;
const TOTAL: usize = 16 * 1024;

const EMPTY: u8 = 0;
const MISSED: u8 = 255;

unsafe fn map_shared(bytes: usize) -> *mut u8 {
    let ptr = libc::mmap(
        ptr::null_mut(),
        bytes,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED | libc::MAP_ANONYMOUS,
        -1,
        0,
    );
    if ptr == libc::MAP_FAILED {
        panic!("mmap failed: {}", std::io::Error::last_os_error());
    }
    ptr.cast()
}

unsafe fn unmap_shared(ptr: *mut u8, len: usize) {
    if libc::munmap(ptr.cast(), len) == -1 {
        panic!("munmap failed: {}", std::io::Error::last_os_error());
    }
}

#[test]
fn fork_checkerboard_parity() {
    let queue_bytes = RingQueue::<usize>::shared_size(PRODUCERS, CONSUMERS, CAPACITY);
    let board_offset = queue_bytes;
    let counter_offset = {
        let end = board_offset + TOTAL;
        (end + 63) & !63
    };
    let total_bytes = {
        let end = counter_offset + mem::size_of::<AtomicUsize>();
        (end + 4095) & !4095
    };

    unsafe {
        let mem = map_shared(total_bytes);
        // The mapping is zeroed, so every board cell starts at EMPTY and
        // the claim counter at zero.
        let queue = &*RingQueue::<usize>::init_in_shared(mem, PRODUCERS, CONSUMERS, CAPACITY);
        let board = mem.add(board_offset) as *const AtomicU8;
        let claimed = &*(mem.add(counter_offset) as *const AtomicUsize);

        let mut children = Vec::new();

        for id in 0..PRODUCERS {
            match fork().expect("fork producer") {
                ForkResult::Parent { child } => children.push(child),
                ForkResult::Child => {
                    set_thread_index(id);
                    let mut i = id;
                    while i < TOTAL {
                        (*board.add(i)).store(MISSED, Ordering::Relaxed);
                        queue.push(i);
                        i += PRODUCERS;
                    }
                    libc::_exit(0);
                }
            }
        }

        for id in 0..CONSUMERS {
            match fork().expect("fork consumer") {
                ForkResult::Parent { child } => children.push(child),
                ForkResult::Child => {
                    set_thread_index(id);
                    while claimed.fetch_add(1, Ordering::SeqCst) < TOTAL {
                        let i = queue.pop();
                        if i >= TOTAL {
                            libc::_exit(2);
                        }
                        let previous = (*board.add(i)).swap(id as u8 + 1, Ordering::Relaxed);
                        if previous != MISSED {
                            libc::_exit(3);
                        }
                    }
                    libc::_exit(0);
                }
            }
        }

        for child in children {
            match waitpid(child, None).expect("waitpid") {
                WaitStatus::Exited(_, 0) => {}
                status => panic!("worker process failed: {:?}", status),
            }
        }

        for i in 0..TOTAL {
            let value = (*board.add(i)).load(Ordering::Relaxed);
            assert_ne!(value, EMPTY, "cell {} was never pushed", i);
            assert_ne!(value, MISSED, "cell {} was pushed but never popped", i);
        }

        unmap_shared(mem, total_bytes);
    }
}
