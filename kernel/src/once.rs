use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU8, Ordering};

const EMPTY: u8 = 0;
const WRITING: u8 = 1;
const READY: u8 = 2;

/// A cell written exactly once during boot and read-only afterwards.
pub struct Once<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

// Safety: the value is written exactly once, guarded by the atomic state
// transition EMPTY -> WRITING, and only read through shared references
// after the READY store is observed with Acquire ordering.
unsafe impl<T: Send + Sync> Sync for Once<T> {}
unsafe impl<T: Send> Send for Once<T> {}

impl<T> Once<T> {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    pub fn set(&self, value: T) {
        match self
            .state
            .compare_exchange(EMPTY, WRITING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                // Safety: we won the EMPTY -> WRITING transition, so no
                // other writer exists and no reader sees READY yet.
                unsafe {
                    (*self.value.get()).write(value);
                }
                self.state.store(READY, Ordering::Release);
            }
            Err(_) => panic!("Once::set called twice"),
        }
    }

    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == READY {
            // Safety: READY means set() completed; the value is initialized
            // and never mutated again.
            Some(unsafe { (*self.value.get()).assume_init_ref() })
        } else {
            None
        }
    }

    pub fn get_or_panic(&self) -> &T {
        self.get().expect("Once value not set")
    }

    pub fn is_set(&self) -> bool {
        self.state.load(Ordering::Acquire) == READY
    }
}
