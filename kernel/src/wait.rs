use collections::generational_arena::Handle;
use collections::priority_queue::PriorityQueue;
use system::error::SysError;

use crate::task::TaskHandle;
use crate::thread::ThreadHandle;

pub type EventHandle = Handle;

/// Outcome of a completed wait. Callers re-check the resource's own state;
/// the result reports why the wait ended, not whether the resource is
/// available.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WaitResult {
    Success,
    Broken,
    TimedOut,
    Invalidated,
    Interrupted,
}

impl WaitResult {
    pub fn to_error(self) -> Result<(), SysError> {
        match self {
            WaitResult::Success => Ok(()),
            WaitResult::Broken => Err(SysError::Broken),
            WaitResult::TimedOut => Err(SysError::TimedOut),
            WaitResult::Invalidated => Err(SysError::Invalidated),
            WaitResult::Interrupted => Err(SysError::Interrupted),
        }
    }
}

/// Which primitive owns an event. Generic wake paths (timeout expiry,
/// teardown) use this to route the woken thread back to its primitive so
/// its own bookkeeping can be restored.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventOwner {
    Plain,
    Mutex(Handle),
    Semaphore(Handle),
    Condvar(Handle),
    Object(Handle),
    Irq(u8),
    Exception(TaskHandle),
}

pub struct WaitEvent {
    pub(crate) name: &'static str,
    pub(crate) owner: EventOwner,
    pub(crate) queue: PriorityQueue<ThreadHandle>,
}

impl WaitEvent {
    pub(crate) fn new(name: &'static str, owner: EventOwner) -> Self {
        Self {
            name,
            owner,
            queue: PriorityQueue::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn owner(&self) -> EventOwner {
        self.owner
    }
}
