use alloc::string::String;
use alloc::vec::Vec;
use collections::generational_arena::Handle;
use system::caps::CapSet;

use crate::wait::EventHandle;

pub type TaskHandle = Handle;
pub type ObjectHandle = Handle;

pub const MAX_OBJECTS_PER_TASK: usize = 32;

/// Unit of capability and ownership. Threads, objects, and the installed
/// exception handler hang off the task; everything it owns is
/// force-released when it terminates.
pub struct Task {
    pub(crate) name: String,
    pub(crate) caps: CapSet,
    pub(crate) threads: Vec<Handle>,
    pub(crate) objects: Vec<Handle>,
    pub(crate) exception_handler: Option<usize>,
    pub(crate) exception_event: EventHandle,
}

impl Task {
    pub(crate) fn new(name: &str, caps: CapSet, exception_event: EventHandle) -> Self {
        Self {
            name: String::from(name),
            caps,
            threads: Vec::new(),
            objects: Vec::new(),
            exception_handler: None,
            exception_event,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn caps(&self) -> CapSet {
        self.caps
    }

    pub fn has_cap(&self, cap: CapSet) -> bool {
        self.caps.contains(cap)
    }

    pub fn threads(&self) -> &[Handle] {
        &self.threads
    }

    pub fn objects(&self) -> &[Handle] {
        &self.objects
    }

    pub fn exception_handler(&self) -> Option<usize> {
        self.exception_handler
    }
}
