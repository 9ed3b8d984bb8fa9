use alloc::format;
use collections::generational_arena::Handle;
use system::error::SysError;

use crate::cpu::Cpu;
use crate::sched::Scheduler;
use crate::task::TaskHandle;
use crate::thread::{DEFAULT_PRIORITY, ThreadHandle};
use crate::wait::{EventHandle, EventOwner};

pub const VECTOR_COUNT: usize = 32;

#[derive(Debug, PartialEq, Eq)]
pub enum FastResult {
    /// The fast handler fully serviced the interrupt.
    Handled,
    /// Hand the rest of the work to the deferred worker.
    Continue,
}

pub type FastHandler = fn(u8) -> FastResult;
pub type DeferredHandler = fn(u8);

/// What the deferred worker does per pending request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeferredAction {
    /// Run a kernel-side handler.
    Call(DeferredHandler),
    /// Post a driver-owned semaphore (user-level driver model).
    PostSemaphore(Handle),
}

/// Fast handler stub for user-attached vectors: all work is deferred.
pub fn defer_all(_vector: u8) -> FastResult {
    FastResult::Continue
}

pub struct IrqDescriptor {
    pub(crate) level: u8,
    pub(crate) fast: FastHandler,
    pub(crate) deferred: Option<DeferredAction>,
    pub(crate) worker: Option<ThreadHandle>,
    pub(crate) event: Option<EventHandle>,
    pub(crate) pending: u32,
    pub(crate) dispatches: u64,
}

/// Fixed vector table. Attachment happens during initialization only, so
/// a slot collision or resource exhaustion here is fatal rather than an
/// error to recover from.
pub struct InterruptTable {
    slots: [Option<IrqDescriptor>; VECTOR_COUNT],
}

impl InterruptTable {
    pub fn new() -> Self {
        const EMPTY: Option<IrqDescriptor> = None;
        Self {
            slots: [EMPTY; VECTOR_COUNT],
        }
    }

    fn descriptor(&self, vector: u8) -> Option<&IrqDescriptor> {
        self.slots.get(vector as usize).and_then(|s| s.as_ref())
    }

    fn descriptor_mut(&mut self, vector: u8) -> Option<&mut IrqDescriptor> {
        self.slots.get_mut(vector as usize).and_then(|s| s.as_mut())
    }

    pub fn is_attached(&self, vector: u8) -> bool {
        self.descriptor(vector).is_some()
    }

    pub fn pending(&self, vector: u8) -> u32 {
        self.descriptor(vector).map(|d| d.pending).unwrap_or(0)
    }

    pub fn dispatches(&self, vector: u8) -> u64 {
        self.descriptor(vector).map(|d| d.dispatches).unwrap_or(0)
    }

    pub fn worker(&self, vector: u8) -> Option<ThreadHandle> {
        self.descriptor(vector).and_then(|d| d.worker)
    }

    /// Fill a vector slot and program the controller. A deferred action
    /// spawns the worker thread, parked on the descriptor's event until
    /// the first request arrives.
    pub fn attach(
        &mut self,
        sched: &mut Scheduler,
        cpu: &dyn Cpu,
        kernel_task: TaskHandle,
        vector: u8,
        level: u8,
        fast: FastHandler,
        deferred: Option<DeferredAction>,
    ) -> Result<(), SysError> {
        if vector as usize >= VECTOR_COUNT {
            return Err(SysError::InvalidArgument);
        }
        if self.is_attached(vector) {
            panic!("interrupt vector {} attached twice", vector);
        }

        let (worker, event) = if deferred.is_some() {
            let event = sched
                .event_create("irq worker", EventOwner::Irq(vector))
                .unwrap_or_else(|_| panic!("out of wait events attaching vector {}", vector));
            let name = format!("irq{} worker", vector);
            let worker = sched
                .create_thread(kernel_task, &name, DEFAULT_PRIORITY)
                .unwrap_or_else(|_| panic!("out of threads attaching vector {}", vector));
            sched.block(worker, event, 0, 0);
            (Some(worker), Some(event))
        } else {
            (None, None)
        };

        self.slots[vector as usize] = Some(IrqDescriptor {
            level,
            fast,
            deferred,
            worker,
            event,
            pending: 0,
            dispatches: 0,
        });
        cpu.unmask_vector(vector, level);
        Ok(())
    }

    pub fn detach(
        &mut self,
        sched: &mut Scheduler,
        cpu: &dyn Cpu,
        vector: u8,
    ) -> Result<(), SysError> {
        let descriptor = self
            .slots
            .get_mut(vector as usize)
            .and_then(|s| s.take())
            .ok_or(SysError::NotFound)?;
        cpu.mask_vector(vector);
        if let Some(worker) = descriptor.worker {
            sched.exit_thread(worker);
            sched.reap_thread(worker);
        }
        if let Some(event) = descriptor.event {
            sched.event_destroy(event);
        }
        Ok(())
    }

    /// Invoked by the hardware trampoline with the critical section held.
    /// The pending counter, not the hardware line, tracks outstanding
    /// deferred work, so requests arriving while the worker is still
    /// being scheduled in are not lost.
    pub fn dispatch(&mut self, sched: &mut Scheduler, vector: u8) -> Result<(), SysError> {
        let descriptor = self.descriptor_mut(vector).ok_or(SysError::NotFound)?;
        descriptor.dispatches += 1;
        let result = (descriptor.fast)(vector);
        if result == FastResult::Continue && descriptor.worker.is_some() {
            descriptor.pending += 1;
            let event = descriptor.event.expect("worker implies event");
            sched.wake_one(event);
        }
        Ok(())
    }

    /// One iteration of the deferred worker's loop: park while nothing is
    /// pending, otherwise consume one request and report the action to
    /// run at ordinary priority.
    pub fn worker_step(
        &mut self,
        sched: &mut Scheduler,
        vector: u8,
        now: u64,
    ) -> Option<DeferredAction> {
        let descriptor = self.descriptor_mut(vector)?;
        if descriptor.pending == 0 {
            let worker = descriptor.worker?;
            let event = descriptor.event?;
            sched.block(worker, event, 0, now);
            None
        } else {
            descriptor.pending -= 1;
            descriptor.deferred
        }
    }
}

impl Default for InterruptTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::testing::TestCpu;
    use crate::thread::ThreadState;
    use core::sync::atomic::{AtomicU32, Ordering};
    use system::caps::CapSet;

    fn setup() -> (Scheduler, InterruptTable, TaskHandle) {
        let mut sched = Scheduler::new();
        let kernel_task = sched.create_task("kernel", CapSet::all()).unwrap();
        (sched, InterruptTable::new(), kernel_task)
    }

    fn handled(_vector: u8) -> FastResult {
        FastResult::Handled
    }

    #[test]
    fn attach_programs_the_controller() {
        let (mut sched, mut irqs, kt) = setup();
        let cpu = TestCpu::new();

        irqs.attach(&mut sched, &cpu, kt, 7, 3, handled, None).unwrap();

        assert!(irqs.is_attached(7));
        assert_eq!(*cpu.unmasked.lock(), vec![(7, 3)]);
    }

    #[test]
    fn attach_without_deferred_spawns_no_worker() {
        let (mut sched, mut irqs, kt) = setup();
        let cpu = TestCpu::new();

        irqs.attach(&mut sched, &cpu, kt, 7, 3, handled, None).unwrap();

        assert_eq!(irqs.worker(7), None);
        assert!(sched.task(kt).unwrap().threads().is_empty());
    }

    #[test]
    fn attach_with_deferred_parks_a_worker() {
        let (mut sched, mut irqs, kt) = setup();
        let cpu = TestCpu::new();
        fn deferred(_vector: u8) {}

        irqs.attach(
            &mut sched,
            &cpu,
            kt,
            7,
            3,
            defer_all,
            Some(DeferredAction::Call(deferred)),
        )
        .unwrap();

        let worker = irqs.worker(7).unwrap();
        assert_eq!(sched.thread(worker).unwrap().state(), ThreadState::Sleep);
    }

    #[test]
    #[should_panic(expected = "attached twice")]
    fn double_attach_is_fatal() {
        let (mut sched, mut irqs, kt) = setup();
        let cpu = TestCpu::new();

        irqs.attach(&mut sched, &cpu, kt, 7, 3, handled, None).unwrap();
        let _ = irqs.attach(&mut sched, &cpu, kt, 7, 3, handled, None);
    }

    #[test]
    fn dispatch_of_an_unattached_vector_is_reported() {
        let (mut sched, mut irqs, _kt) = setup();
        assert_eq!(irqs.dispatch(&mut sched, 9), Err(SysError::NotFound));
    }

    #[test]
    fn dispatch_runs_the_fast_handler() {
        static CALLS: AtomicU32 = AtomicU32::new(0);
        fn fast(_vector: u8) -> FastResult {
            CALLS.fetch_add(1, Ordering::Relaxed);
            FastResult::Handled
        }

        let (mut sched, mut irqs, kt) = setup();
        let cpu = TestCpu::new();
        irqs.attach(&mut sched, &cpu, kt, 4, 2, fast, None).unwrap();

        irqs.dispatch(&mut sched, 4).unwrap();

        assert_eq!(CALLS.load(Ordering::Relaxed), 1);
        assert_eq!(irqs.dispatches(4), 1);
        assert_eq!(irqs.pending(4), 0);
    }

    #[test]
    fn continuation_counts_pending_and_wakes_the_worker() {
        let (mut sched, mut irqs, kt) = setup();
        let cpu = TestCpu::new();
        fn deferred(_vector: u8) {}
        irqs.attach(
            &mut sched,
            &cpu,
            kt,
            5,
            1,
            defer_all,
            Some(DeferredAction::Call(deferred)),
        )
        .unwrap();
        let worker = irqs.worker(5).unwrap();

        irqs.dispatch(&mut sched, 5).unwrap();

        assert_eq!(irqs.pending(5), 1);
        assert!(sched.thread(worker).unwrap().is_runnable());
    }

    #[test]
    fn n_continuations_before_the_worker_runs_mean_n_deferred_runs() {
        static RUNS: AtomicU32 = AtomicU32::new(0);
        fn deferred(_vector: u8) {
            RUNS.fetch_add(1, Ordering::Relaxed);
        }

        let (mut sched, mut irqs, kt) = setup();
        let cpu = TestCpu::new();
        irqs.attach(
            &mut sched,
            &cpu,
            kt,
            6,
            1,
            defer_all,
            Some(DeferredAction::Call(deferred)),
        )
        .unwrap();

        // Two interrupts fire before the worker is scheduled in.
        irqs.dispatch(&mut sched, 6).unwrap();
        irqs.dispatch(&mut sched, 6).unwrap();
        assert_eq!(irqs.pending(6), 2);

        // The worker loop drains exactly two requests, then parks.
        while let Some(action) = irqs.worker_step(&mut sched, 6, 0) {
            match action {
                DeferredAction::Call(handler) => handler(6),
                DeferredAction::PostSemaphore(_) => unreachable!(),
            }
        }

        assert_eq!(RUNS.load(Ordering::Relaxed), 2);
        assert_eq!(irqs.pending(6), 0);
        let worker = irqs.worker(6).unwrap();
        assert_eq!(sched.thread(worker).unwrap().state(), ThreadState::Sleep);
    }

    #[test]
    fn detach_masks_the_vector_and_reaps_the_worker() {
        let (mut sched, mut irqs, kt) = setup();
        let cpu = TestCpu::new();
        fn deferred(_vector: u8) {}
        irqs.attach(
            &mut sched,
            &cpu,
            kt,
            8,
            2,
            defer_all,
            Some(DeferredAction::Call(deferred)),
        )
        .unwrap();
        let worker = irqs.worker(8).unwrap();

        irqs.detach(&mut sched, &cpu, 8).unwrap();

        assert!(!irqs.is_attached(8));
        assert_eq!(*cpu.masked.lock(), vec![8]);
        assert!(sched.thread(worker).is_err());
        assert!(sched.task(kt).unwrap().threads().is_empty());
    }

    #[test]
    fn attach_rejects_an_out_of_range_vector() {
        let (mut sched, mut irqs, kt) = setup();
        let cpu = TestCpu::new();
        assert_eq!(
            irqs.attach(&mut sched, &cpu, kt, VECTOR_COUNT as u8, 1, handled, None),
            Err(SysError::InvalidArgument)
        );
    }
}
