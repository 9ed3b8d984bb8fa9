use alloc::vec::Vec;
use system::caps::CapSet;
use system::error::SysError;
use system::message::Message;

use crate::cpu::Cpu;
use crate::exception::{self, PostOutcome};
use crate::irq::{DeferredAction, FastHandler, InterruptTable, defer_all};
use crate::object::{ObjectTable, RecvOutcome, ReplyToken};
use crate::sched::Scheduler;
use crate::sync::condvar::CondvarHandle;
use crate::sync::semaphore::SemHandle;
use crate::sync::{CondvarTable, MutexTable, SemaphoreTable};
use crate::task::{ObjectHandle, TaskHandle};
use crate::thread::{MutexHandle, ThreadHandle};
use crate::wait::{EventHandle, EventOwner, WaitResult};

/// The composition root: every kernel table plus the glue that spans
/// them. All methods run inside the critical section; the tables
/// themselves carry the per-primitive logic.
pub struct Kernel {
    pub(crate) cpu: &'static dyn Cpu,
    pub(crate) sched: Scheduler,
    pub(crate) mutexes: MutexTable,
    pub(crate) semaphores: SemaphoreTable,
    pub(crate) condvars: CondvarTable,
    pub(crate) objects: ObjectTable,
    pub(crate) interrupts: InterruptTable,
    kernel_task: TaskHandle,
}

impl Kernel {
    pub fn new(cpu: &'static dyn Cpu) -> Self {
        let mut sched = Scheduler::new();
        let kernel_task = sched
            .create_task("kernel", CapSet::all())
            .expect("kernel task allocation at boot");
        Self {
            cpu,
            sched,
            mutexes: MutexTable::new(),
            semaphores: SemaphoreTable::new(),
            condvars: CondvarTable::new(),
            objects: ObjectTable::new(),
            interrupts: InterruptTable::new(),
            kernel_task,
        }
    }

    pub fn kernel_task(&self) -> TaskHandle {
        self.kernel_task
    }

    pub fn cpu(&self) -> &'static dyn Cpu {
        self.cpu
    }

    pub fn now(&self) -> u64 {
        self.cpu.system_time()
    }

    // ---- cross-table synchronization glue ----

    /// Unlock with condition-variable awareness: when the hand-off goes
    /// to a thread that was re-acquiring inside a condition wait, its
    /// preserved final result replaces the hand-off's success.
    pub fn mutex_unlock(
        &mut self,
        caller: ThreadHandle,
        handle: MutexHandle,
    ) -> Result<(), SysError> {
        let woken = self.mutexes.unlock(&mut self.sched, caller, handle)?;
        if let Some(thread) = woken {
            if let Some(result) = self.condvars.take_reacquired(thread) {
                self.sched.set_wait_result(thread, result);
            }
        }
        Ok(())
    }

    pub fn cond_wait(
        &mut self,
        caller: ThreadHandle,
        cv: CondvarHandle,
        mutex: MutexHandle,
        timeout: u64,
        now: u64,
    ) -> Result<(), SysError> {
        self.condvars.wait(
            &mut self.sched,
            &mut self.mutexes,
            caller,
            cv,
            mutex,
            timeout,
            now,
        )
    }

    pub fn cond_signal(
        &mut self,
        caller: ThreadHandle,
        cv: CondvarHandle,
    ) -> Result<Option<ThreadHandle>, SysError> {
        self.condvars
            .signal(&mut self.sched, &mut self.mutexes, caller, cv)
    }

    pub fn cond_broadcast(
        &mut self,
        caller: ThreadHandle,
        cv: CondvarHandle,
    ) -> Result<Vec<ThreadHandle>, SysError> {
        self.condvars
            .broadcast(&mut self.sched, &mut self.mutexes, caller, cv)
    }

    /// Change a thread's base priority; its effective priority follows
    /// unless inheritance holds it higher.
    pub fn set_thread_priority(
        &mut self,
        thread: ThreadHandle,
        priority: u8,
    ) -> Result<(), SysError> {
        self.sched.set_base_priority(thread, priority)?;
        self.mutexes.refresh_effective(&mut self.sched, thread);
        Ok(())
    }

    // ---- generic wakeup routing ----

    /// Advance the timeout wheel and restore per-primitive bookkeeping
    /// for every expired wait.
    pub fn tick(&mut self, now: u64) {
        for (thread, event) in self.sched.tick(now) {
            self.route_abnormal(thread, event, WaitResult::TimedOut);
        }
    }

    /// A thread left `event` through something other than the
    /// primitive's own wake path; let the owning primitive clean up.
    fn route_abnormal(&mut self, thread: ThreadHandle, event: EventHandle, raw: WaitResult) {
        match self.sched.event_owner(event) {
            Some(EventOwner::Mutex(mutex)) => {
                self.mutexes.on_abnormal_wake(&mut self.sched, thread, mutex);
                // A condition waiter evicted mid-reacquire reports the
                // eviction, not its preserved result.
                let _ = self.condvars.take_reacquired(thread);
            }
            Some(EventOwner::Condvar(cv)) => {
                self.condvars
                    .finish(&mut self.sched, &mut self.mutexes, cv, thread, raw);
            }
            Some(EventOwner::Object(object)) => {
                self.objects.on_abnormal_wake(object, thread);
            }
            Some(EventOwner::Exception(_)) => {
                if let Ok(t) = self.sched.thread_mut(thread) {
                    t.awaiting_exception = false;
                }
            }
            Some(EventOwner::Semaphore(_)) | Some(EventOwner::Irq(_)) | Some(EventOwner::Plain)
            | None => {}
        }
    }

    // ---- exceptions ----

    pub fn raise_exception(
        &mut self,
        caller: ThreadHandle,
        target_task: TaskHandle,
        kind: u8,
    ) -> Result<ThreadHandle, SysError> {
        let (chosen, evicted) = exception::raise(&mut self.sched, caller, target_task, kind)?;
        if let Some(event) = evicted {
            self.route_abnormal(chosen, event, WaitResult::Interrupted);
        }
        Ok(chosen)
    }

    /// Synchronous hardware fault on `thread`. A task without a handler
    /// dies; the kernel carries on.
    pub fn post_fault(&mut self, thread: ThreadHandle, kind: u8) -> Result<(), SysError> {
        match exception::post(&mut self.sched, thread, kind)? {
            PostOutcome::Pending => Ok(()),
            PostOutcome::TaskUnhandled => {
                let task = self.sched.thread(thread)?.task;
                self.terminate_task(task)
            }
        }
    }

    /// Run once per return to user mode.
    pub fn on_return_to_user(&mut self, thread: ThreadHandle) -> Option<u8> {
        exception::deliver(&mut self.sched, thread)
    }

    // ---- interrupts ----

    pub fn irq_attach(
        &mut self,
        vector: u8,
        level: u8,
        fast: FastHandler,
        deferred: Option<DeferredAction>,
    ) -> Result<(), SysError> {
        self.interrupts.attach(
            &mut self.sched,
            self.cpu,
            self.kernel_task,
            vector,
            level,
            fast,
            deferred,
        )
    }

    /// User-driver attachment: all work is deferred to a post of the
    /// driver's semaphore.
    pub fn irq_attach_user(
        &mut self,
        vector: u8,
        level: u8,
        sem: SemHandle,
    ) -> Result<(), SysError> {
        self.semaphores.value(sem)?;
        self.irq_attach(vector, level, defer_all, Some(DeferredAction::PostSemaphore(sem)))
    }

    pub fn irq_detach(&mut self, vector: u8) -> Result<(), SysError> {
        self.interrupts.detach(&mut self.sched, self.cpu, vector)
    }

    pub fn irq_dispatch(&mut self, vector: u8) -> Result<(), SysError> {
        self.interrupts.dispatch(&mut self.sched, vector)
    }

    /// One iteration of a deferred worker's loop; reports whether a
    /// request was consumed.
    pub fn irq_worker_step(&mut self, vector: u8, now: u64) -> bool {
        match self.interrupts.worker_step(&mut self.sched, vector, now) {
            Some(DeferredAction::Call(handler)) => {
                handler(vector);
                true
            }
            Some(DeferredAction::PostSemaphore(sem)) => {
                let worker = self
                    .interrupts
                    .worker(vector)
                    .expect("semaphore action implies a worker");
                let _ = self.semaphores.post(&mut self.sched, worker, sem);
                true
            }
            None => false,
        }
    }

    // ---- messaging glue ----

    pub fn object_send(
        &mut self,
        caller: ThreadHandle,
        object: ObjectHandle,
        message: Message,
        timeout: u64,
        now: u64,
    ) -> Result<Option<ThreadHandle>, SysError> {
        self.objects
            .send(&mut self.sched, caller, object, message, timeout, now)
    }

    pub fn object_receive(
        &mut self,
        caller: ThreadHandle,
        object: ObjectHandle,
        timeout: u64,
        now: u64,
    ) -> Result<RecvOutcome, SysError> {
        self.objects
            .receive(&mut self.sched, caller, object, timeout, now)
    }

    pub fn object_reply(
        &mut self,
        object: ObjectHandle,
        token: ReplyToken,
        message: Message,
    ) -> Result<ThreadHandle, SysError> {
        self.objects.reply(&mut self.sched, object, token, message)
    }

    // ---- task teardown ----

    /// Tear a task down: every object, semaphore, condition variable and
    /// mutex it owns is force-released, every thread it contains is
    /// reaped, and every waiter anywhere is unblocked with an error
    /// exactly once.
    pub fn terminate_task(&mut self, task: TaskHandle) -> Result<(), SysError> {
        if task == self.kernel_task {
            return Err(SysError::PermissionDenied);
        }
        self.sched.task(task)?;

        let owned_objects: Vec<ObjectHandle> = self.sched.task(task)?.objects.clone();
        for object in owned_objects {
            self.objects.force_destroy(&mut self.sched, object);
        }

        self.semaphores.force_destroy_owned(&mut self.sched, task);
        self.condvars.force_destroy_owned(&mut self.sched, task);

        let threads: Vec<ThreadHandle> = self.sched.task(task)?.threads.clone();
        for &thread in &threads {
            for woken in self.mutexes.force_release_held(&mut self.sched, thread) {
                let _ = self.condvars.take_reacquired(woken);
            }
        }
        for woken in self.mutexes.force_destroy_owned(&mut self.sched, task) {
            let _ = self.condvars.take_reacquired(woken);
        }

        for thread in threads {
            if let Some(event) = self.sched.force_unblock(thread, WaitResult::Invalidated) {
                self.route_dying_thread(thread, event);
            }
            self.sched.exit_thread(thread);
            self.sched.reap_thread(thread);
        }

        let exception_event = self.sched.task(task)?.exception_event;
        self.sched.event_destroy(exception_event);
        self.sched.remove_task(task);
        Ok(())
    }

    /// Purge a dying thread from the primitive that was parking it. No
    /// results are reported; the thread is going away.
    fn route_dying_thread(&mut self, thread: ThreadHandle, event: EventHandle) {
        match self.sched.event_owner(event) {
            Some(EventOwner::Mutex(mutex)) => {
                self.mutexes.on_abnormal_wake(&mut self.sched, thread, mutex);
                let _ = self.condvars.take_reacquired(thread);
            }
            Some(EventOwner::Condvar(cv)) => {
                self.condvars.purge_waiter(cv, thread);
            }
            Some(EventOwner::Object(object)) => {
                self.objects.on_abnormal_wake(object, thread);
            }
            _ => {}
        }
    }
}
