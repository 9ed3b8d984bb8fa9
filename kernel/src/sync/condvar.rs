use alloc::vec::Vec;
use collections::generational_arena::{GenArena, Handle};
use system::caps::CapSet;
use system::error::SysError;

use crate::sched::Scheduler;
use crate::sync::mutex::MutexTable;
use crate::task::TaskHandle;
use crate::thread::{MutexHandle, ThreadHandle};
use crate::wait::{EventHandle, EventOwner, WaitResult};

pub type CondvarHandle = Handle;

pub const MAX_CONDVARS: usize = 128;

pub(crate) struct Condvar {
    pub(crate) owner: TaskHandle,
    pub(crate) waiters: u32,
    pub(crate) signalled: u32,
    pub(crate) event: EventHandle,
    // One entry per blocked waiter: which mutex it re-acquires on wake.
    pub(crate) bindings: Vec<(ThreadHandle, MutexHandle)>,
}

/// Condition variables. The signalled counter, not the wake itself, is
/// authoritative: a waiter reports success only by consuming a signal,
/// which makes spurious wakes harmless and lost signals impossible.
pub struct CondvarTable {
    condvars: GenArena<Condvar>,
    // Threads re-acquiring their mutex after a wake, with the final wait
    // result to report once the mutex is handed to them.
    reacquiring: Vec<(ThreadHandle, WaitResult)>,
}

impl CondvarTable {
    pub fn new() -> Self {
        Self {
            condvars: GenArena::with_capacity(MAX_CONDVARS),
            reacquiring: Vec::new(),
        }
    }

    fn get(&self, handle: CondvarHandle) -> Result<&Condvar, SysError> {
        self.condvars
            .get(handle)
            .map_err(|_| SysError::InvalidHandle)
    }

    fn get_mut(&mut self, handle: CondvarHandle) -> Result<&mut Condvar, SysError> {
        self.condvars
            .get_mut(handle)
            .map_err(|_| SysError::InvalidHandle)
    }

    fn check_access(
        &self,
        sched: &Scheduler,
        caller: ThreadHandle,
        handle: CondvarHandle,
    ) -> Result<(), SysError> {
        let owner = self.get(handle)?.owner;
        let caller_task = sched.thread(caller)?.task;
        if caller_task == owner {
            return Ok(());
        }
        if sched.task(caller_task)?.has_cap(CapSet::SEM_ACCESS) {
            Ok(())
        } else {
            Err(SysError::PermissionDenied)
        }
    }

    pub fn create(
        &mut self,
        sched: &mut Scheduler,
        owner: TaskHandle,
    ) -> Result<CondvarHandle, SysError> {
        sched.task(owner)?;
        let handle = self
            .condvars
            .insert(Condvar {
                owner,
                waiters: 0,
                signalled: 0,
                event: EventHandle::new(0, 0),
                bindings: Vec::new(),
            })
            .map_err(|_| SysError::NoSlots)?;
        let event = match sched.event_create("condvar", EventOwner::Condvar(handle)) {
            Ok(event) => event,
            Err(e) => {
                let _ = self.condvars.remove(handle);
                return Err(e);
            }
        };
        self.condvars.get_mut(handle).expect("just inserted").event = event;
        Ok(handle)
    }

    pub fn counters(&self, handle: CondvarHandle) -> Result<(u32, u32), SysError> {
        let cv = self.get(handle)?;
        Ok((cv.waiters, cv.signalled))
    }

    /// Atomically release the mutex and park on the variable. The caller
    /// must hold `mutex` exactly once; a recursive hold is rejected with
    /// the lock untouched.
    pub fn wait(
        &mut self,
        sched: &mut Scheduler,
        mutexes: &mut MutexTable,
        caller: ThreadHandle,
        handle: CondvarHandle,
        mutex: MutexHandle,
        timeout: u64,
        now: u64,
    ) -> Result<(), SysError> {
        self.check_access(sched, caller, handle)?;
        let event = self.get(handle)?.event;
        mutexes.release_for_wait(sched, caller, mutex)?;
        {
            let cv = self.get_mut(handle)?;
            cv.waiters += 1;
            cv.bindings.push((caller, mutex));
        }
        sched.block(caller, event, timeout, now);
        Ok(())
    }

    pub fn signal(
        &mut self,
        sched: &mut Scheduler,
        mutexes: &mut MutexTable,
        caller: ThreadHandle,
        handle: CondvarHandle,
    ) -> Result<Option<ThreadHandle>, SysError> {
        self.check_access(sched, caller, handle)?;
        let event = {
            let cv = self.get_mut(handle)?;
            if cv.signalled < cv.waiters {
                cv.signalled += 1;
            }
            cv.event
        };
        let woken = sched.wake_one(event);
        if let Some(thread) = woken {
            self.finish(sched, mutexes, handle, thread, WaitResult::Success);
        }
        Ok(woken)
    }

    pub fn broadcast(
        &mut self,
        sched: &mut Scheduler,
        mutexes: &mut MutexTable,
        caller: ThreadHandle,
        handle: CondvarHandle,
    ) -> Result<Vec<ThreadHandle>, SysError> {
        self.check_access(sched, caller, handle)?;
        let event = {
            let cv = self.get_mut(handle)?;
            cv.signalled = cv.waiters;
            cv.event
        };
        let woken = sched.wake_all(event);
        for &thread in &woken {
            self.finish(sched, mutexes, handle, thread, WaitResult::Success);
        }
        Ok(woken)
    }

    /// Complete a waiter's wake: consume a signal if one is available,
    /// then re-acquire the bound mutex, parking on its queue if it is
    /// held. The final result survives the re-acquisition.
    pub(crate) fn finish(
        &mut self,
        sched: &mut Scheduler,
        mutexes: &mut MutexTable,
        handle: CondvarHandle,
        thread: ThreadHandle,
        raw: WaitResult,
    ) {
        let (mutex, final_result) = {
            let cv = match self.condvars.get_mut(handle) {
                Ok(cv) => cv,
                Err(_) => return,
            };
            let position = match cv.bindings.iter().position(|(t, _)| *t == thread) {
                Some(position) => position,
                None => return,
            };
            let (_, mutex) = cv.bindings.remove(position);
            cv.waiters -= 1;
            let final_result = if cv.signalled > 0 {
                cv.signalled -= 1;
                WaitResult::Success
            } else {
                raw
            };
            (mutex, final_result)
        };
        match mutexes.holder(mutex) {
            Ok(None) => {
                mutexes.grant(sched, thread, mutex);
                sched.set_wait_result(thread, final_result);
            }
            Ok(Some(_)) => {
                self.reacquiring.push((thread, final_result));
                mutexes.park_waiter(sched, thread, mutex, 0, 0);
            }
            Err(_) => {
                // The mutex is gone; report the result without it.
                sched.set_wait_result(thread, final_result);
            }
        }
    }

    /// Called after a mutex hand-off: if the thread was re-acquiring for
    /// a condition wait, yields the preserved final result.
    pub fn take_reacquired(&mut self, thread: ThreadHandle) -> Option<WaitResult> {
        let position = self.reacquiring.iter().position(|(t, _)| *t == thread)?;
        Some(self.reacquiring.remove(position).1)
    }

    /// Drop a dying thread's wait bookkeeping without re-acquiring.
    pub(crate) fn purge_waiter(&mut self, handle: CondvarHandle, thread: ThreadHandle) {
        if let Ok(cv) = self.condvars.get_mut(handle) {
            if let Some(position) = cv.bindings.iter().position(|(t, _)| *t == thread) {
                cv.bindings.remove(position);
                cv.waiters -= 1;
                if cv.signalled > cv.waiters {
                    cv.signalled = cv.waiters;
                }
            }
        }
    }

    pub fn destroy(
        &mut self,
        sched: &mut Scheduler,
        caller: ThreadHandle,
        handle: CondvarHandle,
    ) -> Result<(), SysError> {
        let caller_task = sched.thread(caller)?.task;
        let (owner, waiters, event) = {
            let cv = self.get(handle)?;
            (cv.owner, cv.waiters, cv.event)
        };
        if owner != caller_task {
            return Err(SysError::NotOwner);
        }
        if waiters > 0 {
            return Err(SysError::Busy);
        }
        self.condvars
            .remove(handle)
            .map_err(|_| SysError::InvalidHandle)?;
        sched.event_destroy(event);
        Ok(())
    }

    /// Destroy every condition variable owned by a dying task. Waiters
    /// wake with `Invalidated` and do not re-acquire their mutex (it may
    /// be dying in the same teardown).
    pub fn force_destroy_owned(
        &mut self,
        sched: &mut Scheduler,
        task: TaskHandle,
    ) -> Vec<ThreadHandle> {
        let handles: Vec<CondvarHandle> = self
            .condvars
            .iter()
            .filter(|(_, cv)| cv.owner == task)
            .map(|(handle, _)| handle)
            .collect();
        let mut woken = Vec::new();
        for handle in handles {
            let cv = self.condvars.remove(handle).expect("collected above");
            woken.extend(sched.event_destroy(cv.event));
        }
        woken
    }
}

impl Default for CondvarTable {
    fn default() -> Self {
        Self::new()
    }
}
