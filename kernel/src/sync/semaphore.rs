use alloc::vec::Vec;
use collections::generational_arena::{GenArena, Handle};
use system::caps::CapSet;
use system::error::SysError;

use crate::sched::Scheduler;
use crate::task::TaskHandle;
use crate::thread::ThreadHandle;
use crate::wait::{EventHandle, EventOwner};

pub type SemHandle = Handle;

pub const MAX_SEMAPHORES: usize = 128;
pub const SEM_MAX_VALUE: u32 = i32::MAX as u32;

pub(crate) struct Semaphore {
    pub(crate) owner: TaskHandle,
    pub(crate) value: u32,
    pub(crate) event: EventHandle,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SemOutcome {
    Acquired,
    Blocked,
}

/// Counting semaphores. A post with waiters present hands the count
/// directly to the chosen highest-priority waiter, so the value never
/// bounces above zero while threads are queued.
pub struct SemaphoreTable {
    sems: GenArena<Semaphore>,
}

impl SemaphoreTable {
    pub fn new() -> Self {
        Self {
            sems: GenArena::with_capacity(MAX_SEMAPHORES),
        }
    }

    fn get(&self, handle: SemHandle) -> Result<&Semaphore, SysError> {
        self.sems.get(handle).map_err(|_| SysError::InvalidHandle)
    }

    fn get_mut(&mut self, handle: SemHandle) -> Result<&mut Semaphore, SysError> {
        self.sems
            .get_mut(handle)
            .map_err(|_| SysError::InvalidHandle)
    }

    fn check_access(
        &self,
        sched: &Scheduler,
        caller: ThreadHandle,
        handle: SemHandle,
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
        initial: u32,
    ) -> Result<SemHandle, SysError> {
        if initial > SEM_MAX_VALUE {
            return Err(SysError::InvalidArgument);
        }
        sched.task(owner)?;
        let handle = self
            .sems
            .insert(Semaphore {
                owner,
                value: initial,
                event: EventHandle::new(0, 0),
            })
            .map_err(|_| SysError::NoSlots)?;
        let event = match sched.event_create("semaphore", EventOwner::Semaphore(handle)) {
            Ok(event) => event,
            Err(e) => {
                let _ = self.sems.remove(handle);
                return Err(e);
            }
        };
        self.sems.get_mut(handle).expect("just inserted").event = event;
        Ok(handle)
    }

    pub fn value(&self, handle: SemHandle) -> Result<u32, SysError> {
        Ok(self.get(handle)?.value)
    }

    pub fn wait(
        &mut self,
        sched: &mut Scheduler,
        caller: ThreadHandle,
        handle: SemHandle,
        timeout: u64,
        now: u64,
    ) -> Result<SemOutcome, SysError> {
        self.check_access(sched, caller, handle)?;
        let sem = self.get_mut(handle)?;
        if sem.value > 0 {
            sem.value -= 1;
            Ok(SemOutcome::Acquired)
        } else {
            let event = sem.event;
            sched.block(caller, event, timeout, now);
            Ok(SemOutcome::Blocked)
        }
    }

    pub fn try_wait(
        &mut self,
        sched: &mut Scheduler,
        caller: ThreadHandle,
        handle: SemHandle,
    ) -> Result<(), SysError> {
        self.check_access(sched, caller, handle)?;
        let sem = self.get_mut(handle)?;
        if sem.value > 0 {
            sem.value -= 1;
            Ok(())
        } else {
            Err(SysError::WouldBlock)
        }
    }

    pub fn post(
        &mut self,
        sched: &mut Scheduler,
        caller: ThreadHandle,
        handle: SemHandle,
    ) -> Result<Option<ThreadHandle>, SysError> {
        self.check_access(sched, caller, handle)?;
        let event = self.get(handle)?.event;
        if let Some(woken) = sched.wake_one(event) {
            // The count is handed straight to the woken waiter.
            return Ok(Some(woken));
        }
        let sem = self.get_mut(handle)?;
        if sem.value == SEM_MAX_VALUE {
            return Err(SysError::Overflow);
        }
        sem.value += 1;
        Ok(None)
    }

    pub fn destroy(
        &mut self,
        sched: &mut Scheduler,
        caller: ThreadHandle,
        handle: SemHandle,
    ) -> Result<(), SysError> {
        let caller_task = sched.thread(caller)?.task;
        let (owner, event) = {
            let sem = self.get(handle)?;
            (sem.owner, sem.event)
        };
        if owner != caller_task {
            return Err(SysError::NotOwner);
        }
        if sched.waiter_count(event) > 0 {
            return Err(SysError::Busy);
        }
        self.sems.remove(handle).map_err(|_| SysError::InvalidHandle)?;
        sched.event_destroy(event);
        Ok(())
    }

    /// Destroy every semaphore owned by a dying task; waiters wake with
    /// `Invalidated`.
    pub fn force_destroy_owned(
        &mut self,
        sched: &mut Scheduler,
        task: TaskHandle,
    ) -> Vec<ThreadHandle> {
        let handles: Vec<SemHandle> = self
            .sems
            .iter()
            .filter(|(_, sem)| sem.owner == task)
            .map(|(handle, _)| handle)
            .collect();
        let mut woken = Vec::new();
        for handle in handles {
            let sem = self.sems.remove(handle).expect("collected above");
            woken.extend(sched.event_destroy(sem.event));
        }
        woken
    }
}

impl Default for SemaphoreTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::Priority;
    use crate::wait::WaitResult;

    fn setup() -> (Scheduler, SemaphoreTable, TaskHandle) {
        let mut sched = Scheduler::new();
        let task = sched.create_task("test", CapSet::empty()).unwrap();
        (sched, SemaphoreTable::new(), task)
    }

    fn spawn(sched: &mut Scheduler, task: TaskHandle, priority: Priority) -> ThreadHandle {
        sched.create_thread(task, "t", priority).unwrap()
    }

    #[test]
    fn create_rejects_a_value_above_max() {
        let (mut sched, mut sems, task) = setup();
        assert_eq!(
            sems.create(&mut sched, task, SEM_MAX_VALUE + 1),
            Err(SysError::InvalidArgument)
        );
    }

    #[test]
    fn wait_decrements_a_positive_value() {
        let (mut sched, mut sems, task) = setup();
        let t = spawn(&mut sched, task, 10);
        let s = sems.create(&mut sched, task, 2).unwrap();

        assert_eq!(sems.wait(&mut sched, t, s, 0, 0), Ok(SemOutcome::Acquired));
        assert_eq!(sems.value(s), Ok(1));
    }

    #[test]
    fn wait_blocks_at_zero() {
        let (mut sched, mut sems, task) = setup();
        let t = spawn(&mut sched, task, 10);
        let s = sems.create(&mut sched, task, 0).unwrap();

        assert_eq!(sems.wait(&mut sched, t, s, 0, 0), Ok(SemOutcome::Blocked));
        assert!(!sched.thread(t).unwrap().is_runnable());
    }

    #[test]
    fn try_wait_fails_at_zero_without_blocking() {
        let (mut sched, mut sems, task) = setup();
        let t = spawn(&mut sched, task, 10);
        let s = sems.create(&mut sched, task, 0).unwrap();

        assert_eq!(sems.try_wait(&mut sched, t, s), Err(SysError::WouldBlock));
        assert!(sched.thread(t).unwrap().is_runnable());
    }

    #[test]
    fn post_without_waiters_increments() {
        let (mut sched, mut sems, task) = setup();
        let t = spawn(&mut sched, task, 10);
        let s = sems.create(&mut sched, task, 0).unwrap();

        assert_eq!(sems.post(&mut sched, t, s), Ok(None));
        assert_eq!(sems.value(s), Ok(1));
    }

    #[test]
    fn post_hands_the_count_to_a_blocked_waiter() {
        let (mut sched, mut sems, task) = setup();
        let t1 = spawn(&mut sched, task, 10);
        let t2 = spawn(&mut sched, task, 10);
        let s = sems.create(&mut sched, task, 0).unwrap();

        assert_eq!(sems.wait(&mut sched, t2, s, 0, 0), Ok(SemOutcome::Blocked));
        assert_eq!(sems.post(&mut sched, t1, s), Ok(Some(t2)));

        assert_eq!(sched.thread(t2).unwrap().wait_result(), WaitResult::Success);
        assert!(sched.thread(t2).unwrap().is_runnable());
        assert_eq!(sems.value(s), Ok(0));
    }

    #[test]
    fn post_wakes_the_highest_priority_waiter() {
        let (mut sched, mut sems, task) = setup();
        let poster = spawn(&mut sched, task, 10);
        let low = spawn(&mut sched, task, 5);
        let high = spawn(&mut sched, task, 20);
        let s = sems.create(&mut sched, task, 0).unwrap();
        sems.wait(&mut sched, low, s, 0, 0).unwrap();
        sems.wait(&mut sched, high, s, 0, 0).unwrap();

        assert_eq!(sems.post(&mut sched, poster, s), Ok(Some(high)));
        assert!(!sched.thread(low).unwrap().is_runnable());
    }

    #[test]
    fn post_at_max_value_overflows() {
        let (mut sched, mut sems, task) = setup();
        let t = spawn(&mut sched, task, 10);
        let s = sems.create(&mut sched, task, SEM_MAX_VALUE).unwrap();

        assert_eq!(sems.post(&mut sched, t, s), Err(SysError::Overflow));
        assert_eq!(sems.value(s), Ok(SEM_MAX_VALUE));
    }

    #[test]
    fn value_stays_in_range_across_interleavings() {
        let (mut sched, mut sems, task) = setup();
        let t = spawn(&mut sched, task, 10);
        let s = sems.create(&mut sched, task, 1).unwrap();

        for _ in 0..16 {
            sems.post(&mut sched, t, s).unwrap();
            assert!(sems.value(s).unwrap() <= SEM_MAX_VALUE);
            sems.wait(&mut sched, t, s, 0, 0).unwrap();
            sems.wait(&mut sched, t, s, 0, 0).unwrap();
            assert_eq!(sems.wait(&mut sched, t, s, 0, 0), Ok(SemOutcome::Blocked));
            sems.post(&mut sched, t, s).unwrap();
            sems.post(&mut sched, t, s).unwrap();
        }
        assert_eq!(sems.value(s), Ok(1));
    }

    #[test]
    fn timed_out_wait_reports_through_the_result_channel() {
        let (mut sched, mut sems, task) = setup();
        let t = spawn(&mut sched, task, 10);
        let s = sems.create(&mut sched, task, 0).unwrap();
        sems.wait(&mut sched, t, s, 50, 0).unwrap();

        let woken = sched.tick(50);

        assert_eq!(woken.len(), 1);
        assert_eq!(
            sched.thread(t).unwrap().wait_result(),
            WaitResult::TimedOut
        );
        assert_eq!(sems.value(s), Ok(0));
    }

    #[test]
    fn cross_task_access_requires_the_capability() {
        let (mut sched, mut sems, owner_task) = setup();
        let other = sched.create_task("other", CapSet::empty()).unwrap();
        let stranger = spawn(&mut sched, other, 10);
        let s = sems.create(&mut sched, owner_task, 1).unwrap();

        assert_eq!(
            sems.wait(&mut sched, stranger, s, 0, 0),
            Err(SysError::PermissionDenied)
        );
        assert_eq!(
            sems.post(&mut sched, stranger, s),
            Err(SysError::PermissionDenied)
        );
    }

    #[test]
    fn capability_grants_cross_task_access() {
        let (mut sched, mut sems, owner_task) = setup();
        let other = sched.create_task("other", CapSet::SEM_ACCESS).unwrap();
        let stranger = spawn(&mut sched, other, 10);
        let s = sems.create(&mut sched, owner_task, 1).unwrap();

        assert_eq!(
            sems.wait(&mut sched, stranger, s, 0, 0),
            Ok(SemOutcome::Acquired)
        );
    }

    #[test]
    fn destroy_fails_while_threads_are_queued() {
        let (mut sched, mut sems, task) = setup();
        let t = spawn(&mut sched, task, 10);
        let waiter = spawn(&mut sched, task, 10);
        let s = sems.create(&mut sched, task, 0).unwrap();
        sems.wait(&mut sched, waiter, s, 0, 0).unwrap();

        assert_eq!(sems.destroy(&mut sched, t, s), Err(SysError::Busy));
    }

    #[test]
    fn destroy_of_an_idle_semaphore_succeeds() {
        let (mut sched, mut sems, task) = setup();
        let t = spawn(&mut sched, task, 10);
        let s = sems.create(&mut sched, task, 3).unwrap();

        assert_eq!(sems.destroy(&mut sched, t, s), Ok(()));
        assert_eq!(sems.value(s), Err(SysError::InvalidHandle));
    }

    #[test]
    fn force_destroy_invalidates_waiters() {
        let (mut sched, mut sems, task) = setup();
        let waiter = spawn(&mut sched, task, 10);
        let s = sems.create(&mut sched, task, 0).unwrap();
        sems.wait(&mut sched, waiter, s, 0, 0).unwrap();

        let woken = sems.force_destroy_owned(&mut sched, task);

        assert_eq!(woken, vec![waiter]);
        assert_eq!(
            sched.thread(waiter).unwrap().wait_result(),
            WaitResult::Invalidated
        );
    }
}
