use alloc::vec::Vec;
use collections::generational_arena::GenArena;
use system::error::SysError;

use crate::sched::Scheduler;
use crate::task::TaskHandle;
use crate::thread::{MutexHandle, ThreadHandle};
use crate::wait::{EventHandle, EventOwner, WaitResult};

pub const MAX_MUTEXES: usize = 128;

pub(crate) struct Mutex {
    pub(crate) owner_task: TaskHandle,
    pub(crate) holder: Option<ThreadHandle>,
    pub(crate) count: u32,
    pub(crate) event: EventHandle,
}

#[derive(Debug, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    Blocked,
}

/// Recursive mutexes with priority inheritance. While any thread is
/// queued, the holder's effective priority is kept at or above the
/// highest queued priority, and a release hands the mutex directly to the
/// chosen waiter.
pub struct MutexTable {
    mutexes: GenArena<Mutex>,
}

impl MutexTable {
    pub fn new() -> Self {
        Self {
            mutexes: GenArena::with_capacity(MAX_MUTEXES),
        }
    }

    fn get(&self, handle: MutexHandle) -> Result<&Mutex, SysError> {
        self.mutexes.get(handle).map_err(|_| SysError::InvalidHandle)
    }

    fn get_mut(&mut self, handle: MutexHandle) -> Result<&mut Mutex, SysError> {
        self.mutexes
            .get_mut(handle)
            .map_err(|_| SysError::InvalidHandle)
    }

    pub fn create(
        &mut self,
        sched: &mut Scheduler,
        owner_task: TaskHandle,
    ) -> Result<MutexHandle, SysError> {
        sched.task(owner_task)?;
        let handle = self
            .mutexes
            .insert(Mutex {
                owner_task,
                holder: None,
                count: 0,
                event: EventHandle::new(0, 0),
            })
            .map_err(|_| SysError::NoSlots)?;
        let event = match sched.event_create("mutex", EventOwner::Mutex(handle)) {
            Ok(event) => event,
            Err(e) => {
                let _ = self.mutexes.remove(handle);
                return Err(e);
            }
        };
        self.mutexes.get_mut(handle).expect("just inserted").event = event;
        Ok(handle)
    }

    pub fn holder(&self, handle: MutexHandle) -> Result<Option<ThreadHandle>, SysError> {
        Ok(self.get(handle)?.holder)
    }

    pub fn count(&self, handle: MutexHandle) -> Result<u32, SysError> {
        Ok(self.get(handle)?.count)
    }

    pub fn lock(
        &mut self,
        sched: &mut Scheduler,
        caller: ThreadHandle,
        handle: MutexHandle,
        timeout: u64,
        now: u64,
    ) -> Result<LockOutcome, SysError> {
        sched.thread(caller)?;
        let holder = self.get(handle)?.holder;
        match holder {
            None => {
                self.grant(sched, caller, handle);
                Ok(LockOutcome::Acquired)
            }
            Some(h) if h == caller => {
                self.get_mut(handle)?.count += 1;
                Ok(LockOutcome::Acquired)
            }
            Some(_) => {
                self.park_waiter(sched, caller, handle, timeout, now);
                Ok(LockOutcome::Blocked)
            }
        }
    }

    pub fn try_lock(
        &mut self,
        sched: &mut Scheduler,
        caller: ThreadHandle,
        handle: MutexHandle,
    ) -> Result<(), SysError> {
        sched.thread(caller)?;
        let holder = self.get(handle)?.holder;
        match holder {
            None => {
                self.grant(sched, caller, handle);
                Ok(())
            }
            Some(h) if h == caller => {
                self.get_mut(handle)?.count += 1;
                Ok(())
            }
            Some(_) => Err(SysError::WouldBlock),
        }
    }

    pub fn unlock(
        &mut self,
        sched: &mut Scheduler,
        caller: ThreadHandle,
        handle: MutexHandle,
    ) -> Result<Option<ThreadHandle>, SysError> {
        {
            let m = self.get(handle)?;
            if m.holder != Some(caller) {
                return Err(SysError::NotOwner);
            }
        }
        let remaining = {
            let m = self.get_mut(handle)?;
            m.count -= 1;
            m.count
        };
        if remaining > 0 {
            return Ok(None);
        }
        Ok(self.hand_off(sched, caller, handle))
    }

    /// Atomic "unlock fully and report" used by the condition variable.
    /// A release attempted with more than one recursive level held is a
    /// lock-ordering bug in the making and is rejected with the lock
    /// state unchanged.
    pub fn release_for_wait(
        &mut self,
        sched: &mut Scheduler,
        caller: ThreadHandle,
        handle: MutexHandle,
    ) -> Result<u32, SysError> {
        let count = {
            let m = self.get(handle)?;
            if m.holder != Some(caller) {
                return Err(SysError::NotOwner);
            }
            m.count
        };
        if count > 1 {
            return Err(SysError::DeadlockAvoided);
        }
        self.get_mut(handle)?.count = 0;
        self.hand_off(sched, caller, handle);
        Ok(count)
    }

    pub(crate) fn grant(&mut self, sched: &mut Scheduler, thread: ThreadHandle, handle: MutexHandle) {
        {
            let m = self.mutexes.get_mut(handle).expect("grant on a live mutex");
            m.holder = Some(thread);
            m.count = 1;
        }
        if let Ok(t) = sched.thread_mut(thread) {
            t.held_mutexes.push(handle);
        }
    }

    pub(crate) fn park_waiter(
        &mut self,
        sched: &mut Scheduler,
        thread: ThreadHandle,
        handle: MutexHandle,
        timeout: u64,
        now: u64,
    ) {
        let (event, holder) = {
            let m = self.mutexes.get(handle).expect("park on a live mutex");
            (m.event, m.holder)
        };
        if let Ok(t) = sched.thread_mut(thread) {
            t.pending_mutex = Some(handle);
        }
        sched.block(thread, event, timeout, now);
        if let Some(holder) = holder {
            self.refresh_effective(sched, holder);
        }
    }

    fn hand_off(
        &mut self,
        sched: &mut Scheduler,
        previous: ThreadHandle,
        handle: MutexHandle,
    ) -> Option<ThreadHandle> {
        if let Ok(t) = sched.thread_mut(previous) {
            t.held_mutexes.retain(|m| *m != handle);
        }
        let event = self.mutexes.get(handle).expect("live mutex").event;
        let next = sched.wake_one(event);
        match next {
            Some(next) => {
                {
                    let m = self.mutexes.get_mut(handle).expect("live mutex");
                    m.holder = Some(next);
                    m.count = 1;
                }
                if let Ok(t) = sched.thread_mut(next) {
                    t.pending_mutex = None;
                    t.held_mutexes.push(handle);
                }
                self.refresh_effective(sched, next);
            }
            None => {
                self.mutexes.get_mut(handle).expect("live mutex").holder = None;
            }
        }
        self.refresh_effective(sched, previous);
        next
    }

    /// Recompute a thread's effective priority from its base and the
    /// waiters of every mutex it holds, then walk the chain: if the
    /// thread is itself blocked on a mutex, its new priority may change
    /// what that mutex's holder must inherit.
    pub(crate) fn refresh_effective(&self, sched: &mut Scheduler, thread: ThreadHandle) {
        let mut thread = thread;
        for _ in 0..MAX_MUTEXES {
            let (base, held, current_priority, pending) = match sched.thread(thread) {
                Ok(t) => (
                    t.base_priority,
                    t.held_mutexes.clone(),
                    t.priority,
                    t.pending_mutex,
                ),
                Err(_) => return,
            };
            let mut effective = base;
            for handle in held {
                if let Ok(mutex) = self.mutexes.get(handle) {
                    if let Some(waiter) = sched.max_waiter_priority(mutex.event) {
                        if waiter > effective {
                            effective = waiter;
                        }
                    }
                }
            }
            if effective == current_priority {
                return;
            }
            sched.apply_priority(thread, effective);
            match pending
                .and_then(|m| self.mutexes.get(m).ok())
                .and_then(|m| m.holder)
            {
                Some(holder) => thread = holder,
                None => return,
            }
        }
    }

    /// A waiter left the queue through timeout or teardown rather than a
    /// hand-off.
    pub fn on_abnormal_wake(
        &mut self,
        sched: &mut Scheduler,
        thread: ThreadHandle,
        handle: MutexHandle,
    ) {
        if let Ok(t) = sched.thread_mut(thread) {
            t.pending_mutex = None;
        }
        if let Ok(m) = self.get(handle) {
            if let Some(holder) = m.holder {
                self.refresh_effective(sched, holder);
            }
        }
    }

    pub fn destroy(
        &mut self,
        sched: &mut Scheduler,
        caller: ThreadHandle,
        handle: MutexHandle,
    ) -> Result<(), SysError> {
        let caller_task = sched.thread(caller)?.task;
        let (owner_task, holder, event) = {
            let m = self.get(handle)?;
            (m.owner_task, m.holder, m.event)
        };
        if owner_task != caller_task {
            return Err(SysError::NotOwner);
        }
        if holder.is_some() || sched.waiter_count(event) > 0 {
            return Err(SysError::Busy);
        }
        self.mutexes.remove(handle).map_err(|_| SysError::InvalidHandle)?;
        sched.event_destroy(event);
        Ok(())
    }

    /// Force-release every mutex held by `thread` (its task is dying).
    /// Queued waiters wake with `Broken`; nobody inherits the lock.
    pub fn force_release_held(
        &mut self,
        sched: &mut Scheduler,
        thread: ThreadHandle,
    ) -> Vec<ThreadHandle> {
        let held = match sched.thread(thread) {
            Ok(t) => t.held_mutexes.clone(),
            Err(_) => return Vec::new(),
        };
        let mut woken = Vec::new();
        for handle in held {
            let event = {
                let m = match self.mutexes.get_mut(handle) {
                    Ok(m) => m,
                    Err(_) => continue,
                };
                m.holder = None;
                m.count = 0;
                m.event
            };
            for waiter in sched.wake_all_with(event, WaitResult::Broken) {
                if let Ok(t) = sched.thread_mut(waiter) {
                    t.pending_mutex = None;
                }
                woken.push(waiter);
            }
        }
        if let Ok(t) = sched.thread_mut(thread) {
            t.held_mutexes.clear();
        }
        woken
    }

    /// Destroy every mutex owned by a dying task; remaining waiters wake
    /// with `Invalidated`.
    pub fn force_destroy_owned(
        &mut self,
        sched: &mut Scheduler,
        task: TaskHandle,
    ) -> Vec<ThreadHandle> {
        let handles: Vec<MutexHandle> = self
            .mutexes
            .iter()
            .filter(|(_, m)| m.owner_task == task)
            .map(|(handle, _)| handle)
            .collect();
        let mut woken = Vec::new();
        for handle in handles {
            let mutex = self.mutexes.remove(handle).expect("collected above");
            if let Some(holder) = mutex.holder {
                if let Ok(t) = sched.thread_mut(holder) {
                    t.held_mutexes.retain(|m| *m != handle);
                }
            }
            for waiter in sched.event_destroy(mutex.event) {
                if let Ok(t) = sched.thread_mut(waiter) {
                    t.pending_mutex = None;
                }
                woken.push(waiter);
            }
        }
        woken
    }
}

impl Default for MutexTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::Priority;
    use system::caps::CapSet;

    fn setup() -> (Scheduler, MutexTable, TaskHandle) {
        let mut sched = Scheduler::new();
        let task = sched.create_task("test", CapSet::empty()).unwrap();
        (sched, MutexTable::new(), task)
    }

    fn spawn(sched: &mut Scheduler, task: TaskHandle, priority: Priority) -> ThreadHandle {
        sched.create_thread(task, "t", priority).unwrap()
    }

    #[test]
    fn uncontended_lock_acquires_immediately() {
        let (mut sched, mut mutexes, task) = setup();
        let t = spawn(&mut sched, task, 10);
        let m = mutexes.create(&mut sched, task).unwrap();

        assert_eq!(mutexes.lock(&mut sched, t, m, 0, 0), Ok(LockOutcome::Acquired));
        assert_eq!(mutexes.holder(m), Ok(Some(t)));
        assert_eq!(mutexes.count(m), Ok(1));
    }

    #[test]
    fn holder_can_relock_recursively() {
        let (mut sched, mut mutexes, task) = setup();
        let t = spawn(&mut sched, task, 10);
        let m = mutexes.create(&mut sched, task).unwrap();
        mutexes.lock(&mut sched, t, m, 0, 0).unwrap();

        assert_eq!(mutexes.lock(&mut sched, t, m, 0, 0), Ok(LockOutcome::Acquired));
        assert_eq!(mutexes.count(m), Ok(2));
    }

    #[test]
    fn second_thread_blocks_on_a_held_mutex() {
        let (mut sched, mut mutexes, task) = setup();
        let a = spawn(&mut sched, task, 10);
        let b = spawn(&mut sched, task, 10);
        let m = mutexes.create(&mut sched, task).unwrap();
        mutexes.lock(&mut sched, a, m, 0, 0).unwrap();

        assert_eq!(mutexes.lock(&mut sched, b, m, 0, 0), Ok(LockOutcome::Blocked));
        assert!(!sched.thread(b).unwrap().is_runnable());
    }

    #[test]
    fn try_lock_fails_without_blocking() {
        let (mut sched, mut mutexes, task) = setup();
        let a = spawn(&mut sched, task, 10);
        let b = spawn(&mut sched, task, 10);
        let m = mutexes.create(&mut sched, task).unwrap();
        mutexes.lock(&mut sched, a, m, 0, 0).unwrap();

        assert_eq!(mutexes.try_lock(&mut sched, b, m), Err(SysError::WouldBlock));
        assert!(sched.thread(b).unwrap().is_runnable());
    }

    #[test]
    fn only_the_holder_may_unlock() {
        let (mut sched, mut mutexes, task) = setup();
        let a = spawn(&mut sched, task, 10);
        let b = spawn(&mut sched, task, 10);
        let m = mutexes.create(&mut sched, task).unwrap();
        mutexes.lock(&mut sched, a, m, 0, 0).unwrap();

        assert_eq!(mutexes.unlock(&mut sched, b, m), Err(SysError::NotOwner));
    }

    #[test]
    fn recursive_unlock_releases_one_level_at_a_time() {
        let (mut sched, mut mutexes, task) = setup();
        let t = spawn(&mut sched, task, 10);
        let m = mutexes.create(&mut sched, task).unwrap();
        mutexes.lock(&mut sched, t, m, 0, 0).unwrap();
        mutexes.lock(&mut sched, t, m, 0, 0).unwrap();

        assert_eq!(mutexes.unlock(&mut sched, t, m), Ok(None));
        assert_eq!(mutexes.holder(m), Ok(Some(t)));

        assert_eq!(mutexes.unlock(&mut sched, t, m), Ok(None));
        assert_eq!(mutexes.holder(m), Ok(None));
    }

    #[test]
    fn unlock_hands_off_to_the_highest_priority_waiter() {
        let (mut sched, mut mutexes, task) = setup();
        let a = spawn(&mut sched, task, 10);
        let low = spawn(&mut sched, task, 5);
        let high = spawn(&mut sched, task, 20);
        let m = mutexes.create(&mut sched, task).unwrap();
        mutexes.lock(&mut sched, a, m, 0, 0).unwrap();
        mutexes.lock(&mut sched, low, m, 0, 0).unwrap();
        mutexes.lock(&mut sched, high, m, 0, 0).unwrap();

        assert_eq!(mutexes.unlock(&mut sched, a, m), Ok(Some(high)));

        assert_eq!(mutexes.holder(m), Ok(Some(high)));
        assert_eq!(mutexes.count(m), Ok(1));
        assert_eq!(
            sched.thread(high).unwrap().wait_result(),
            WaitResult::Success
        );
        assert!(!sched.thread(low).unwrap().is_runnable());
    }

    #[test]
    fn holder_inherits_the_highest_waiter_priority() {
        let (mut sched, mut mutexes, task) = setup();
        let holder = spawn(&mut sched, task, 5);
        let waiter = spawn(&mut sched, task, 20);
        let m = mutexes.create(&mut sched, task).unwrap();
        mutexes.lock(&mut sched, holder, m, 0, 0).unwrap();

        mutexes.lock(&mut sched, waiter, m, 0, 0).unwrap();

        assert_eq!(sched.thread(holder).unwrap().priority(), 20);
        assert_eq!(sched.thread(holder).unwrap().base_priority(), 5);
    }

    #[test]
    fn inheritance_restores_base_after_hand_off() {
        let (mut sched, mut mutexes, task) = setup();
        let holder = spawn(&mut sched, task, 5);
        let waiter = spawn(&mut sched, task, 20);
        let m = mutexes.create(&mut sched, task).unwrap();
        mutexes.lock(&mut sched, holder, m, 0, 0).unwrap();
        mutexes.lock(&mut sched, waiter, m, 0, 0).unwrap();

        mutexes.unlock(&mut sched, holder, m).unwrap();

        assert_eq!(sched.thread(holder).unwrap().priority(), 5);
        assert_eq!(sched.thread(waiter).unwrap().priority(), 20);
    }

    #[test]
    fn inheritance_drops_when_the_waiter_times_out() {
        let (mut sched, mut mutexes, task) = setup();
        let holder = spawn(&mut sched, task, 5);
        let waiter = spawn(&mut sched, task, 20);
        let m = mutexes.create(&mut sched, task).unwrap();
        mutexes.lock(&mut sched, holder, m, 0, 0).unwrap();
        mutexes.lock(&mut sched, waiter, m, 100, 0).unwrap();
        assert_eq!(sched.thread(holder).unwrap().priority(), 20);

        for (thread, _event) in sched.tick(100) {
            mutexes.on_abnormal_wake(&mut sched, thread, m);
        }

        assert_eq!(sched.thread(holder).unwrap().priority(), 5);
        assert_eq!(
            sched.thread(waiter).unwrap().wait_result(),
            WaitResult::TimedOut
        );
        assert_eq!(sched.thread(waiter).unwrap().pending_mutex, None);
    }

    #[test]
    fn inheritance_propagates_through_a_chain() {
        let (mut sched, mut mutexes, task) = setup();
        let a = spawn(&mut sched, task, 5);
        let b = spawn(&mut sched, task, 10);
        let c = spawn(&mut sched, task, 30);
        let m1 = mutexes.create(&mut sched, task).unwrap();
        let m2 = mutexes.create(&mut sched, task).unwrap();

        // a holds m1, b holds m2 and blocks on m1, c blocks on m2.
        mutexes.lock(&mut sched, a, m1, 0, 0).unwrap();
        mutexes.lock(&mut sched, b, m2, 0, 0).unwrap();
        mutexes.lock(&mut sched, b, m1, 0, 0).unwrap();
        assert_eq!(sched.thread(a).unwrap().priority(), 10);

        mutexes.lock(&mut sched, c, m2, 0, 0).unwrap();

        assert_eq!(sched.thread(b).unwrap().priority(), 30);
        assert_eq!(sched.thread(a).unwrap().priority(), 30);
    }

    #[test]
    fn holder_priority_dominates_every_waiter() {
        let (mut sched, mut mutexes, task) = setup();
        let holder = spawn(&mut sched, task, 1);
        let m = mutexes.create(&mut sched, task).unwrap();
        mutexes.lock(&mut sched, holder, m, 0, 0).unwrap();

        let priorities = [12, 4, 25, 19, 7];
        for &priority in &priorities {
            let waiter = spawn(&mut sched, task, priority);
            mutexes.lock(&mut sched, waiter, m, 0, 0).unwrap();
            let event = mutexes.get(m).unwrap().event;
            let holder_priority = sched.thread(holder).unwrap().priority();
            assert!(holder_priority >= sched.max_waiter_priority(event).unwrap());
        }
    }

    #[test]
    fn release_for_wait_rejects_a_recursive_hold() {
        let (mut sched, mut mutexes, task) = setup();
        let t = spawn(&mut sched, task, 10);
        let m = mutexes.create(&mut sched, task).unwrap();
        mutexes.lock(&mut sched, t, m, 0, 0).unwrap();
        mutexes.lock(&mut sched, t, m, 0, 0).unwrap();

        assert_eq!(
            mutexes.release_for_wait(&mut sched, t, m),
            Err(SysError::DeadlockAvoided)
        );
        assert_eq!(mutexes.count(m), Ok(2));
        assert_eq!(mutexes.holder(m), Ok(Some(t)));
    }

    #[test]
    fn release_for_wait_releases_a_single_hold() {
        let (mut sched, mut mutexes, task) = setup();
        let t = spawn(&mut sched, task, 10);
        let m = mutexes.create(&mut sched, task).unwrap();
        mutexes.lock(&mut sched, t, m, 0, 0).unwrap();

        assert_eq!(mutexes.release_for_wait(&mut sched, t, m), Ok(1));
        assert_eq!(mutexes.holder(m), Ok(None));
    }

    #[test]
    fn destroy_fails_while_held() {
        let (mut sched, mut mutexes, task) = setup();
        let t = spawn(&mut sched, task, 10);
        let m = mutexes.create(&mut sched, task).unwrap();
        mutexes.lock(&mut sched, t, m, 0, 0).unwrap();

        assert_eq!(mutexes.destroy(&mut sched, t, m), Err(SysError::Busy));
    }

    #[test]
    fn destroy_requires_the_owning_task() {
        let (mut sched, mut mutexes, task) = setup();
        let other = sched.create_task("other", CapSet::empty()).unwrap();
        let stranger = spawn(&mut sched, other, 10);
        let m = mutexes.create(&mut sched, task).unwrap();

        assert_eq!(
            mutexes.destroy(&mut sched, stranger, m),
            Err(SysError::NotOwner)
        );
    }

    #[test]
    fn destroy_of_an_idle_mutex_succeeds() {
        let (mut sched, mut mutexes, task) = setup();
        let t = spawn(&mut sched, task, 10);
        let m = mutexes.create(&mut sched, task).unwrap();

        assert_eq!(mutexes.destroy(&mut sched, t, m), Ok(()));
        assert_eq!(mutexes.holder(m), Err(SysError::InvalidHandle));
    }

    #[test]
    fn force_release_wakes_waiters_broken() {
        let (mut sched, mut mutexes, task) = setup();
        let holder = spawn(&mut sched, task, 10);
        let waiter = spawn(&mut sched, task, 10);
        let m = mutexes.create(&mut sched, task).unwrap();
        mutexes.lock(&mut sched, holder, m, 0, 0).unwrap();
        mutexes.lock(&mut sched, waiter, m, 0, 0).unwrap();

        let woken = mutexes.force_release_held(&mut sched, holder);

        assert_eq!(woken, vec![waiter]);
        assert_eq!(mutexes.holder(m), Ok(None));
        assert_eq!(
            sched.thread(waiter).unwrap().wait_result(),
            WaitResult::Broken
        );
        assert!(sched.thread(holder).unwrap().held_mutexes.is_empty());
    }
}
