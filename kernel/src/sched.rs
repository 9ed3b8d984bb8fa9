use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use collections::generational_arena::GenArena;
use collections::priority_queue::PriorityQueue;
use system::caps::CapSet;
use system::error::SysError;

use crate::task::{Task, TaskHandle};
use crate::thread::{PRIORITY_LEVELS, Priority, Thread, ThreadHandle, ThreadState};
use crate::wait::{EventHandle, EventOwner, WaitEvent, WaitResult};

pub const MAX_TASKS: usize = 64;
pub const MAX_THREADS: usize = 256;
pub const MAX_EVENTS: usize = 512;

/// Thread/task/event state plus the ready queue and timeout wheel. Every
/// blocking primitive in the kernel goes through `block`, `wake_one`,
/// `wake_all` and `force_unblock`; this is the single place a thread
/// leaves or re-enters the ready set.
pub struct Scheduler {
    pub(crate) threads: GenArena<Thread>,
    pub(crate) tasks: GenArena<Task>,
    pub(crate) events: GenArena<WaitEvent>,
    run_queue: PriorityQueue<ThreadHandle>,
    timeouts: BTreeMap<u64, Vec<ThreadHandle>>,
    current: Option<ThreadHandle>,
    resched_needed: bool,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            threads: GenArena::with_capacity(MAX_THREADS),
            tasks: GenArena::with_capacity(MAX_TASKS),
            events: GenArena::with_capacity(MAX_EVENTS),
            run_queue: PriorityQueue::new(),
            timeouts: BTreeMap::new(),
            current: None,
            resched_needed: false,
        }
    }

    // ---- tasks and threads ----

    pub fn create_task(&mut self, name: &str, caps: CapSet) -> Result<TaskHandle, SysError> {
        let event = self
            .events
            .insert(WaitEvent::new("exceptions", EventOwner::Plain))
            .map_err(|_| SysError::NoSlots)?;
        let task = match self.tasks.insert(Task::new(name, caps, event)) {
            Ok(task) => task,
            Err(_) => {
                let _ = self.events.remove(event);
                return Err(SysError::NoSlots);
            }
        };
        self.events
            .get_mut(event)
            .expect("event just inserted")
            .owner = EventOwner::Exception(task);
        Ok(task)
    }

    pub fn create_thread(
        &mut self,
        task: TaskHandle,
        name: &str,
        priority: Priority,
    ) -> Result<ThreadHandle, SysError> {
        if priority >= PRIORITY_LEVELS {
            return Err(SysError::InvalidArgument);
        }
        self.task(task)?;
        let thread = self
            .threads
            .insert(Thread::new(name, task, priority))
            .map_err(|_| SysError::NoSlots)?;
        self.tasks
            .get_mut(task)
            .expect("task checked above")
            .threads
            .push(thread);
        self.run_queue.push(thread, priority);
        Ok(thread)
    }

    pub fn task(&self, handle: TaskHandle) -> Result<&Task, SysError> {
        self.tasks.get(handle).map_err(|_| SysError::InvalidHandle)
    }

    pub fn task_mut(&mut self, handle: TaskHandle) -> Result<&mut Task, SysError> {
        self.tasks
            .get_mut(handle)
            .map_err(|_| SysError::InvalidHandle)
    }

    pub fn thread(&self, handle: ThreadHandle) -> Result<&Thread, SysError> {
        self.threads
            .get(handle)
            .map_err(|_| SysError::InvalidHandle)
    }

    pub fn thread_mut(&mut self, handle: ThreadHandle) -> Result<&mut Thread, SysError> {
        self.threads
            .get_mut(handle)
            .map_err(|_| SysError::InvalidHandle)
    }

    pub fn current(&self) -> Option<ThreadHandle> {
        self.current
    }

    pub fn set_current(&mut self, thread: ThreadHandle) {
        self.run_queue.remove(&thread);
        self.current = Some(thread);
    }

    /// Requeue the current thread (if still runnable) and take the next
    /// highest-priority thread off the ready queue.
    pub fn pick_next(&mut self) -> Option<ThreadHandle> {
        if let Some(previous) = self.current.take() {
            if let Ok(thread) = self.threads.get(previous) {
                if thread.is_runnable() {
                    self.run_queue.push(previous, thread.priority);
                }
            }
        }
        let next = self.run_queue.pop_highest();
        self.current = next;
        next
    }

    pub fn yield_now(&mut self) {
        self.resched_needed = true;
    }

    pub fn take_resched(&mut self) -> bool {
        core::mem::replace(&mut self.resched_needed, false)
    }

    // ---- wait events ----

    pub fn event_create(
        &mut self,
        name: &'static str,
        owner: EventOwner,
    ) -> Result<EventHandle, SysError> {
        self.events
            .insert(WaitEvent::new(name, owner))
            .map_err(|_| SysError::NoSlots)
    }

    pub fn event_owner(&self, event: EventHandle) -> Option<EventOwner> {
        self.events.get(event).map(|ev| ev.owner).ok()
    }

    pub fn waiter_count(&self, event: EventHandle) -> usize {
        self.events.get(event).map(|ev| ev.queue.len()).unwrap_or(0)
    }

    pub fn max_waiter_priority(&self, event: EventHandle) -> Option<Priority> {
        self.events
            .get(event)
            .ok()
            .and_then(|ev| ev.queue.highest_priority())
    }

    /// Destroying an event invalidates every remaining waiter.
    pub fn event_destroy(&mut self, event: EventHandle) -> Vec<ThreadHandle> {
        let waiters = match self.events.remove(event) {
            Ok(mut ev) => ev.queue.drain(),
            Err(_) => return Vec::new(),
        };
        for &thread in &waiters {
            self.finish_wake(thread, WaitResult::Invalidated);
        }
        waiters
    }

    // ---- the wait primitive ----

    /// Remove `thread` from the ready set and park it on `event`, ordered
    /// by priority. `timeout` of 0 means wait forever. Cannot fail; an
    /// invalid thread or event is ignored.
    pub fn block(&mut self, thread: ThreadHandle, event: EventHandle, timeout: u64, now: u64) {
        let priority = match self.threads.get(thread) {
            Ok(t) => t.priority,
            Err(_) => return,
        };
        if self.events.get(event).is_err() {
            return;
        }
        self.run_queue.remove(&thread);
        self.events
            .get_mut(event)
            .expect("event checked above")
            .queue
            .push(thread, priority);

        let t = self.threads.get_mut(thread).expect("thread checked above");
        t.state = ThreadState::Sleep;
        t.waiting_on = Some(event);
        if timeout > 0 {
            let deadline = now.saturating_add(timeout);
            t.timeout_at = Some(deadline);
            self.timeouts.entry(deadline).or_default().push(thread);
        }
    }

    /// Wake only the highest-priority waiter; reports which thread was
    /// chosen.
    pub fn wake_one(&mut self, event: EventHandle) -> Option<ThreadHandle> {
        let thread = match self.events.get_mut(event) {
            Ok(ev) => ev.queue.pop_highest(),
            Err(_) => None,
        }?;
        self.finish_wake(thread, WaitResult::Success);
        Some(thread)
    }

    /// Wake every waiter, highest priority first.
    pub fn wake_all(&mut self, event: EventHandle) -> Vec<ThreadHandle> {
        self.wake_all_with(event, WaitResult::Success)
    }

    pub fn wake_all_with(&mut self, event: EventHandle, result: WaitResult) -> Vec<ThreadHandle> {
        let waiters = match self.events.get_mut(event) {
            Ok(ev) => ev.queue.drain(),
            Err(_) => return Vec::new(),
        };
        for &thread in &waiters {
            self.finish_wake(thread, result);
        }
        waiters
    }

    /// Evict a specific thread from whatever it waits on, independent of
    /// the natural wake condition. Reports the event it was blocked on,
    /// or `None` if it was not blocked.
    pub fn force_unblock(
        &mut self,
        thread: ThreadHandle,
        result: WaitResult,
    ) -> Option<EventHandle> {
        let event = match self.threads.get(thread) {
            Ok(t) => t.waiting_on?,
            Err(_) => return None,
        };
        if let Ok(ev) = self.events.get_mut(event) {
            ev.queue.remove(&thread);
        }
        self.finish_wake(thread, result);
        Some(event)
    }

    pub fn set_wait_result(&mut self, thread: ThreadHandle, result: WaitResult) {
        if let Ok(t) = self.threads.get_mut(thread) {
            t.wait_result = result;
        }
    }

    fn finish_wake(&mut self, thread: ThreadHandle, result: WaitResult) {
        let (deadline, priority, runnable) = {
            let t = match self.threads.get_mut(thread) {
                Ok(t) => t,
                Err(_) => return,
            };
            t.waiting_on = None;
            t.wait_result = result;
            t.state = if t.suspend_count > 0 {
                ThreadState::Suspend
            } else {
                ThreadState::Run
            };
            (t.timeout_at.take(), t.priority, t.is_runnable())
        };
        if let Some(deadline) = deadline {
            self.cancel_deadline(deadline, thread);
        }
        if runnable && self.current != Some(thread) {
            self.run_queue.push(thread, priority);
            let preempts = match self.current.and_then(|c| self.threads.get(c).ok()) {
                Some(current) => priority > current.priority,
                None => true,
            };
            if preempts {
                self.resched_needed = true;
            }
        }
    }

    fn cancel_deadline(&mut self, deadline: u64, thread: ThreadHandle) {
        if let Some(entries) = self.timeouts.get_mut(&deadline) {
            entries.retain(|t| *t != thread);
            if entries.is_empty() {
                self.timeouts.remove(&deadline);
            }
        }
    }

    /// Expire armed deadlines up to `now`. Each affected thread is
    /// force-unblocked with `TimedOut`; the (thread, event) pairs are
    /// reported so the owning primitive can restore its bookkeeping.
    pub fn tick(&mut self, now: u64) -> Vec<(ThreadHandle, EventHandle)> {
        let remaining = self.timeouts.split_off(&(now + 1));
        let expired = core::mem::replace(&mut self.timeouts, remaining);

        let mut woken = Vec::new();
        for (_, threads) in expired {
            for thread in threads {
                if let Some(event) = self.force_unblock(thread, WaitResult::TimedOut) {
                    woken.push((thread, event));
                }
            }
        }
        woken
    }

    // ---- suspension ----

    pub fn suspend(&mut self, thread: ThreadHandle) -> Result<(), SysError> {
        let was_current = self.current == Some(thread);
        let t = self.thread_mut(thread)?;
        t.suspend_count += 1;
        if t.state == ThreadState::Run {
            t.state = ThreadState::Suspend;
        }
        self.run_queue.remove(&thread);
        if was_current {
            self.resched_needed = true;
        }
        Ok(())
    }

    pub fn resume(&mut self, thread: ThreadHandle) -> Result<(), SysError> {
        let (priority, now_runnable) = {
            let t = self.thread_mut(thread)?;
            if t.suspend_count == 0 {
                return Err(SysError::InvalidArgument);
            }
            t.suspend_count -= 1;
            if t.suspend_count == 0 && t.state == ThreadState::Suspend {
                t.state = ThreadState::Run;
            }
            (t.priority, t.is_runnable())
        };
        if now_runnable && self.current != Some(thread) {
            self.run_queue.push(thread, priority);
            let preempts = match self.current.and_then(|c| self.threads.get(c).ok()) {
                Some(current) => priority > current.priority,
                None => true,
            };
            if preempts {
                self.resched_needed = true;
            }
        }
        Ok(())
    }

    // ---- priorities ----

    /// Apply an effective priority, repositioning the thread in whatever
    /// queue currently holds it.
    pub fn apply_priority(&mut self, thread: ThreadHandle, priority: Priority) {
        let waiting_on = {
            let t = match self.threads.get_mut(thread) {
                Ok(t) => t,
                Err(_) => return,
            };
            t.priority = priority;
            t.waiting_on
        };
        if let Some(event) = waiting_on {
            if let Ok(ev) = self.events.get_mut(event) {
                ev.queue.reposition(&thread, priority);
            }
        } else if self.run_queue.contains(&thread) {
            self.run_queue.reposition(&thread, priority);
        }
        if self.current == Some(thread) {
            if let Some(waiting) = self.run_queue.highest_priority() {
                if waiting > priority {
                    self.resched_needed = true;
                }
            }
        }
    }

    pub fn set_base_priority(
        &mut self,
        thread: ThreadHandle,
        priority: Priority,
    ) -> Result<(), SysError> {
        if priority >= PRIORITY_LEVELS {
            return Err(SysError::InvalidArgument);
        }
        self.thread_mut(thread)?.base_priority = priority;
        Ok(())
    }

    // ---- teardown ----

    /// Pull a thread out of every scheduler structure. The arena record
    /// survives until `reap_thread`.
    pub fn exit_thread(&mut self, thread: ThreadHandle) {
        let (waiting_on, deadline) = {
            let t = match self.threads.get_mut(thread) {
                Ok(t) => t,
                Err(_) => return,
            };
            let waiting_on = t.waiting_on.take();
            let deadline = t.timeout_at.take();
            t.state = ThreadState::Exit;
            (waiting_on, deadline)
        };
        if let Some(event) = waiting_on {
            if let Ok(ev) = self.events.get_mut(event) {
                ev.queue.remove(&thread);
            }
        }
        if let Some(deadline) = deadline {
            self.cancel_deadline(deadline, thread);
        }
        self.run_queue.remove(&thread);
        if self.current == Some(thread) {
            self.current = None;
            self.resched_needed = true;
        }
    }

    pub fn reap_thread(&mut self, thread: ThreadHandle) {
        if let Ok(record) = self.threads.remove(thread) {
            if let Ok(task) = self.tasks.get_mut(record.task) {
                task.threads.retain(|t| *t != thread);
            }
        }
    }

    pub fn remove_task(&mut self, task: TaskHandle) {
        let _ = self.tasks.remove(task);
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
