use alloc::vec::Vec;
use system::caps::CapSet;
use system::error::SysError;

use crate::sched::Scheduler;
use crate::task::TaskHandle;
use crate::thread::{Continuation, EXCEPTION_KINDS, ThreadHandle, ThreadState, UserContext};
use crate::wait::{EventHandle, WaitResult};

#[derive(Debug, PartialEq, Eq)]
pub enum PostOutcome {
    /// The bit is pending; delivery happens on the next return to user
    /// mode.
    Pending,
    /// No handler is installed: the fault is fatal to the task.
    TaskUnhandled,
}

pub fn install(sched: &mut Scheduler, caller: ThreadHandle, entry: usize) -> Result<(), SysError> {
    let task = sched.thread(caller)?.task;
    // Installing over an existing handler simply replaces it.
    sched.task_mut(task)?.exception_handler = Some(entry);
    Ok(())
}

/// Remove the handler, discard every pending bit in the task, and release
/// threads parked awaiting an exception.
pub fn uninstall(sched: &mut Scheduler, caller: ThreadHandle) -> Result<Vec<ThreadHandle>, SysError> {
    let task = sched.thread(caller)?.task;
    sched.task_mut(task)?.exception_handler = None;
    let threads = sched.task(task)?.threads.clone();

    let mut released = Vec::new();
    for thread in threads {
        let was_awaiting = match sched.thread_mut(thread) {
            Ok(t) => {
                t.pending_exceptions = 0;
                core::mem::replace(&mut t.awaiting_exception, false)
            }
            Err(_) => continue,
        };
        if was_awaiting && sched.force_unblock(thread, WaitResult::Broken).is_some() {
            released.push(thread);
        }
    }
    Ok(released)
}

/// Park the calling thread until an exception is raised against its task.
pub fn wait(
    sched: &mut Scheduler,
    caller: ThreadHandle,
    timeout: u64,
    now: u64,
) -> Result<(), SysError> {
    let task = sched.thread(caller)?.task;
    let event = sched.task(task)?.exception_event;
    sched.thread_mut(caller)?.awaiting_exception = true;
    sched.block(caller, event, timeout, now);
    Ok(())
}

/// Raise `kind` against a task. Requires same-task identity or the kill
/// capability. Prefers a thread parked awaiting an exception; otherwise
/// the first live thread in the task is the deterministic fallback. The
/// chosen thread's bit is set and it is force-unblocked with
/// `Interrupted`; the event it was evicted from (if any) is reported so
/// the caller can restore that primitive's bookkeeping.
pub fn raise(
    sched: &mut Scheduler,
    caller: ThreadHandle,
    target_task: TaskHandle,
    kind: u8,
) -> Result<(ThreadHandle, Option<EventHandle>), SysError> {
    if kind >= EXCEPTION_KINDS {
        return Err(SysError::InvalidArgument);
    }
    let caller_task = sched.thread(caller)?.task;
    sched.task(target_task)?;
    if caller_task != target_task && !sched.task(caller_task)?.has_cap(CapSet::KILL) {
        return Err(SysError::PermissionDenied);
    }

    let threads = sched.task(target_task)?.threads.clone();
    let parked = threads
        .iter()
        .copied()
        .find(|&t| sched.thread(t).map(|t| t.awaiting_exception).unwrap_or(false));
    let chosen = match parked {
        Some(thread) => thread,
        None => threads
            .iter()
            .copied()
            .find(|&t| {
                sched
                    .thread(t)
                    .map(|t| t.state() != ThreadState::Exit)
                    .unwrap_or(false)
            })
            .ok_or(SysError::NotFound)?,
    };

    {
        let t = sched.thread_mut(chosen)?;
        t.pending_exceptions |= 1 << kind;
        t.awaiting_exception = false;
    }
    let evicted = sched.force_unblock(chosen, WaitResult::Interrupted);
    Ok((chosen, evicted))
}

/// Record a synchronous fault against the faulting thread itself.
pub fn post(sched: &mut Scheduler, thread: ThreadHandle, kind: u8) -> Result<PostOutcome, SysError> {
    if kind >= EXCEPTION_KINDS {
        return Err(SysError::InvalidArgument);
    }
    let task = sched.thread(thread)?.task;
    if sched.task(task)?.exception_handler.is_none() {
        return Ok(PostOutcome::TaskUnhandled);
    }
    sched.thread_mut(thread)?.pending_exceptions |= 1 << kind;
    Ok(PostOutcome::Pending)
}

/// Invoked on each return to user mode. Picks the lowest pending kind,
/// pushes the current continuation, and rewrites the context so control
/// resumes in the handler with the kind as its argument. Delivery does
/// not nest: a thread already in its handler finishes first.
pub fn deliver(sched: &mut Scheduler, thread: ThreadHandle) -> Option<u8> {
    let task = sched.thread(thread).ok()?.task;
    let handler = sched.task(task).ok()?.exception_handler?;

    let t = sched.thread_mut(thread).ok()?;
    if t.pending_exceptions == 0 {
        return None;
    }
    if !matches!(t.continuation, Continuation::Normal) {
        return None;
    }
    let kind = t.pending_exceptions.trailing_zeros() as u8;
    t.pending_exceptions &= !(1u32 << kind);
    let saved = t.context;
    t.continuation = Continuation::InHandler { saved };
    t.context = UserContext {
        pc: handler,
        sp: saved.sp,
        arg: kind as usize,
    };
    Some(kind)
}

/// Explicit return from the handler: pop the saved continuation.
pub fn return_from_handler(sched: &mut Scheduler, thread: ThreadHandle) -> Result<(), SysError> {
    let t = sched.thread_mut(thread)?;
    match t.continuation {
        Continuation::InHandler { saved } => {
            t.context = saved;
            t.continuation = Continuation::Normal;
            Ok(())
        }
        Continuation::Normal => Err(SysError::InvalidArgument),
    }
}
