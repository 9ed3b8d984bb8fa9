use system::error::SysError;
use system::syscall_numbers::SyscallNum;
use system::{HANDLE_UNINIT, Handle};

use crate::critical::CRITICAL;
use crate::kernel::Kernel;
use crate::kernel_services;
use crate::object::{RecvOutcome, ReplyToken};
use crate::sync::condvar::CondvarHandle;
use crate::sync::semaphore::SemHandle;
use crate::thread::{MutexHandle, ThreadHandle};
use crate::usercopy::{self, UserCopy};

pub const NAME_MAX: usize = 64;

/// Trap entry used by the architecture layer: enters the critical
/// section, dispatches, and converts a pending reschedule into a context
/// switch request at the outermost leave.
pub fn trap(user: &dyn UserCopy, num: usize, a1: usize, a2: usize, a3: usize) -> isize {
    kernel_services::with_kernel(|kernel| {
        let _guard = CRITICAL.enter(kernel.cpu());
        let result = handle_syscall(kernel, user, num, a1, a2, a3);
        if kernel.sched.take_resched() {
            CRITICAL.mark_reschedule();
        }
        result
    })
}

pub fn handle_syscall(
    kernel: &mut Kernel,
    user: &dyn UserCopy,
    num: usize,
    a1: usize,
    a2: usize,
    a3: usize,
) -> isize {
    match dispatch(kernel, user, num, a1, a2, a3) {
        Ok(value) => value as isize,
        Err(e) => -(e.code() as isize),
    }
}

/// Final status of a blocking syscall, read when the thread is scheduled
/// back in.
pub fn blocked_result(kernel: &Kernel, thread: ThreadHandle) -> isize {
    match kernel.sched.thread(thread) {
        Ok(t) => match t.wait_result().to_error() {
            Ok(()) => 0,
            Err(e) => -(e.code() as isize),
        },
        Err(e) => -(e.code() as isize),
    }
}

/// Resumed receiver: copy out the parked delivery and return the reply
/// token, or the wait's failure.
pub fn complete_receive(
    kernel: &mut Kernel,
    user: &dyn UserCopy,
    caller: ThreadHandle,
    object: usize,
    msg_addr: usize,
) -> isize {
    let object = Handle::unpack(object as u32);
    match kernel.objects.take_delivery(object, caller) {
        Some((token, message)) => match usercopy::write_message(user, msg_addr, &message) {
            Ok(()) => token.0.pack() as isize,
            Err(e) => -(e.code() as isize),
        },
        None => blocked_result(kernel, caller),
    }
}

/// Resumed sender: copy out the parked reply, or the wait's failure.
pub fn complete_send(
    kernel: &mut Kernel,
    user: &dyn UserCopy,
    caller: ThreadHandle,
    object: usize,
    reply_addr: usize,
) -> isize {
    let object = Handle::unpack(object as u32);
    match kernel.objects.take_reply(object, caller) {
        Some(message) => match usercopy::write_message(user, reply_addr, &message) {
            Ok(()) => 0,
            Err(e) => -(e.code() as isize),
        },
        None => blocked_result(kernel, caller),
    }
}

fn read_handle(user: &dyn UserCopy, addr: usize) -> Result<Option<Handle>, SysError> {
    let packed = usercopy::read_u32(user, addr)?;
    if packed == HANDLE_UNINIT {
        Ok(None)
    } else {
        Ok(Some(Handle::unpack(packed)))
    }
}

/// Mutex/semaphore/condvar handles live in user memory so the sentinel
/// `HANDLE_UNINIT` can mean "create on first use".
fn resolve_sem(
    kernel: &mut Kernel,
    user: &dyn UserCopy,
    addr: usize,
    caller: ThreadHandle,
) -> Result<SemHandle, SysError> {
    match read_handle(user, addr)? {
        Some(handle) => Ok(handle),
        None => {
            let task = kernel.sched.thread(caller)?.task;
            let handle = kernel.semaphores.create(&mut kernel.sched, task, 0)?;
            usercopy::write_u32(user, addr, handle.pack())?;
            Ok(handle)
        }
    }
}

fn resolve_mutex(
    kernel: &mut Kernel,
    user: &dyn UserCopy,
    addr: usize,
    caller: ThreadHandle,
) -> Result<MutexHandle, SysError> {
    match read_handle(user, addr)? {
        Some(handle) => Ok(handle),
        None => {
            let task = kernel.sched.thread(caller)?.task;
            let handle = kernel.mutexes.create(&mut kernel.sched, task)?;
            usercopy::write_u32(user, addr, handle.pack())?;
            Ok(handle)
        }
    }
}

fn resolve_cond(
    kernel: &mut Kernel,
    user: &dyn UserCopy,
    addr: usize,
    caller: ThreadHandle,
) -> Result<CondvarHandle, SysError> {
    match read_handle(user, addr)? {
        Some(handle) => Ok(handle),
        None => {
            let task = kernel.sched.thread(caller)?.task;
            let handle = kernel.condvars.create(&mut kernel.sched, task)?;
            usercopy::write_u32(user, addr, handle.pack())?;
            Ok(handle)
        }
    }
}

fn read_name(user: &dyn UserCopy, addr: usize, len: usize) -> Result<[u8; NAME_MAX], SysError> {
    if len > NAME_MAX {
        return Err(SysError::InvalidArgument);
    }
    let mut bytes = [0u8; NAME_MAX];
    user.copy_in(addr, &mut bytes[..len])?;
    Ok(bytes)
}

/// A thread may manage threads in its own task; crossing tasks takes the
/// kill capability.
fn check_thread_target(
    kernel: &Kernel,
    caller: ThreadHandle,
    target: ThreadHandle,
) -> Result<(), SysError> {
    use system::caps::CapSet;

    let caller_task = kernel.sched.thread(caller)?.task;
    let target_task = kernel.sched.thread(target)?.task;
    if caller_task == target_task {
        return Ok(());
    }
    if kernel.sched.task(caller_task)?.has_cap(CapSet::KILL) {
        Ok(())
    } else {
        Err(SysError::PermissionDenied)
    }
}

fn dispatch(
    kernel: &mut Kernel,
    user: &dyn UserCopy,
    num: usize,
    a1: usize,
    a2: usize,
    a3: usize,
) -> Result<usize, SysError> {
    let num = SyscallNum::try_from(num).map_err(|_| SysError::InvalidArgument)?;
    let caller = kernel.sched.current().ok_or(SysError::InvalidArgument)?;
    let now = kernel.now();

    match num {
        SyscallNum::Yield => {
            kernel.sched.yield_now();
            Ok(0)
        }
        SyscallNum::ThreadSuspend => {
            let target = Handle::unpack(a1 as u32);
            check_thread_target(kernel, caller, target)?;
            kernel.sched.suspend(target)?;
            Ok(0)
        }
        SyscallNum::ThreadResume => {
            let target = Handle::unpack(a1 as u32);
            check_thread_target(kernel, caller, target)?;
            kernel.sched.resume(target)?;
            Ok(0)
        }
        SyscallNum::ThreadSetPriority => {
            let target = Handle::unpack(a1 as u32);
            check_thread_target(kernel, caller, target)?;
            kernel.set_thread_priority(target, a2 as u8)?;
            Ok(0)
        }

        SyscallNum::SemCreate => {
            let task = kernel.sched.thread(caller)?.task;
            let handle = kernel
                .semaphores
                .create(&mut kernel.sched, task, a1 as u32)?;
            Ok(handle.pack() as usize)
        }
        SyscallNum::SemWait => {
            let sem = resolve_sem(kernel, user, a1, caller)?;
            kernel
                .semaphores
                .wait(&mut kernel.sched, caller, sem, a2 as u64, now)?;
            Ok(0)
        }
        SyscallNum::SemTryWait => {
            let sem = resolve_sem(kernel, user, a1, caller)?;
            kernel.semaphores.try_wait(&mut kernel.sched, caller, sem)?;
            Ok(0)
        }
        SyscallNum::SemPost => {
            let sem = resolve_sem(kernel, user, a1, caller)?;
            kernel.semaphores.post(&mut kernel.sched, caller, sem)?;
            Ok(0)
        }
        SyscallNum::SemDestroy => {
            let sem = read_handle(user, a1)?.ok_or(SysError::InvalidHandle)?;
            kernel.semaphores.destroy(&mut kernel.sched, caller, sem)?;
            usercopy::write_u32(user, a1, HANDLE_UNINIT)?;
            Ok(0)
        }

        SyscallNum::MutexCreate => {
            let task = kernel.sched.thread(caller)?.task;
            let handle = kernel.mutexes.create(&mut kernel.sched, task)?;
            Ok(handle.pack() as usize)
        }
        SyscallNum::MutexLock => {
            let mutex = resolve_mutex(kernel, user, a1, caller)?;
            kernel
                .mutexes
                .lock(&mut kernel.sched, caller, mutex, a2 as u64, now)?;
            Ok(0)
        }
        SyscallNum::MutexTryLock => {
            let mutex = resolve_mutex(kernel, user, a1, caller)?;
            kernel.mutexes.try_lock(&mut kernel.sched, caller, mutex)?;
            Ok(0)
        }
        SyscallNum::MutexUnlock => {
            let mutex = resolve_mutex(kernel, user, a1, caller)?;
            kernel.mutex_unlock(caller, mutex)?;
            Ok(0)
        }
        SyscallNum::MutexDestroy => {
            let mutex = read_handle(user, a1)?.ok_or(SysError::InvalidHandle)?;
            kernel.mutexes.destroy(&mut kernel.sched, caller, mutex)?;
            usercopy::write_u32(user, a1, HANDLE_UNINIT)?;
            Ok(0)
        }

        SyscallNum::CondCreate => {
            let task = kernel.sched.thread(caller)?.task;
            let handle = kernel.condvars.create(&mut kernel.sched, task)?;
            Ok(handle.pack() as usize)
        }
        SyscallNum::CondWait => {
            let cv = resolve_cond(kernel, user, a1, caller)?;
            let mutex = read_handle(user, a2)?.ok_or(SysError::InvalidHandle)?;
            kernel.cond_wait(caller, cv, mutex, a3 as u64, now)?;
            Ok(0)
        }
        SyscallNum::CondSignal => {
            let cv = resolve_cond(kernel, user, a1, caller)?;
            kernel.cond_signal(caller, cv)?;
            Ok(0)
        }
        SyscallNum::CondBroadcast => {
            let cv = resolve_cond(kernel, user, a1, caller)?;
            kernel.cond_broadcast(caller, cv)?;
            Ok(0)
        }
        SyscallNum::CondDestroy => {
            let cv = read_handle(user, a1)?.ok_or(SysError::InvalidHandle)?;
            kernel.condvars.destroy(&mut kernel.sched, caller, cv)?;
            usercopy::write_u32(user, a1, HANDLE_UNINIT)?;
            Ok(0)
        }

        SyscallNum::ObjectCreate => {
            let handle = if a2 == 0 {
                kernel.objects.create(&mut kernel.sched, caller, None)?
            } else {
                let bytes = read_name(user, a1, a2)?;
                let name = core::str::from_utf8(&bytes[..a2])
                    .map_err(|_| SysError::InvalidArgument)?;
                kernel.objects.create(&mut kernel.sched, caller, Some(name))?
            };
            Ok(handle.pack() as usize)
        }
        SyscallNum::ObjectLookup => {
            let bytes = read_name(user, a1, a2)?;
            let name =
                core::str::from_utf8(&bytes[..a2]).map_err(|_| SysError::InvalidArgument)?;
            let handle = kernel.objects.lookup(name)?;
            Ok(handle.pack() as usize)
        }
        SyscallNum::ObjectDestroy => {
            let object = Handle::unpack(a1 as u32);
            kernel.objects.destroy(&mut kernel.sched, caller, object)?;
            Ok(0)
        }
        SyscallNum::ObjectSend => {
            let object = Handle::unpack(a1 as u32);
            let message = usercopy::read_message(user, a2)?;
            kernel.object_send(caller, object, message, a3 as u64, now)?;
            Ok(0)
        }
        SyscallNum::ObjectReceive => {
            let object = Handle::unpack(a1 as u32);
            match kernel.object_receive(caller, object, a3 as u64, now)? {
                RecvOutcome::Delivered(token, message) => {
                    usercopy::write_message(user, a2, &message)?;
                    Ok(token.0.pack() as usize)
                }
                RecvOutcome::Blocked => Ok(0),
            }
        }
        SyscallNum::ObjectReply => {
            let object = Handle::unpack(a1 as u32);
            let token = ReplyToken(Handle::unpack(a2 as u32));
            let message = usercopy::read_message(user, a3)?;
            kernel.object_reply(object, token, message)?;
            Ok(0)
        }

        SyscallNum::ExcInstall => {
            crate::exception::install(&mut kernel.sched, caller, a1)?;
            Ok(0)
        }
        SyscallNum::ExcUninstall => {
            crate::exception::uninstall(&mut kernel.sched, caller)?;
            Ok(0)
        }
        SyscallNum::ExcRaise => {
            let task = Handle::unpack(a1 as u32);
            kernel.raise_exception(caller, task, a2 as u8)?;
            Ok(0)
        }
        SyscallNum::ExcWait => {
            crate::exception::wait(&mut kernel.sched, caller, a1 as u64, now)?;
            Ok(0)
        }
        SyscallNum::ExcReturn => {
            crate::exception::return_from_handler(&mut kernel.sched, caller)?;
            Ok(0)
        }

        SyscallNum::IrqAttach => {
            let sem = Handle::unpack(a3 as u32);
            kernel.irq_attach_user(a1 as u8, a2 as u8, sem)?;
            Ok(0)
        }
        SyscallNum::IrqDetach => {
            kernel.irq_detach(a1 as u8)?;
            Ok(0)
        }
    }
}
