use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;
use collections::generational_arena::GenArena;
use system::caps::CapSet;
use system::error::SysError;
use system::message::Message;

use crate::sched::Scheduler;
use crate::task::{MAX_OBJECTS_PER_TASK, ObjectHandle, TaskHandle};
use crate::thread::ThreadHandle;
use crate::wait::{EventHandle, EventOwner, WaitResult};

pub const MAX_OBJECTS: usize = 128;

/// Names under this prefix are reserved for system services and require
/// the protected-name capability to create.
pub const PROTECTED_PREFIX: &str = "sys/";

/// Names the exact sender thread of one exchange. Thread handles are
/// generational, so a token outlives neither the exchange nor the
/// thread: replies cannot be redirected by address reuse.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ReplyToken(pub ThreadHandle);

pub(crate) struct Object {
    pub(crate) name: Option<String>,
    pub(crate) owner: TaskHandle,
    pub(crate) event: EventHandle,
    pub(crate) senders: VecDeque<(ThreadHandle, Message)>,
    pub(crate) receivers: VecDeque<ThreadHandle>,
    pub(crate) awaiting_reply: Vec<ThreadHandle>,
    // Parked results, consumed by the resumed thread's syscall path.
    pub(crate) deliveries: Vec<(ThreadHandle, ReplyToken, Message)>,
    pub(crate) replies: Vec<(ThreadHandle, Message)>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RecvOutcome {
    Delivered(ReplyToken, Message),
    Blocked,
}

/// The object namespace: optionally named endpoints for synchronous
/// send/receive/reply exchanges, matched FIFO.
pub struct ObjectTable {
    objects: GenArena<Object>,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self {
            objects: GenArena::with_capacity(MAX_OBJECTS),
        }
    }

    fn get(&self, handle: ObjectHandle) -> Result<&Object, SysError> {
        self.objects.get(handle).map_err(|_| SysError::InvalidHandle)
    }

    fn get_mut(&mut self, handle: ObjectHandle) -> Result<&mut Object, SysError> {
        self.objects
            .get_mut(handle)
            .map_err(|_| SysError::InvalidHandle)
    }

    pub fn create(
        &mut self,
        sched: &mut Scheduler,
        caller: ThreadHandle,
        name: Option<&str>,
    ) -> Result<ObjectHandle, SysError> {
        let owner = sched.thread(caller)?.task;
        if let Some(name) = name {
            if name.is_empty() {
                return Err(SysError::InvalidArgument);
            }
            if name.starts_with(PROTECTED_PREFIX)
                && !sched.task(owner)?.has_cap(CapSet::PROTECTED_NAME)
            {
                return Err(SysError::PermissionDenied);
            }
            if self.lookup(name).is_ok() {
                return Err(SysError::AlreadyExists);
            }
        }
        if sched.task(owner)?.objects.len() >= MAX_OBJECTS_PER_TASK {
            return Err(SysError::QuotaExceeded);
        }

        let handle = self
            .objects
            .insert(Object {
                name: name.map(String::from),
                owner,
                event: EventHandle::new(0, 0),
                senders: VecDeque::new(),
                receivers: VecDeque::new(),
                awaiting_reply: Vec::new(),
                deliveries: Vec::new(),
                replies: Vec::new(),
            })
            .map_err(|_| SysError::NoSlots)?;
        let event = match sched.event_create("object", EventOwner::Object(handle)) {
            Ok(event) => event,
            Err(e) => {
                let _ = self.objects.remove(handle);
                return Err(e);
            }
        };
        self.objects.get_mut(handle).expect("just inserted").event = event;
        sched
            .task_mut(owner)
            .expect("owner checked above")
            .objects
            .push(handle);
        Ok(handle)
    }

    pub fn lookup(&self, name: &str) -> Result<ObjectHandle, SysError> {
        self.objects
            .iter()
            .find(|(_, object)| object.name.as_deref() == Some(name))
            .map(|(handle, _)| handle)
            .ok_or(SysError::NotFound)
    }

    /// Synchronous send: the caller parks until a receiver takes the
    /// message and replies. If a receiver is already waiting, it is woken
    /// with the message; the reported handle is that receiver.
    pub fn send(
        &mut self,
        sched: &mut Scheduler,
        caller: ThreadHandle,
        handle: ObjectHandle,
        message: Message,
        timeout: u64,
        now: u64,
    ) -> Result<Option<ThreadHandle>, SysError> {
        sched.thread(caller)?;
        let event = self.get(handle)?.event;
        let receiver = self.get_mut(handle)?.receivers.pop_front();
        let woken = match receiver {
            Some(receiver) => {
                let object = self.get_mut(handle)?;
                object
                    .deliveries
                    .push((receiver, ReplyToken(caller), message));
                object.awaiting_reply.push(caller);
                sched.force_unblock(receiver, WaitResult::Success);
                Some(receiver)
            }
            None => {
                self.get_mut(handle)?.senders.push_back((caller, message));
                None
            }
        };
        sched.block(caller, event, timeout, now);
        Ok(woken)
    }

    /// Synchronous receive: FIFO-matched against parked senders, or park
    /// the caller until a sender arrives.
    pub fn receive(
        &mut self,
        sched: &mut Scheduler,
        caller: ThreadHandle,
        handle: ObjectHandle,
        timeout: u64,
        now: u64,
    ) -> Result<RecvOutcome, SysError> {
        sched.thread(caller)?;
        let event = self.get(handle)?.event;
        let sender = self.get_mut(handle)?.senders.pop_front();
        match sender {
            Some((sender, message)) => {
                self.get_mut(handle)?.awaiting_reply.push(sender);
                Ok(RecvOutcome::Delivered(ReplyToken(sender), message))
            }
            None => {
                self.get_mut(handle)?.receivers.push_back(caller);
                sched.block(caller, event, timeout, now);
                Ok(RecvOutcome::Blocked)
            }
        }
    }

    /// Route a reply back to the exact sender thread of the original
    /// exchange. A stale or foreign token is rejected.
    pub fn reply(
        &mut self,
        sched: &mut Scheduler,
        handle: ObjectHandle,
        token: ReplyToken,
        message: Message,
    ) -> Result<ThreadHandle, SysError> {
        let object = self.get_mut(handle)?;
        let position = object
            .awaiting_reply
            .iter()
            .position(|t| *t == token.0)
            .ok_or(SysError::InvalidArgument)?;
        object.awaiting_reply.remove(position);
        object.replies.push((token.0, message));
        sched.force_unblock(token.0, WaitResult::Success);
        Ok(token.0)
    }

    /// Consumed by a resumed receiver's syscall path.
    pub fn take_delivery(
        &mut self,
        handle: ObjectHandle,
        thread: ThreadHandle,
    ) -> Option<(ReplyToken, Message)> {
        let object = self.objects.get_mut(handle).ok()?;
        let position = object.deliveries.iter().position(|(t, _, _)| *t == thread)?;
        let (_, token, message) = object.deliveries.remove(position);
        Some((token, message))
    }

    /// Consumed by a resumed sender's syscall path.
    pub fn take_reply(&mut self, handle: ObjectHandle, thread: ThreadHandle) -> Option<Message> {
        let object = self.objects.get_mut(handle).ok()?;
        let position = object.replies.iter().position(|(t, _)| *t == thread)?;
        Some(object.replies.remove(position).1)
    }

    /// A queued thread left through timeout or teardown; drop whichever
    /// parking role it held.
    pub fn on_abnormal_wake(&mut self, handle: ObjectHandle, thread: ThreadHandle) {
        if let Ok(object) = self.objects.get_mut(handle) {
            object.senders.retain(|(t, _)| *t != thread);
            object.receivers.retain(|t| *t != thread);
            object.awaiting_reply.retain(|t| *t != thread);
        }
    }

    pub fn destroy(
        &mut self,
        sched: &mut Scheduler,
        caller: ThreadHandle,
        handle: ObjectHandle,
    ) -> Result<Vec<ThreadHandle>, SysError> {
        let caller_task = sched.thread(caller)?.task;
        if self.get(handle)?.owner != caller_task {
            return Err(SysError::NotOwner);
        }
        Ok(self.force_destroy(sched, handle))
    }

    /// Unlink the object and unblock every parked sender, receiver, and
    /// replier exactly once.
    pub fn force_destroy(
        &mut self,
        sched: &mut Scheduler,
        handle: ObjectHandle,
    ) -> Vec<ThreadHandle> {
        let object = match self.objects.remove(handle) {
            Ok(object) => object,
            Err(_) => return Vec::new(),
        };

        let mut unblocked = Vec::new();
        for (sender, _) in object.senders {
            sched.force_unblock(sender, WaitResult::Invalidated);
            unblocked.push(sender);
        }
        for receiver in object.receivers {
            sched.force_unblock(receiver, WaitResult::Invalidated);
            unblocked.push(receiver);
        }
        for replier in object.awaiting_reply {
            sched.force_unblock(replier, WaitResult::Invalidated);
            unblocked.push(replier);
        }
        sched.event_destroy(object.event);

        if let Ok(task) = sched.task_mut(object.owner) {
            task.objects.retain(|o| *o != handle);
        }
        unblocked
    }
}

impl Default for ObjectTable {
    fn default() -> Self {
        Self::new()
    }
}
