#[repr(u64)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SyscallNum {
    Yield = 0,
    ThreadSuspend = 1,
    ThreadResume = 2,
    ThreadSetPriority = 3,
    SemCreate = 4,
    SemWait = 5,
    SemTryWait = 6,
    SemPost = 7,
    SemDestroy = 8,
    MutexCreate = 9,
    MutexLock = 10,
    MutexTryLock = 11,
    MutexUnlock = 12,
    MutexDestroy = 13,
    CondCreate = 14,
    CondWait = 15,
    CondSignal = 16,
    CondBroadcast = 17,
    CondDestroy = 18,
    ObjectCreate = 19,
    ObjectLookup = 20,
    ObjectDestroy = 21,
    ObjectSend = 22,
    ObjectReceive = 23,
    ObjectReply = 24,
    ExcInstall = 25,
    ExcUninstall = 26,
    ExcRaise = 27,
    ExcWait = 28,
    ExcReturn = 29,
    IrqAttach = 30,
    IrqDetach = 31,
}

impl TryFrom<usize> for SyscallNum {
    type Error = ();

    fn try_from(value: usize) -> Result<Self, ()> {
        match value {
            0 => Ok(Self::Yield),
            1 => Ok(Self::ThreadSuspend),
            2 => Ok(Self::ThreadResume),
            3 => Ok(Self::ThreadSetPriority),
            4 => Ok(Self::SemCreate),
            5 => Ok(Self::SemWait),
            6 => Ok(Self::SemTryWait),
            7 => Ok(Self::SemPost),
            8 => Ok(Self::SemDestroy),
            9 => Ok(Self::MutexCreate),
            10 => Ok(Self::MutexLock),
            11 => Ok(Self::MutexTryLock),
            12 => Ok(Self::MutexUnlock),
            13 => Ok(Self::MutexDestroy),
            14 => Ok(Self::CondCreate),
            15 => Ok(Self::CondWait),
            16 => Ok(Self::CondSignal),
            17 => Ok(Self::CondBroadcast),
            18 => Ok(Self::CondDestroy),
            19 => Ok(Self::ObjectCreate),
            20 => Ok(Self::ObjectLookup),
            21 => Ok(Self::ObjectDestroy),
            22 => Ok(Self::ObjectSend),
            23 => Ok(Self::ObjectReceive),
            24 => Ok(Self::ObjectReply),
            25 => Ok(Self::ExcInstall),
            26 => Ok(Self::ExcUninstall),
            27 => Ok(Self::ExcRaise),
            28 => Ok(Self::ExcWait),
            29 => Ok(Self::ExcReturn),
            30 => Ok(Self::IrqAttach),
            31 => Ok(Self::IrqDetach),
            _ => Err(()),
        }
    }
}
