#[repr(i32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SysError {
    InvalidArgument = 1,
    InvalidHandle = 2,
    PermissionDenied = 3,
    NotOwner = 4,
    NotFound = 5,
    AlreadyExists = 6,
    QuotaExceeded = 7,
    NoSlots = 8,
    Busy = 9,
    Overflow = 10,
    WouldBlock = 11,
    TimedOut = 12,
    Interrupted = 13,
    Invalidated = 14,
    Broken = 15,
    DeadlockAvoided = 16,
    BadAddress = 17,
}

impl SysError {
    pub const fn code(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for SysError {
    type Error = ();

    fn try_from(code: i32) -> Result<Self, ()> {
        match code {
            1 => Ok(Self::InvalidArgument),
            2 => Ok(Self::InvalidHandle),
            3 => Ok(Self::PermissionDenied),
            4 => Ok(Self::NotOwner),
            5 => Ok(Self::NotFound),
            6 => Ok(Self::AlreadyExists),
            7 => Ok(Self::QuotaExceeded),
            8 => Ok(Self::NoSlots),
            9 => Ok(Self::Busy),
            10 => Ok(Self::Overflow),
            11 => Ok(Self::WouldBlock),
            12 => Ok(Self::TimedOut),
            13 => Ok(Self::Interrupted),
            14 => Ok(Self::Invalidated),
            15 => Ok(Self::Broken),
            16 => Ok(Self::DeadlockAvoided),
            17 => Ok(Self::BadAddress),
            _ => Err(()),
        }
    }
}
