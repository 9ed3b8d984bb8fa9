pub mod condvar;
pub mod mutex;
pub mod semaphore;

pub use condvar::CondvarTable;
pub use mutex::{LockOutcome, MutexTable};
pub use semaphore::{SemOutcome, SemaphoreTable};
