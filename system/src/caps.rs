use bitflags::bitflags;

bitflags! {
    /// Per-task capability bits checked by the kernel before cross-task
    /// operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CapSet: u32 {
        /// Access semaphores and condition variables owned by other tasks.
        const SEM_ACCESS = 1 << 0;
        /// Create objects under the protected name prefix.
        const PROTECTED_NAME = 1 << 1;
        /// Raise exceptions against other tasks.
        const KILL = 1 << 2;
    }
}
