/// Hardware seam consumed by the concurrency core. Implemented per
/// architecture; the core never touches registers directly.
pub trait Cpu: Send + Sync {
    fn setup(&self);
    /// Mask every interrupt level and report the level that was active.
    fn raise_to_max_level(&self) -> u8;
    fn restore_level(&self, level: u8);
    /// Accept `vector` at `level` and above.
    fn unmask_vector(&self, vector: u8, level: u8);
    fn mask_vector(&self, vector: u8);
    /// Ask for a context switch once the critical section is left.
    fn request_reschedule(&self);
    fn system_time(&self) -> u64;
}
