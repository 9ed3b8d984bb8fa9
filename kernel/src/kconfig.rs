use crate::cpu::Cpu;
use crate::memory::MemoryBlocks;

pub struct KConfig {
    pub cpu: &'static dyn Cpu,
    pub memory: MemoryBlocks,
}

unsafe impl Sync for KConfig {}
