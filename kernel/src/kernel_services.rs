use core::cell::RefCell;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::kconfig::KConfig;
use crate::kernel::Kernel;
use crate::kprintln;
use crate::memory::MEMORY_MANAGER;

lazy_static! {
    pub(crate) static ref KERNEL: Mutex<RefCell<Option<Kernel>>> = Mutex::new(RefCell::new(None));
}

/// Bring the kernel up from nothing: heap first, then the Cpu, then the
/// tables. Nothing here persists across boots.
pub fn bootstrap(config: &'static KConfig) {
    MEMORY_MANAGER.bootstrap(&config.memory);
    MEMORY_MANAGER.set_cpu(config.cpu);
    config.cpu.setup();
    let kernel = Kernel::new(config.cpu);
    *KERNEL.lock().borrow_mut() = Some(kernel);
    kprintln!("[kernel] bootstrapped");
}

pub fn with_kernel<R>(f: impl FnOnce(&mut Kernel) -> R) -> R {
    let guard = KERNEL.lock();
    let mut cell = guard.borrow_mut();
    f(cell.as_mut().expect("kernel not bootstrapped"))
}
