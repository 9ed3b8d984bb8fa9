use core::cell::Cell;

use crate::cpu::Cpu;

/// Reentrant critical section: the single mutual-exclusion domain for all
/// kernel metadata. Entering masks every interrupt level; only the
/// outermost leave restores the previous level and performs the
/// reschedule check.
pub struct CriticalSection {
    depth: Cell<u32>,
    saved_level: Cell<u8>,
    resched_pending: Cell<bool>,
}

// Safety: single-core kernel; the section itself is what serializes
// access, and entering it masks all interrupt levels.
unsafe impl Sync for CriticalSection {}

pub(crate) static CRITICAL: CriticalSection = CriticalSection::new();

impl CriticalSection {
    pub const fn new() -> Self {
        Self {
            depth: Cell::new(0),
            saved_level: Cell::new(0),
            resched_pending: Cell::new(false),
        }
    }

    pub fn enter<'a>(&'a self, cpu: &'a dyn Cpu) -> CriticalGuard<'a> {
        if self.depth.get() == 0 {
            self.saved_level.set(cpu.raise_to_max_level());
        }
        self.depth.set(self.depth.get() + 1);
        CriticalGuard { section: self, cpu }
    }

    pub fn depth(&self) -> u32 {
        self.depth.get()
    }

    pub fn mark_reschedule(&self) {
        self.resched_pending.set(true);
    }
}

pub struct CriticalGuard<'a> {
    section: &'a CriticalSection,
    cpu: &'a dyn Cpu,
}

impl Drop for CriticalGuard<'_> {
    fn drop(&mut self) {
        let depth = self.section.depth.get() - 1;
        self.section.depth.set(depth);
        if depth == 0 {
            self.cpu.restore_level(self.section.saved_level.get());
            if self.section.resched_pending.replace(false) {
                self.cpu.request_reschedule();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::testing::TestCpu;
    use core::sync::atomic::Ordering;

    #[test]
    fn enter_raises_and_leave_restores() {
        let cpu = TestCpu::new();
        let section = CriticalSection::new();

        {
            let _guard = section.enter(&cpu);
            assert_eq!(section.depth(), 1);
        }

        assert_eq!(section.depth(), 0);
        assert_eq!(cpu.raises.load(Ordering::Relaxed), 1);
        assert_eq!(cpu.restores.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn nested_entries_raise_only_once() {
        let cpu = TestCpu::new();
        let section = CriticalSection::new();

        {
            let _outer = section.enter(&cpu);
            {
                let _inner = section.enter(&cpu);
                assert_eq!(section.depth(), 2);
            }
            assert_eq!(section.depth(), 1);
            assert_eq!(cpu.restores.load(Ordering::Relaxed), 0);
        }

        assert_eq!(cpu.raises.load(Ordering::Relaxed), 1);
        assert_eq!(cpu.restores.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn reschedule_fires_only_on_outermost_leave() {
        let cpu = TestCpu::new();
        let section = CriticalSection::new();

        {
            let _outer = section.enter(&cpu);
            {
                let _inner = section.enter(&cpu);
                section.mark_reschedule();
            }
            // Inner leave must not trigger the reschedule.
            assert_eq!(cpu.reschedules.load(Ordering::Relaxed), 0);
        }

        assert_eq!(cpu.reschedules.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn no_reschedule_without_a_mark() {
        let cpu = TestCpu::new();
        let section = CriticalSection::new();

        {
            let _guard = section.enter(&cpu);
        }

        assert_eq!(cpu.reschedules.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn mark_is_consumed_by_the_leave() {
        let cpu = TestCpu::new();
        let section = CriticalSection::new();

        {
            let _guard = section.enter(&cpu);
            section.mark_reschedule();
        }
        {
            let _guard = section.enter(&cpu);
        }

        assert_eq!(cpu.reschedules.load(Ordering::Relaxed), 1);
    }
}
