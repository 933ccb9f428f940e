//! Scoped interrupt masking
//!
//! State shared with the radio interrupt path is only touched while a
//! [`CriticalSection`] guard is alive. Dropping the guard re-enables
//! interrupts, including on early returns.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Platform hook that masks and unmasks the radio interrupt
pub trait IrqControl: Send + Sync {
    fn disable(&self);

    fn enable(&self);
}

/// For hosts where radio events already arrive as task messages
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopIrq;

impl IrqControl for NoopIrq {
    fn disable(&self) {}

    fn enable(&self) {}
}

/// Counts nesting depth; useful to assert that every section was closed
#[derive(Debug, Default)]
pub struct CountingIrq {
    depth: AtomicUsize,
    entered: AtomicUsize,
}

impl CountingIrq {
    pub fn new() -> Self {
        CountingIrq::default()
    }

    /// Sections currently open
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Sections opened since creation
    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }
}

impl IrqControl for CountingIrq {
    fn disable(&self) {
        self.depth.fetch_add(1, Ordering::SeqCst);
        self.entered.fetch_add(1, Ordering::SeqCst);
    }

    fn enable(&self) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
    }
}

#[must_use = "interrupts are re-enabled as soon as the guard is dropped"]
pub struct CriticalSection<'a> {
    irq: &'a dyn IrqControl,
}

impl<'a> CriticalSection<'a> {
    pub fn enter(irq: &'a dyn IrqControl) -> Self {
        irq.disable();
        CriticalSection { irq }
    }
}

impl Drop for CriticalSection<'_> {
    fn drop(&mut self) {
        self.irq.enable();
    }
}
