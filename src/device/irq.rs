//! Level-triggered interrupt lines.
//!
//! A virtio device owns exactly one line. The line is mounted on an
//! [`InterruptController`] under an identifier the controller assigns;
//! until then raise/lower only update the line's own level.

use std::fmt;
use std::sync::{Arc, Mutex};

/// Number of lines tracked by [`LevelInterruptController`].
pub const MAX_IRQS: u32 = 256;

/// Sink for level changes of interrupt lines.
pub trait InterruptController: Send + Sync {
    /// Assert the line with the given identifier.
    fn raise(&self, id: u32);

    /// Deassert the line with the given identifier.
    fn lower(&self, id: u32);
}

/// A device's interrupt line.
#[derive(Default)]
pub struct Interrupt {
    /// Controller and line identifier, once mounted
    target: Option<(Arc<dyn InterruptController>, u32)>,
    /// Current level
    raised: bool,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach this line to a controller under `id`. The current level is
    /// forwarded immediately.
    pub fn mount(&mut self, controller: Arc<dyn InterruptController>, id: u32) {
        if self.raised {
            controller.raise(id);
        }
        self.target = Some((controller, id));
    }

    /// Detach from the controller, lowering the line there first.
    pub fn unmount(&mut self) {
        if let Some((controller, id)) = self.target.take() {
            if self.raised {
                controller.lower(id);
            }
        }
    }

    /// Controller-assigned identifier, if mounted.
    pub fn id(&self) -> Option<u32> {
        self.target.as_ref().map(|(_, id)| *id)
    }

    pub fn is_raised(&self) -> bool {
        self.raised
    }

    pub fn raise(&mut self) {
        if self.raised {
            return;
        }
        self.raised = true;
        if let Some((controller, id)) = &self.target {
            controller.raise(*id);
        }
    }

    pub fn lower(&mut self) {
        if !self.raised {
            return;
        }
        self.raised = false;
        if let Some((controller, id)) = &self.target {
            controller.lower(*id);
        }
    }

    /// Drive the line to `level`.
    pub fn set(&mut self, level: bool) {
        if level {
            self.raise();
        } else {
            self.lower();
        }
    }
}

impl fmt::Debug for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interrupt")
            .field("id", &self.id())
            .field("raised", &self.raised)
            .finish()
    }
}

/// Interrupt controller that tracks pending lines in a bitmap.
#[derive(Debug, Default)]
pub struct LevelInterruptController {
    /// Pending interrupt bitmap (256 lines)
    pending: Mutex<[u32; 8]>,
}

impl LevelInterruptController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an interrupt as pending.
    pub fn set_pending(&self, irq: u32) {
        if irq < MAX_IRQS {
            if let Ok(mut pending) = self.pending.lock() {
                pending[(irq / 32) as usize] |= 1 << (irq % 32);
            }
        }
    }

    /// Clear a pending interrupt.
    pub fn clear_pending(&self, irq: u32) {
        if irq < MAX_IRQS {
            if let Ok(mut pending) = self.pending.lock() {
                pending[(irq / 32) as usize] &= !(1 << (irq % 32));
            }
        }
    }

    /// Check if an interrupt is pending.
    pub fn is_pending(&self, irq: u32) -> bool {
        if irq >= MAX_IRQS {
            return false;
        }
        self.pending
            .lock()
            .map(|pending| pending[(irq / 32) as usize] & (1 << (irq % 32)) != 0)
            .unwrap_or(false)
    }

    /// Lowest-numbered pending line.
    pub fn highest_priority_pending(&self) -> Option<u32> {
        let pending = self.pending.lock().ok()?;
        pending
            .iter()
            .enumerate()
            .find(|(_, word)| **word != 0)
            .map(|(idx, word)| idx as u32 * 32 + word.trailing_zeros())
    }
}

impl InterruptController for LevelInterruptController {
    fn raise(&self, id: u32) {
        self.set_pending(id);
    }

    fn lower(&self, id: u32) {
        self.clear_pending(id);
    }
}
