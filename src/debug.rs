//! Debug logging categories.
//!
//! Register and descriptor traffic is far too chatty to log unconditionally,
//! so the per-access trace macros are gated on the `VIRTIO_EMU_DEBUG`
//! environment variable in addition to the `tracing` subscriber's filter:
//! - `VIRTIO_EMU_DEBUG=1` - Enable all trace output
//! - `VIRTIO_EMU_DEBUG=mmio` - Enable only register access traces
//! - `VIRTIO_EMU_DEBUG=queue` - Enable only virtqueue/descriptor traces
//! - `VIRTIO_EMU_DEBUG=mmio,queue` - Enable multiple categories
//!
//! Lifecycle transitions and protocol violations are always emitted through
//! `tracing` and do not depend on this gate.

use std::sync::OnceLock;

/// Debug categories that can be enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugCategory {
    Mmio,
    Queue,
    All,
}

/// Cached debug configuration
static DEBUG_CONFIG: OnceLock<DebugConfig> = OnceLock::new();

#[derive(Debug, Default)]
struct DebugConfig {
    enabled: bool,
    mmio: bool,
    queue: bool,
}

impl DebugConfig {
    fn parse(value: Option<&str>) -> Self {
        match value {
            Some(val) if val == "1" || val.eq_ignore_ascii_case("all") => Self {
                enabled: true,
                mmio: true,
                queue: true,
            },
            Some(val) => {
                let val_lower = val.to_lowercase();
                Self {
                    enabled: true,
                    mmio: val_lower.split(',').any(|c| c.trim() == "mmio"),
                    queue: val_lower.split(',').any(|c| c.trim() == "queue"),
                }
            }
            None => Self::default(),
        }
    }

    fn from_env() -> Self {
        Self::parse(std::env::var("VIRTIO_EMU_DEBUG").ok().as_deref())
    }

    fn allows(&self, category: DebugCategory) -> bool {
        if !self.enabled {
            return false;
        }
        match category {
            DebugCategory::All => self.mmio || self.queue,
            DebugCategory::Mmio => self.mmio,
            DebugCategory::Queue => self.queue,
        }
    }
}

fn get_config() -> &'static DebugConfig {
    DEBUG_CONFIG.get_or_init(DebugConfig::from_env)
}

/// Check if debug logging is enabled for a category
pub fn is_debug_enabled(category: DebugCategory) -> bool {
    get_config().allows(category)
}

/// Trace macro for MMIO register accesses
#[macro_export]
macro_rules! trace_mmio {
    ($($arg:tt)*) => {
        if $crate::debug::is_debug_enabled($crate::debug::DebugCategory::Mmio) {
            ::tracing::trace!(target: "virtio_mmio_emu::mmio", $($arg)*);
        }
    };
}

/// Trace macro for virtqueue and descriptor traffic
#[macro_export]
macro_rules! trace_queue {
    ($($arg:tt)*) => {
        if $crate::debug::is_debug_enabled($crate::debug::DebugCategory::Queue) {
            ::tracing::trace!(target: "virtio_mmio_emu::queue", $($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_disables_everything() {
        let config = DebugConfig::parse(None);
        assert!(!config.allows(DebugCategory::Mmio));
        assert!(!config.allows(DebugCategory::All));
    }

    #[test]
    fn test_all_enables_every_category() {
        for value in ["1", "all", "ALL"] {
            let config = DebugConfig::parse(Some(value));
            assert!(config.allows(DebugCategory::Mmio));
            assert!(config.allows(DebugCategory::Queue));
        }
    }

    #[test]
    fn test_category_list() {
        let config = DebugConfig::parse(Some("queue"));
        assert!(config.allows(DebugCategory::Queue));
        assert!(!config.allows(DebugCategory::Mmio));
        assert!(config.allows(DebugCategory::All));

        let config = DebugConfig::parse(Some("Mmio, queue"));
        assert!(config.allows(DebugCategory::Mmio));
        assert!(config.allows(DebugCategory::Queue));
    }
}
