/// Configuration for network execution
///
/// This module provides configuration types for controlling how a network
/// wires sockets and detects termination.
use serde::{Deserialize, Serialize};

/// Default debounce window before a network with zero load reports `end`
pub const DEFAULT_DEBOUNCE_MS: u64 = 50;

/// Configuration for a network instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// How long aggregate load must stay at zero before `end` is emitted
    pub debounce_ms: u64,
    /// Capture component failures on sockets and wrap them with the node id
    /// and edge metadata. When disabled errors propagate unwrapped.
    pub debug: bool,
    /// Opaque base directory handed to component loaders
    pub base_dir: Option<String>,
}

impl NetworkConfig {
    /// Create a new network configuration with default values
    pub fn new() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            debug: true,
            base_dir: None,
        }
    }

    /// Set the termination debounce window
    pub fn with_debounce_ms(mut self, ms: u64) -> Self {
        self.debounce_ms = ms;
        self
    }

    /// Enable or disable socket error wrapping
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Set the base directory forwarded to loaders
    pub fn with_base_dir(mut self, base_dir: impl Into<String>) -> Self {
        self.base_dir = Some(base_dir.into());
        self
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self::new()
    }
}
