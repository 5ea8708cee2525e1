//! Kernel constants.
//!
//! Centralizes hardcoded values for easier configuration and documentation.

use std::time::Duration;

/// Grace period armed on the network connection at disconnect, so
/// in-flight finalize hooks can complete before a hard close.
pub const DEFAULT_DISCONNECT_GRACE: Duration = Duration::from_secs(120);

/// Mode for directories created through Mkdir.
pub const DEFAULT_DIR_MODE: u32 = 0o755;

/// The virtual root. Every user must carry permissions for it.
pub const ROOT_DIR: &str = "/";
