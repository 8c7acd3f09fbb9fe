//! Engine configuration
// (c) 2024 Ross Younger

use serde::{Deserialize, Serialize};

/// The set of configurable options supported by the SCP engine.
///
/// **Note:** `default()` returns the hard-wired defaults. Hosts
/// deserialize this from their own configuration tree and pass it to
/// [`crate::scp::handle`] per command.
// Maintainer note: no member of this struct should be Option<anything>;
// absent values resolve to the defaults at deserialization time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScpConfig {
    /// Write uploads to a temporary path and promote on close, when the
    /// backend supports it. Protects against torn files on crash.
    pub atomic_uploads: bool,
}

impl Default for ScpConfig {
    fn default() -> Self {
        Self {
            atomic_uploads: true,
        }
    }
}
