//! phantom-fw - stateful nftables and policy-routing reconciliation engine
//!
//! Keeps a durable, declarative description of firewall and routing policy in
//! SQLite, organized into prioritized rule groups, and reconciles the kernel
//! with it: enabling a group installs all of its rules or none of them, an
//! interrupted transaction is resolved on the next start, and drift between
//! the store and the kernel can be reported at any time.
//!
//! # Architecture
//!
//! - [`core`] - Engine, state store, compiler, kernel backends, presets, verifier
//! - [`ffi`] - C ABI over the engine (handle arena, JSON strings)
//! - [`logging`] - Bounded log queue feeding an embedder's callback
//! - [`audit`] - Audit trail of kernel-affecting operations
//! - [`config`] - Configuration persistence
//! - [`validators`] - Input validation and sanitization
//! - [`elevation`] - Privilege escalation for the host tools
//! - [`utils`] - Utility functions (XDG directories, etc.)
//!
//! # Example
//!
//! ```no_run
//! use phantom_fw::core::firewall::FirewallRuleSpec;
//! use phantom_fw::{Engine, config::EngineConfig};
//!
//! # fn main() -> phantom_fw::Result<()> {
//! let engine = Engine::system(EngineConfig::default())?;
//! engine.init("/var/lib/phantom-fw/phantom-fw.db")?;
//! engine.create_group("vpn1", "custom", 10)?;
//! engine.add_rule(
//!     "vpn1",
//!     FirewallRuleSpec::masquerade()
//!         .source("10.0.0.0/24".parse().unwrap())
//!         .out_iface("eth0"),
//! )?;
//! engine.enable_group("vpn1")?;
//! assert!(engine.verify_rules()?.in_sync);
//! # Ok(())
//! # }
//! ```

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod ffi;
pub mod logging;
pub mod utils;
pub mod validators;

shadow_rs::shadow!(build);

// Re-export commonly used types
pub use core::engine::{Engine, EngineStatus, StatusReport};
pub use core::error::{Error, ErrorCode, Result};

/// Package version with the short commit it was built from, if known
pub fn version_string() -> String {
    let commit = build::SHORT_COMMIT;
    if commit.is_empty() {
        build::PKG_VERSION.to_string()
    } else {
        format!("{} ({commit})", build::PKG_VERSION)
    }
}
