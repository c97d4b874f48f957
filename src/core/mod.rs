//! Core reconciliation engine
//!
//! Leaf-first:
//!
//! - [`error`]: error taxonomy and ABI status codes
//! - [`firewall`]: rule, route and group model
//! - [`rule_constraints`]: business rules for valid field combinations
//! - [`kernel`]: kernel primitives, nft/ip codecs, host and in-memory backends
//! - [`store`]: durable `SQLite` state and the pending-transaction marker
//! - [`compiler`]: rows to ordered kernel operations
//! - [`applier`]: executes operations with rollback on partial failure
//! - [`groups`]: group, rule and route mutations as one unit
//! - [`presets`]: VPN, multihop, kill-switch, DNS and IPv6 presets
//! - [`verify`]: drift detection between store and kernel
//! - [`legacy`]: stateless single-rule entry point
//! - [`engine`]: lifecycle controller tying it all together

pub mod applier;
pub mod compiler;
pub mod engine;
pub mod error;
pub mod firewall;
pub mod groups;
pub mod kernel;
pub mod legacy;
pub mod presets;
pub mod rule_constraints;
pub mod store;
pub mod verify;

#[cfg(test)]
pub mod test_helpers;

#[cfg(test)]
mod tests;
