//! Pluggable notification dispatch with Telegram account linking.
//!
//! [`platform`] holds the notifier backends and the destination router,
//! [`config`] the TOML configuration the daemon is driven by.

pub mod config;
pub mod platform;
