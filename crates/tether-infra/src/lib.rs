//! Infrastructure layer for Tether.
//!
//! Contains implementations of the ports defined in `tether-core`: SQLite
//! repositories, AES-256-GCM encryption of subscription secrets, the
//! generic HTTP and static-endpoint webhook providers, and configuration
//! loading.

pub mod config;
pub mod crypto;
pub mod filesystem;
pub mod provider;
pub mod sqlite;
