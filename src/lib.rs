//! Keyseat - a license key session authority.
//!
//! A client presents a license key; the authority checks the key against a
//! record store and, when the key is valid and below its concurrency cap,
//! opens a bounded-lifetime session. Sessions end when the client closes them
//! or when they time out without a keep-alive.
//!
//! # Features
//!
//! - `server` - HTTP surface and SQL record store. Enabled by default.
//! - `sqlite` - SQLite database backend. Enabled by default.
//! - `postgres` - PostgreSQL database backend.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use keyseat::authority::{AuthoritySettings, LicenseAuthority};
//! use keyseat::license::LicenseRecord;
//! use keyseat::store::MemoryStore;
//!
//! # async fn demo() {
//! let store = Arc::new(MemoryStore::new());
//! store.insert(LicenseRecord::new("ACME-TEAM", 2));
//!
//! let authority = LicenseAuthority::new(store, AuthoritySettings::default());
//! let outcome = authority.check_key("ACME-TEAM").await;
//! assert!(outcome.is_granted());
//! # }
//! ```

// Core modules (always available)
pub mod config;
pub mod errors;
pub mod license;
pub mod session;
pub mod store;

// Session authority
pub mod authority;
pub mod cache;
pub mod events;
pub mod jobs;
pub mod registry;

// Server-related modules (requires "server" feature)
#[cfg(feature = "server")]
#[path = "server/mod.rs"]
pub mod server;
