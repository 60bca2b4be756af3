//! berth-store — persistence for the Berth scheduler.
//!
//! Everything durable lives behind the [`Persister`] contract: a flat
//! namespace of byte blobs keyed by `/`-separated paths, with recursive
//! delete. [`RedbPersister`] is the bundled backing store (on-disk or
//! in-memory). On top sit three typed stores:
//!
//! - [`FrameworkStore`] — the framework identity assigned by the master
//! - [`StateStore`] — task infos, statuses, goal overrides, properties,
//!   and the uninstall marker
//! - [`ConfigStore`] — versioned service specs and the target pointer
//!
//! There are no multi-key transactions; layers above order their writes so
//! a crash leaves at most one record inconsistent.

pub mod config;
pub mod error;
pub mod framework;
pub mod paths;
pub mod persister;
pub mod state;

pub use config::ConfigStore;
pub use error::{StoreError, StoreResult};
pub use framework::FrameworkStore;
pub use persister::{Persister, RedbPersister};
pub use state::StateStore;
