//! Storage collaborators for the tapedeck sync engine.
//!
//! This module provides a trait-based interface to the remote multi-device
//! record store, an in-memory implementation of it, and local storage for
//! binary assets.
//!
//! # Design Principles
//! - Store isolation: no store-specific logic in the sync engine
//! - Async operations: all I/O operations are async
//! - Unified error semantics: every store reports through the common taxonomy

pub mod asset;
pub mod local;
pub mod memory;
pub mod provider;

pub use asset::{validate_asset_name, AssetStore};
pub use local::LocalAssetStore;
pub use memory::{MemoryRecordStore, Operation};
pub use provider::{AccountStatus, ChangePage, RecordPredicate, RecordQuery, RemoteStore};
