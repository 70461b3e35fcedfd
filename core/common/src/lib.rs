//! Common utilities and types shared across the tapedeck sync modules.
//!
//! This module provides the error taxonomy every layer reports through, the
//! identifier newtypes, and the remote record model exchanged with the
//! record store.

pub mod error;
pub mod record;
pub mod types;

pub use error::{Error, Result};
pub use record::{AssetRef, FieldValue, RecordId, RemoteRecord};
pub use types::{ChangeToken, DeviceId, EntityId, ZoneId};
