//! Resource-specific initializers
//!
//! Each type parses its own configuration map during validation and keeps the
//! typed settings for the later phases.

pub mod cache;
pub mod database;
pub mod external_api;
pub mod filesystem;
pub mod network;
pub mod queue;

pub use cache::CacheInitializer;
pub use database::{DatabaseInitializer, Session, Transaction};
pub use external_api::{ApiResponse, ExternalApiInitializer};
pub use filesystem::{FileSystemInitializer, PermissionCheck};
pub use network::NetworkInitializer;
pub use queue::QueueInitializer;

use crate::error::InitError;
use crate::initializer::Lifecycle;

/// Borrow validated settings, or fail with `NotValidated`
pub(crate) fn validated<'a, S>(
    lifecycle: &Lifecycle,
    settings: &'a Option<S>,
) -> Result<&'a S, InitError> {
    lifecycle.ensure_validated()?;
    settings
        .as_ref()
        .ok_or_else(|| InitError::NotValidated(lifecycle.name().to_string()))
}
