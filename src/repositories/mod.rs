//! # Repository Layer
//!
//! Versioned, soft-deletable storage of branch, source and sink definitions
//! on top of a [`KvStore`]. Every mutation is one atomic operation: reads
//! become commit conditions, and a concurrent write makes the whole
//! operation, quota checks included, run again.

pub mod branch;
pub mod error;
pub mod sink;
pub mod source;
pub mod store;

use std::sync::Arc;

pub use branch::BranchRepository;
pub use error::DefinitionError;
pub use sink::SinkRepository;
pub use source::SourceRepository;
pub use store::EntityStore;

use crate::config::DefinitionLimits;
use crate::kv::KvStore;

/// Entry point to all definition repositories sharing one store.
#[derive(Clone)]
pub struct DefinitionRepository {
    pub branches: BranchRepository,
    pub sources: SourceRepository,
    pub sinks: SinkRepository,
}

impl DefinitionRepository {
    /// Creates the repositories.
    ///
    /// # Arguments
    /// * `kv` - Backing store
    /// * `limits` - Count quotas
    /// * `max_attempts` - Bound of retries of one atomic operation
    pub fn new(kv: Arc<dyn KvStore>, limits: &DefinitionLimits, max_attempts: u32) -> Self {
        Self {
            branches: BranchRepository::new(Arc::clone(&kv), limits, max_attempts),
            sources: SourceRepository::new(Arc::clone(&kv), limits, max_attempts),
            sinks: SinkRepository::new(kv, limits, max_attempts),
        }
    }
}
