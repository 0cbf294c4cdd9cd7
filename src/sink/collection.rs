//! In-memory mirror of sinks grouped by source, fed by the router's watch.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::definition::{Sink, SinkKey, SourceKey};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkData {
    pub sink_key: SinkKey,
    pub sink_type: String,
    pub enabled: bool,
}

impl From<&Sink> for SinkData {
    fn from(sink: &Sink) -> Self {
        Self {
            sink_key: sink.key.clone(),
            sink_type: sink.sink_type.clone(),
            enabled: sink.switch.enabled(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceData {
    pub source_key: SourceKey,
    pub sinks: BTreeMap<SinkKey, SinkData>,
}

/// Sources that have at least one sink, with their sinks.
#[derive(Debug, Default)]
pub struct Collection {
    sources: RwLock<HashMap<SourceKey, SourceData>>,
}

impl Collection {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<SourceKey, SourceData>> {
        self.sources.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SourceKey, SourceData>> {
        self.sources.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn source(&self, key: &SourceKey) -> Option<SourceData> {
        self.read().get(key).cloned()
    }

    pub fn sink(&self, key: &SinkKey) -> Option<SinkData> {
        self.read()
            .get(&key.source_key)
            .and_then(|source| source.sinks.get(key))
            .cloned()
    }

    pub fn add_sink(&self, sink: SinkData) {
        let source_key = sink.sink_key.source_key.clone();
        self.write()
            .entry(source_key.clone())
            .or_insert_with(|| SourceData {
                source_key,
                sinks: BTreeMap::new(),
            })
            .sinks
            .insert(sink.sink_key.clone(), sink);
    }

    /// Removes the sink, and its source once it has no sinks left.
    pub fn delete_sink(&self, key: &SinkKey) {
        let mut sources = self.write();
        if let Some(source) = sources.get_mut(&key.source_key) {
            source.sinks.remove(key);
            if source.sinks.is_empty() {
                sources.remove(&key.source_key);
            }
        }
    }

    pub fn reset(&self) {
        self.write().clear();
    }

    pub fn sources_count(&self) -> usize {
        self.read().len()
    }
}
