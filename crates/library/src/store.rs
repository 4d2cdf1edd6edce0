use common::{DetectedFile, MediaEntry};
use tracing::{info, warn};

use crate::catalog::BackingCatalog;
use crate::commands::{rebuild_sequence, Insert, Remove};
use crate::fingerprints::FingerprintStore;
use crate::queue::{CommandQueue, QueueEvent, QueueEvents, QueueStats};
use crate::{LibraryError, SCHEMA_VERSION};

/// Owns the fingerprint records and turns catalog mutations into queued
/// commands against the backing catalog.
pub struct MediaStore {
    fingerprints: FingerprintStore,
    queue: CommandQueue,
}

impl MediaStore {
    /// Opens the store and, if the persisted schema is missing or stale,
    /// queues a rebuild ahead of any other work.
    pub fn open(
        fingerprints: FingerprintStore,
        catalog: Box<dyn BackingCatalog>,
    ) -> Result<(Self, QueueEvents), LibraryError> {
        let (queue, events) = CommandQueue::new(catalog);
        let mut store = Self {
            fingerprints,
            queue,
        };
        match store.fingerprints.schema_version()? {
            Some(version) if version == SCHEMA_VERSION => {
                info!("Catalog schema {} is current", version);
            }
            Some(version) => {
                warn!(
                    "Catalog schema mismatch ({} != {}); rebuilding",
                    version, SCHEMA_VERSION
                );
                store.rebuild()?;
            }
            None => {
                warn!("Catalog schema missing; rebuilding");
                store.rebuild()?;
            }
        }
        Ok((store, events))
    }

    /// Invalidates all derived state: pending work, the catalog contents and
    /// every fingerprint.
    pub fn rebuild(&mut self) -> Result<(), LibraryError> {
        self.queue
            .prepare_for_rebuild(rebuild_sequence(self.fingerprints.clone(), SCHEMA_VERSION));
        self.fingerprints.clear()?;
        Ok(())
    }

    pub fn is_unchanged(&self, file: &DetectedFile) -> Result<bool, LibraryError> {
        let key = common::path_key(&file.path);
        Ok(self.fingerprints.get(&key)?.as_deref() == Some(file.fingerprint.as_str()))
    }

    pub fn insert(&mut self, entry: MediaEntry) -> Result<(), LibraryError> {
        self.fingerprints.put(&entry.path, &entry.fingerprint)?;
        self.queue
            .enqueue_top_level(Box::new(Insert::new(entry, self.fingerprints.clone())));
        Ok(())
    }

    pub fn remove(&mut self, path: &str) -> Result<(), LibraryError> {
        self.fingerprints.remove(path)?;
        self.queue.enqueue_top_level(Box::new(Remove::path(path)));
        Ok(())
    }

    /// Removes everything whose path starts with `prefix`.
    pub fn remove_subtree(&mut self, prefix: &str) -> Result<(), LibraryError> {
        let removed = self.fingerprints.remove_prefix(prefix)?;
        info!("Removing subtree {} ({} fingerprints)", prefix, removed);
        self.queue.enqueue_top_level(Box::new(Remove::subtree(prefix)));
        Ok(())
    }

    pub fn get_fingerprint(&self, path: &str) -> Result<Option<String>, LibraryError> {
        self.fingerprints.get(path)
    }

    pub fn handle(&mut self, event: QueueEvent) {
        self.queue.handle(event);
    }

    /// Handles whatever is already waiting on the channel.
    pub fn pump(&mut self, events: &mut QueueEvents) {
        while let Ok(event) = events.try_recv() {
            self.queue.handle(event);
        }
    }

    /// Drives the queue until nothing is current, pending or scheduled.
    pub async fn run_until_idle(&mut self, events: &mut QueueEvents) {
        while !self.queue.is_idle() {
            match events.recv().await {
                Some(event) => self.queue.handle(event),
                None => break,
            }
        }
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    #[cfg(test)]
    pub(crate) fn queue_mut(&mut self) -> &mut CommandQueue {
        &mut self.queue
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn fingerprints(&self) -> &FingerprintStore {
        &self.fingerprints
    }
}
