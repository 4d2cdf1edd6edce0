use std::path::Path;

use common::{path_key, subtree_prefix, KindFilter};
use metadata::{Extractor, MetadataError};
use tracing::{debug, info, warn};

use crate::scanner::{scan, IgnoreSet};
use crate::store::MediaStore;
use crate::LibraryError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub scanned: u64,
    pub unchanged: u64,
    pub queued: u64,
    pub failed: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileOutcome {
    Unchanged,
    Queued,
    Skipped,
}

/// Ties scanning and extraction to the store.
pub struct Indexer {
    store: MediaStore,
    extractor: Box<dyn Extractor>,
    ignore: IgnoreSet,
}

impl Indexer {
    pub fn new(store: MediaStore, extractor: Box<dyn Extractor>, ignore: IgnoreSet) -> Self {
        Self {
            store,
            extractor,
            ignore,
        }
    }

    /// Scans `dir` and queues an insert for every new or changed file.
    /// Per-file extraction failures are logged and counted, never fatal.
    pub fn read_files(
        &mut self,
        dir: &Path,
        filter: KindFilter,
    ) -> Result<ScanSummary, LibraryError> {
        let mut summary = ScanSummary::default();
        for detected in scan(self.extractor.as_ref(), dir, filter, &self.ignore) {
            summary.scanned += 1;
            if self.store.is_unchanged(&detected)? {
                summary.unchanged += 1;
                continue;
            }
            match self.extractor.extract(&detected) {
                Ok(entry) => {
                    self.store.insert(entry)?;
                    summary.queued += 1;
                }
                Err(err) => {
                    warn!("Failed to extract {:?}: {}", detected.path, err);
                    summary.failed += 1;
                }
            }
        }
        info!(
            "Scanned {:?}: {} files, {} unchanged, {} queued, {} failed",
            dir, summary.scanned, summary.unchanged, summary.queued, summary.failed
        );
        Ok(summary)
    }

    /// Re-examines one file after a change notification.
    pub fn process_file(&mut self, path: &Path) -> Result<FileOutcome, LibraryError> {
        if self.ignore.contains(path) || common::is_hidden(path) {
            return Ok(FileOutcome::Skipped);
        }
        let detected = match self.extractor.detect(path) {
            Ok(detected) => detected,
            Err(MetadataError::UnknownType(_)) => return Ok(FileOutcome::Skipped),
            Err(MetadataError::NotFound(_)) => {
                debug!("{:?} vanished before it could be indexed", path);
                return Ok(FileOutcome::Skipped);
            }
            Err(err) => return Err(err.into()),
        };
        if self.store.is_unchanged(&detected)? {
            return Ok(FileOutcome::Unchanged);
        }
        match self.extractor.extract(&detected) {
            Ok(entry) => {
                self.store.insert(entry)?;
                Ok(FileOutcome::Queued)
            }
            Err(err) => {
                warn!("Failed to extract {:?}: {}", path, err);
                Ok(FileOutcome::Skipped)
            }
        }
    }

    /// Drops a deleted path: the entry itself if it was indexed, otherwise
    /// everything below it.
    pub fn remove_path(&mut self, path: &Path) -> Result<(), LibraryError> {
        let key = path_key(path);
        if self.store.get_fingerprint(&key)?.is_some() {
            self.store.remove(&key)
        } else {
            self.store.remove_subtree(&subtree_prefix(path))
        }
    }

    pub fn is_ignored(&self, path: &Path) -> bool {
        self.ignore.contains(path)
    }

    pub fn ignore(&self) -> &IgnoreSet {
        &self.ignore
    }

    pub fn store(&self) -> &MediaStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut MediaStore {
        &mut self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{field_str, CatalogRequest};
    use crate::documents::DocumentCatalog;
    use crate::fingerprints::FingerprintStore;
    use crate::kinds::{FILE_KIND, IMAGE_ALBUM_KIND};
    use crate::queue::QueueEvents;
    use crate::queue::tests::{drain, Recorder, ScriptedCatalog};
    use common::{DetectedFile, MediaEntry};
    use metadata::TagExtractor;
    use serde_json::json;
    use std::cell::RefCell;
    use std::fs;
    use std::io::Write;
    use std::rc::Rc;

    struct Fixture {
        _dir: tempfile::TempDir,
        media: std::path::PathBuf,
        catalog: DocumentCatalog,
        indexer: Indexer,
        events: QueueEvents,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_extractor(Box::new(TagExtractor::new()))
        }

        fn with_extractor(extractor: Box<dyn Extractor>) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let media = dir.path().join("media");
            fs::create_dir_all(media.join("x/holiday")).unwrap();
            fs::create_dir_all(media.join("xy")).unwrap();
            fs::write(media.join("x/holiday/a.jpg"), b"aaaa").unwrap();
            fs::write(media.join("x/holiday/b.jpg"), b"bbbb").unwrap();
            fs::write(media.join("x/readme.txt"), b"read me").unwrap();
            fs::write(media.join("xy/c.jpg"), b"cccc").unwrap();

            let fingerprints = FingerprintStore::open(&dir.path().join("state.redb")).unwrap();
            let catalog = DocumentCatalog::open(&dir.path().join("catalog.redb"))
                .unwrap()
                .inline();
            let (store, events) =
                MediaStore::open(fingerprints, Box::new(catalog.clone())).unwrap();
            let mut fixture = Self {
                _dir: dir,
                media,
                catalog,
                indexer: Indexer::new(store, extractor, IgnoreSet::default()),
                events,
            };
            fixture.settle();
            fixture
        }

        fn settle(&mut self) {
            self.indexer.store_mut().pump(&mut self.events);
            assert!(self.indexer.store().queue().is_idle());
        }

        fn scan(&mut self) -> ScanSummary {
            let media = self.media.clone();
            let summary = self.indexer.read_files(&media, KindFilter::All).unwrap();
            self.settle();
            summary
        }

        fn paths(&self) -> Vec<String> {
            let mut paths: Vec<String> = self
                .catalog
                .documents(FILE_KIND)
                .unwrap()
                .iter()
                .map(|doc| field_str(doc, "path").to_string())
                .collect();
            paths.sort();
            paths
        }
    }

    #[test]
    fn rescanning_unchanged_tree_queues_nothing() {
        let mut fx = Fixture::new();
        let first = fx.scan();
        assert_eq!(first.queued, 4);
        assert_eq!(fx.paths().len(), 4);

        let executed = fx.indexer.store().stats().executed;
        let second = fx.scan();
        assert_eq!(second.scanned, 4);
        assert_eq!(second.unchanged, 4);
        assert_eq!(second.queued, 0);
        assert_eq!(fx.indexer.store().stats().executed, executed);
    }

    #[test]
    fn changed_file_is_replaced_once() {
        let mut fx = Fixture::new();
        fx.scan();
        let path = fx.media.join("x/readme.txt");
        let key = path_key(&path);
        let before = fx.indexer.store().get_fingerprint(&key).unwrap().unwrap();

        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b" and more").unwrap();
        drop(file);

        let summary = fx.scan();
        assert_eq!(summary.queued, 1);
        assert_eq!(summary.unchanged, 3);
        let after = fx.indexer.store().get_fingerprint(&key).unwrap().unwrap();
        assert_ne!(before, after);

        let docs = fx.catalog.documents(FILE_KIND).unwrap();
        let matching: Vec<_> = docs
            .iter()
            .filter(|doc| field_str(doc, "path") == key)
            .collect();
        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0]["size"], json!(16));
    }

    #[test]
    fn image_albums_track_their_members() {
        let mut fx = Fixture::new();
        fx.scan();

        let albums = fx.catalog.documents(IMAGE_ALBUM_KIND).unwrap();
        assert_eq!(albums.len(), 2);
        let holiday = albums
            .iter()
            .find(|album| field_str(album, "name") == "holiday")
            .unwrap();
        assert_eq!(holiday["total"], json!({"images": 2}));

        let album_id = holiday["_id"].clone();
        let members = fx
            .catalog
            .documents(FILE_KIND)
            .unwrap()
            .into_iter()
            .filter(|doc| doc.get("albumId") == Some(&album_id))
            .count();
        assert_eq!(members, 2);
    }

    #[test]
    fn removing_a_directory_cascades() {
        let mut fx = Fixture::new();
        fx.scan();

        let dir = fx.media.join("x");
        fx.indexer.remove_path(&dir).unwrap();
        fx.settle();

        let prefix = subtree_prefix(&dir);
        assert!(fx.paths().iter().all(|path| !path.starts_with(&prefix)));
        assert_eq!(fx.paths().len(), 1);
        assert_eq!(
            fx.indexer
                .store()
                .get_fingerprint(&path_key(&fx.media.join("x/holiday/a.jpg")))
                .unwrap(),
            None
        );
        // The emptied album is gone; the sibling directory's survives.
        let albums = fx.catalog.documents(IMAGE_ALBUM_KIND).unwrap();
        assert_eq!(albums.len(), 1);
        assert_eq!(field_str(&albums[0], "name"), "xy");
    }

    #[test]
    fn removing_one_image_recounts_its_album() {
        let mut fx = Fixture::new();
        fx.scan();

        fx.indexer
            .remove_path(&fx.media.join("x/holiday/a.jpg"))
            .unwrap();
        fx.settle();

        let albums = fx.catalog.documents(IMAGE_ALBUM_KIND).unwrap();
        let holiday = albums
            .iter()
            .find(|album| field_str(album, "name") == "holiday")
            .unwrap();
        assert_eq!(holiday["total"], json!({"images": 1}));
    }

    #[test]
    fn process_file_picks_up_new_files() {
        let mut fx = Fixture::new();
        fx.scan();
        let path = fx.media.join("xy/d.png");
        fs::write(&path, b"dddd").unwrap();

        assert_eq!(fx.indexer.process_file(&path).unwrap(), FileOutcome::Queued);
        fx.settle();
        assert_eq!(
            fx.indexer.process_file(&path).unwrap(),
            FileOutcome::Unchanged
        );
        assert_eq!(
            fx.indexer
                .process_file(&fx.media.join("xy/.secret.png"))
                .unwrap(),
            FileOutcome::Skipped
        );
        assert!(fx.paths().contains(&path_key(&path)));
    }

    struct Flaky {
        inner: TagExtractor,
    }

    impl Extractor for Flaky {
        fn detect(&self, path: &Path) -> Result<DetectedFile, MetadataError> {
            self.inner.detect(path)
        }

        fn extract(&self, file: &DetectedFile) -> Result<MediaEntry, MetadataError> {
            if file.path.ends_with("a.jpg") {
                return Err(MetadataError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "corrupt",
                )));
            }
            self.inner.extract(file)
        }
    }

    #[test]
    fn extraction_failure_skips_only_that_file() {
        let mut fx = Fixture::with_extractor(Box::new(Flaky {
            inner: TagExtractor::new(),
        }));
        let summary = fx.scan();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.queued, 3);
        assert_eq!(fx.paths().len(), 3);
        // No fingerprint, so the next scan tries again.
        assert_eq!(fx.scan().failed, 1);
    }

    #[test]
    fn catalog_requests_never_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("media");
        fs::create_dir_all(media.join("one")).unwrap();
        fs::create_dir_all(media.join("two")).unwrap();
        for name in ["one/a.jpg", "one/b.jpg", "two/c.jpg"] {
            fs::write(media.join(name), name.as_bytes()).unwrap();
        }

        let fingerprints = FingerprintStore::open(&dir.path().join("state.redb")).unwrap();
        fingerprints.set_schema_version(crate::SCHEMA_VERSION).unwrap();
        let recorder = Rc::new(RefCell::new(Recorder::default()));
        let catalog = ScriptedCatalog::new(Rc::clone(&recorder));
        let (store, mut events) = MediaStore::open(fingerprints, Box::new(catalog)).unwrap();
        let mut indexer = Indexer::new(store, Box::new(TagExtractor::new()), IgnoreSet::default());

        let summary = indexer.read_files(&media, KindFilter::All).unwrap();
        assert_eq!(summary.queued, 3);
        drain(indexer.store.queue_mut(), &mut events, &recorder);

        // Each insert looks up, stores, then resolves its album.
        let requests = recorder.borrow().requests.clone();
        assert!(requests.len() >= 3 * 3);
        assert!(matches!(requests[0], CatalogRequest::Find(_)));
        assert!(matches!(requests[1], CatalogRequest::Put(_)));
    }
}
