use std::path::{Path, PathBuf};

use common::{is_hidden, is_ignored, DetectedFile, KindFilter};
use metadata::{Extractor, MetadataError};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Directories excluded from scanning and watching, with everything below them.
#[derive(Clone, Debug, Default)]
pub struct IgnoreSet {
    dirs: Vec<PathBuf>,
}

impl IgnoreSet {
    pub fn new<I, P>(dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            dirs: dirs.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        is_ignored(path, &self.dirs)
    }

    pub fn insert(&mut self, dir: impl Into<PathBuf>) {
        self.dirs.push(dir.into());
    }
}

/// Walks `root` lazily, yielding a descriptor for every regular file that
/// passes the filter. Files the extractor cannot classify are skipped.
pub fn scan<'a>(
    extractor: &'a dyn Extractor,
    root: &Path,
    filter: KindFilter,
    ignore: &'a IgnoreSet,
) -> impl Iterator<Item = DetectedFile> + 'a {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(move |entry| {
            !ignore.contains(entry.path()) && (entry.depth() == 0 || !is_hidden(entry.path()))
        })
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!("Scan error: {}", err);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter_map(move |entry| match extractor.detect(entry.path()) {
            Ok(detected) => Some(detected),
            Err(MetadataError::UnknownType(path)) => {
                debug!("Skipping {} (unknown type)", path);
                None
            }
            Err(err) => {
                warn!("Failed to detect {:?}: {}", entry.path(), err);
                None
            }
        })
        .filter(move |detected| filter.matches(detected.kind))
}
