use std::env;
use std::path::PathBuf;

use common::KindFilter;
use library::{DocumentCatalog, FingerprintStore, IgnoreSet, Indexer, MediaStore};
use metadata::TagExtractor;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut args = env::args().skip(1);
    let root = args
        .next()
        .or_else(|| env::var("MEDIA_ROOT").ok())
        .ok_or("usage: import_scan <root> [state.redb] [catalog.redb]")?;
    let state_path = args
        .next()
        .unwrap_or_else(|| "data/fingerprints.redb".to_string());
    let catalog_path = args
        .next()
        .unwrap_or_else(|| "data/catalog.redb".to_string());

    let root = std::fs::canonicalize(PathBuf::from(&root))?;
    info!("Importing {}", root.display());
    let fingerprints = FingerprintStore::open(&PathBuf::from(&state_path))?;
    let catalog = DocumentCatalog::open(&PathBuf::from(&catalog_path))?.inline();
    let (store, mut events) = MediaStore::open(fingerprints, Box::new(catalog))?;
    let mut indexer = Indexer::new(store, Box::new(TagExtractor::new()), IgnoreSet::default());

    let summary = indexer.read_files(&root, KindFilter::All)?;
    indexer.store_mut().pump(&mut events);
    let stats = indexer.store().stats();

    println!(
        "Scanned {} files: {} unchanged, {} queued, {} failed",
        summary.scanned, summary.unchanged, summary.queued, summary.failed
    );
    println!(
        "Commands: {} executed, {} failed, {} coalesced",
        stats.executed, stats.failed, stats.coalesced
    );

    Ok(())
}
