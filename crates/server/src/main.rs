mod config;
mod watch;

use config::{config_path_from_env, load_or_create_config, resolve_ignored, resolve_path};
use library::{DocumentCatalog, FingerprintStore, IgnoreSet, Indexer, MediaStore};
use metadata::TagExtractor;
use tracing::{info, warn};
use watch::WatchManager;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = config_path_from_env();
    let (config, created) = load_or_create_config(&config_path)?;
    if created {
        info!("Created default config at {:?}", config_path);
    } else {
        info!("Loaded config from {:?}", config_path);
    }

    let state_path = resolve_path(&config_path, config.state_path.trim());
    let catalog_path = resolve_path(&config_path, config.catalog_path.trim());
    let mount_root = resolve_path(&config_path, config.mount_root.trim());
    let ignore = IgnoreSet::new(resolve_ignored(&config_path, &config));

    let fingerprints = FingerprintStore::open(&state_path)?;
    let catalog = DocumentCatalog::open(&catalog_path)?;
    let (store, mut queue_events) = MediaStore::open(fingerprints, Box::new(catalog))?;
    let mut indexer = Indexer::new(store, Box::new(TagExtractor::new()), ignore);

    let (mut watches, mut watch_events) = WatchManager::new(mount_root.clone());
    info!("Indexing mounts under {}", mount_root.display());
    watches.setup(&mut indexer, config.watch_mounts)?;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            Some(event) = queue_events.recv() => {
                indexer.store_mut().handle(event);
            }
            Some(event) = watch_events.recv() => {
                if let Err(err) = watches.handle_event(&mut indexer, event) {
                    warn!("Failed to handle watch event: {}", err);
                }
            }
            _ = &mut shutdown => break,
        }
    }

    let stats = indexer.store().stats();
    info!(
        "Stopping: {} roots watched, {} queued commands \
         ({} executed, {} failed, {} coalesced, {} discarded)",
        watches.watched().count(),
        indexer.store().queue().len(),
        stats.executed,
        stats.failed,
        stats.coalesced,
        stats.discarded
    );
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                warn!("Failed to install terminate signal handler: {}", err);
                if let Err(err) = tokio::signal::ctrl_c().await {
                    warn!("Failed to listen for ctrl-c: {}", err);
                }
                info!("Shutdown signal received.");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", err);
        }
    }

    info!("Shutdown signal received.");
}
