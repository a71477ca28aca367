//! Application state
//!
//! Holds the active `StorageManager`, a small most-recently-used pool of
//! managers for volumes the operator switched away from, the persisted
//! settings and the process-wide mmap pool. Swapping volumes is the only
//! mutation; everything else is snapshot reads.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::cache::{self, MmapManager};
use crate::config::ServerConfig;
use crate::config_file::{Settings, SETTINGS_FILE};
use crate::error::Result;
use crate::format::MASTER_INDEX_NAME;
use crate::storage::StorageManager;

/// Managers kept around after a volume swap.
const MAX_RECENT: usize = 4;

pub struct AppState {
    pub config: ServerConfig,
    settings_path: PathBuf,
    settings: RwLock<Settings>,
    cache_dir: PathBuf,
    storage: RwLock<Option<Arc<StorageManager>>>,
    recent: Mutex<VecDeque<Arc<StorageManager>>>,
    pub mmaps: Arc<MmapManager>,
}

impl AppState {
    pub fn new(config: ServerConfig, settings: Settings) -> Result<Self> {
        let cache_dir = cache::cache_dir(&config.workdir)?;
        let settings_path = config.workdir.join(SETTINGS_FILE);
        Ok(Self {
            config,
            settings_path,
            settings: RwLock::new(settings),
            cache_dir,
            storage: RwLock::new(None),
            recent: Mutex::new(VecDeque::new()),
            mmaps: Arc::new(MmapManager::new()),
        })
    }

    pub fn settings(&self) -> Settings {
        self.settings.read().clone()
    }

    /// Mutate and persist settings. Persistence failures are logged, not
    /// fatal: the server keeps the in-memory value.
    pub fn update_settings(&self, f: impl FnOnce(&mut Settings)) {
        let mut settings = self.settings.write();
        f(&mut settings);
        if let Err(e) = settings.save(&self.settings_path) {
            tracing::warn!(error = %e, "settings not persisted");
        }
    }

    pub fn storage(&self) -> Option<Arc<StorageManager>> {
        self.storage.read().clone()
    }

    /// Mount `path`, swapping out the active manager.
    ///
    /// The previous manager is remembered in the MRU pool. A path that is
    /// already active or pooled is reused only if the master index still
    /// hashes the same; a reinserted medium with new recordings forces a
    /// reload.
    pub fn mount_volume(&self, path: &Path) -> Result<Arc<StorageManager>> {
        let index_hash = cache::content_hash(&path.join(MASTER_INDEX_NAME)).ok();

        if let Some(current) = self.storage() {
            if current.volume_path() == path && Some(current.volume_hash()) == index_hash {
                tracing::debug!(path = %path.display(), "volume already mounted");
                return Ok(current);
            }
        }

        let reused = index_hash.and_then(|hash| {
            let mut recent = self.recent.lock();
            let pos = recent
                .iter()
                .position(|m| m.volume_path() == path && m.volume_hash() == hash)?;
            recent.remove(pos)
        });

        let manager = match reused {
            Some(manager) => {
                tracing::info!(path = %path.display(), "reusing cached volume state");
                manager
            }
            None => Arc::new(StorageManager::load(path, &self.cache_dir, self.mmaps.clone())?),
        };

        let previous = {
            let mut storage = self.storage.write();
            storage.replace(manager.clone())
        };

        if let Some(previous) = previous {
            let mut recent = self.recent.lock();
            recent.push_front(previous);
            while recent.len() > MAX_RECENT {
                let evicted = recent.pop_back();
                if let Some(evicted) = evicted {
                    tracing::debug!(path = %evicted.volume_path().display(), "dropping volume state");
                }
                // Unmount policy: pooled mappings go with the evicted
                // volume; live views keep their own handles and anything
                // still hot is remapped on demand.
                self.mmaps.release_all();
            }
        }

        Ok(manager)
    }

    /// Kick off cache construction for the whole volume in the background.
    pub fn spawn_cache_build(self: &Arc<Self>, manager: Arc<StorageManager>) {
        tokio::spawn(async move {
            let result = manager
                .build_cache(None, |current, total, file_index| {
                    tracing::info!(current, total, file_index, "segment cached");
                })
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "cache build failed");
            }
        });
    }
}
