//! Content-addressed layer store.
//!
//! Layers follow the same install/retention pattern as services: download,
//! digest check, unpack through the space allocator, durable index row,
//! TTL eviction of cached entries. The key is the layer digest; the digest
//! of the unpacked content is recorded alongside.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::allocator::{ItemRemover, SpaceAllocator};
use crate::downloader::Downloader;
use crate::error::{Error, Result};
use crate::image;
use crate::storage::{ItemState, LayerEntry, Store};
use crate::types::LayerInfo;

#[derive(Debug, Clone)]
pub struct LayerManagerConfig {
    pub layers_dir: PathBuf,
    pub download_dir: PathBuf,
    pub ttl: Duration,
    pub remove_outdated_period: Duration,
}

/// Deletes an evicted layer from disk and the index on behalf of the space
/// allocator.
pub struct LayerItemRemover {
    store: Arc<Store>,
}

impl LayerItemRemover {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ItemRemover for LayerItemRemover {
    async fn remove_item(&self, digest: &str) -> Result<()> {
        let Some(entry) = self.store.get_layer(digest).await? else {
            return Ok(());
        };

        info!(digest, path = %entry.path, "evicting layer");

        tokio::fs::remove_dir_all(&entry.path).await.ok();
        self.store.remove_layer(digest).await
    }
}

pub struct LayerManager {
    config: LayerManagerConfig,
    store: Arc<Store>,
    downloader: Arc<dyn Downloader>,
    allocator: Arc<SpaceAllocator>,
    download_allocator: Arc<SpaceAllocator>,
    refcounts: Mutex<HashMap<String, usize>>,
    shutdown: watch::Sender<bool>,
}

impl LayerManager {
    pub fn new(
        config: LayerManagerConfig,
        store: Arc<Store>,
        downloader: Arc<dyn Downloader>,
        allocator: Arc<SpaceAllocator>,
        download_allocator: Arc<SpaceAllocator>,
    ) -> Self {
        Self {
            config,
            store,
            downloader,
            allocator,
            download_allocator,
            refcounts: Mutex::new(HashMap::new()),
            shutdown: watch::channel(false).0,
        }
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.layers_dir).await?;
        tokio::fs::create_dir_all(&self.config.download_dir).await?;

        for entry in self.store.get_all_layers().await? {
            self.allocator.add_item(&entry.digest, entry.size).await;

            if entry.state == ItemState::Cached {
                self.allocator
                    .add_outdated_item(&entry.digest, entry.size, entry.timestamp)
                    .await;
            }
        }

        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let period = self.config.remove_outdated_period;

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.tick().await;

            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(err) = manager.remove_outdated().await {
                            error!(%err, "outdated layer cleanup failed");
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });

        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Diffs the desired layer list against the database. Install failures
    /// are collected per digest; the batch continues.
    pub async fn process_desired_layers(
        &self,
        layers: &[LayerInfo],
    ) -> Result<HashMap<String, Error>> {
        debug!(count = layers.len(), "processing desired layers");

        let mut failed = HashMap::new();

        for info in layers {
            if let Err(err) = self.install_layer(info).await {
                error!(layer_id = %info.layer_id, digest = %info.digest, %err, "layer install failed");

                failed.insert(info.digest.clone(), err);
            }
        }

        for entry in self.store.get_all_layers().await? {
            let desired = layers.iter().any(|l| l.digest == entry.digest);

            if !desired && entry.state == ItemState::Active {
                let now = Utc::now();

                self.store
                    .set_layer_state(&entry.digest, ItemState::Cached, now)
                    .await?;

                if self.refcount(&entry.digest).await == 0 {
                    self.allocator
                        .add_outdated_item(&entry.digest, entry.size, now)
                        .await;
                }
            }
        }

        Ok(failed)
    }

    /// Installs one layer. Idempotent on the digest.
    pub async fn install_layer(&self, info: &LayerInfo) -> Result<LayerEntry> {
        if let Some(existing) = self.store.get_layer(&info.digest).await? {
            if existing.state == ItemState::Cached {
                self.store
                    .set_layer_state(&existing.digest, ItemState::Active, Utc::now())
                    .await?;
                self.allocator.remove_outdated_item(&existing.digest).await;
            }

            return Ok(LayerEntry {
                state: ItemState::Active,
                ..existing
            });
        }

        info!(layer_id = %info.layer_id, digest = %info.digest, "installing layer");

        let digest = image::digest_hex(&info.digest).to_string();
        let archive_path = self.config.download_dir.join(format!("{digest}.tar.gz"));

        let download_space = self
            .download_allocator
            .allocate_space(&digest, info.size)
            .await?;

        let result = self.download_and_unpack(info, &digest, &archive_path).await;

        tokio::fs::remove_file(&archive_path).await.ok();
        self.download_allocator
            .restore_allocation(download_space)
            .await;

        match result {
            Ok(entry) => Ok(entry),
            Err(err) => {
                warn!(layer_id = %info.layer_id, %err, "layer install rolled back");

                Err(err)
            }
        }
    }

    async fn download_and_unpack(
        &self,
        info: &LayerInfo,
        digest: &str,
        archive_path: &std::path::Path,
    ) -> Result<LayerEntry> {
        self.downloader.download(&info.url, archive_path).await?;

        image::check_file_info(archive_path, info.size, &info.sha256).await?;

        let unpacked_size = image::unpacked_archive_size(archive_path).await?;
        let install_space = self.allocator.allocate_space(digest, unpacked_size).await?;

        let install_dir = image::digest_path(&self.config.layers_dir, digest);

        let unpack_result: Result<LayerEntry> = async {
            image::unpack_archive(archive_path, &install_dir).await?;

            let manifest = image::load_manifest(&install_dir).await?;

            image::whiteouts_to_overlay(&install_dir, 0, 0).await?;

            let entry = LayerEntry {
                digest: info.digest.clone(),
                unpacked_digest: manifest.config.digest.clone(),
                layer_id: info.layer_id.clone(),
                path: install_dir.display().to_string(),
                os_version: String::new(),
                version: info.version.clone(),
                state: ItemState::Active,
                size: unpacked_size,
                timestamp: Utc::now(),
            };

            self.store.add_layer(&entry).await?;

            Ok(entry)
        }
        .await;

        match unpack_result {
            Ok(entry) => {
                self.allocator.accept_allocation(install_space).await;

                Ok(entry)
            }
            Err(err) => {
                tokio::fs::remove_dir_all(&install_dir).await.ok();
                self.allocator.restore_allocation(install_space).await;

                Err(err)
            }
        }
    }

    /// Removes an installed layer. Fails while services still hold it.
    pub async fn remove_layer(&self, digest: &str) -> Result<()> {
        if self.refcount(digest).await > 0 {
            return Err(Error::Failed(format!("layer {digest} is in use")));
        }

        let entry = self
            .store
            .get_layer(digest)
            .await?
            .ok_or_else(|| Error::NotFound(format!("layer digest {digest}")))?;

        tokio::fs::remove_dir_all(&entry.path).await.ok();
        self.allocator.free_space(&entry.digest).await;
        self.store.remove_layer(digest).await?;

        Ok(())
    }

    pub async fn get_layer(&self, digest: &str) -> Result<LayerEntry> {
        self.store
            .get_layer(digest)
            .await?
            .ok_or_else(|| Error::NotFound(format!("layer digest {digest}")))
    }

    pub async fn retain_layer(&self, digest: &str) {
        let mut refcounts = self.refcounts.lock().await;

        *refcounts.entry(digest.to_string()).or_insert(0) += 1;
        self.allocator.remove_outdated_item(digest).await;
    }

    pub async fn release_layer(&self, digest: &str) {
        let mut refcounts = self.refcounts.lock().await;

        let remaining = match refcounts.get_mut(digest) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => return,
        };

        if remaining > 0 {
            return;
        }

        refcounts.remove(digest);
        drop(refcounts);

        if let Ok(Some(entry)) = self.store.get_layer(digest).await {
            if entry.state == ItemState::Cached {
                self.allocator
                    .add_outdated_item(digest, entry.size, entry.timestamp)
                    .await;
            }
        }
    }

    async fn refcount(&self, digest: &str) -> usize {
        *self.refcounts.lock().await.get(digest).unwrap_or(&0)
    }

    pub async fn remove_outdated(&self) -> Result<()> {
        let deadline = Utc::now()
            - chrono::Duration::from_std(self.config.ttl)
                .map_err(|err| Error::InvalidArgument(err.to_string()))?;

        for entry in self.store.get_all_layers().await? {
            if entry.state == ItemState::Cached
                && entry.timestamp < deadline
                && self.refcount(&entry.digest).await == 0
            {
                info!(layer_id = %entry.layer_id, digest = %entry.digest, "removing outdated layer");

                self.remove_layer(&entry.digest).await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    struct FileDownloader;

    #[async_trait]
    impl Downloader for FileDownloader {
        async fn download(&self, url: &str, dst: &Path) -> Result<()> {
            tokio::fs::copy(url, dst).await?;

            Ok(())
        }
    }

    struct NoopRemover;

    #[async_trait]
    impl ItemRemover for NoopRemover {
        async fn remove_item(&self, _id: &str) -> Result<()> {
            Ok(())
        }
    }

    async fn make_layer_archive(dir: &Path) -> (PathBuf, String, u64) {
        let manifest =
            br#"{"schemaVersion": 2, "config": {"digest": "sha256:unpacked", "size": 4}}"#;
        let archive_path = dir.join("layer.tar.gz");

        let file = std::fs::File::create(&archive_path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);

        let mut header = tar::Header::new_gnu();
        header.set_size(manifest.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "manifest.json", manifest.as_slice())
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let sha256 = image::sha256_file(&archive_path).await.unwrap();
        let size = tokio::fs::metadata(&archive_path).await.unwrap().len();

        (archive_path, sha256, size)
    }

    async fn manager(dir: &Path) -> Arc<LayerManager> {
        let store = Arc::new(Store::new_in_memory().await.unwrap());

        let manager = Arc::new(LayerManager::new(
            LayerManagerConfig {
                layers_dir: dir.join("layers"),
                download_dir: dir.join("downloads"),
                ttl: Duration::from_secs(3600),
                remove_outdated_period: Duration::from_secs(3600),
            },
            store,
            Arc::new(FileDownloader),
            Arc::new(SpaceAllocator::new("layers", u64::MAX, Arc::new(NoopRemover))),
            Arc::new(SpaceAllocator::new(
                "downloads",
                u64::MAX,
                Arc::new(NoopRemover),
            )),
        ));

        manager.start().await.unwrap();

        manager
    }

    fn info(digest: &str, url: &str, sha256: &str, size: u64) -> LayerInfo {
        LayerInfo {
            layer_id: "layer1".to_string(),
            digest: digest.to_string(),
            version: "1.0".to_string(),
            url: url.to_string(),
            sha256: sha256.to_string(),
            size,
        }
    }

    #[tokio::test]
    async fn install_records_unpacked_digest() {
        let dir = tempfile::tempdir().unwrap();
        let (archive, sha256, size) = make_layer_archive(dir.path()).await;
        let manager = manager(dir.path()).await;

        let entry = manager
            .install_layer(&info(
                &format!("sha256:{sha256}"),
                archive.to_str().unwrap(),
                &sha256,
                size,
            ))
            .await
            .unwrap();

        assert_eq!(entry.unpacked_digest, "sha256:unpacked");
        assert_eq!(entry.state, ItemState::Active);
    }

    #[tokio::test]
    async fn absent_layer_becomes_cached_then_evicted_after_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let (archive, sha256, size) = make_layer_archive(dir.path()).await;
        let manager = manager(dir.path()).await;

        let digest = format!("sha256:{sha256}");
        let desired = vec![info(&digest, archive.to_str().unwrap(), &sha256, size)];

        manager.process_desired_layers(&desired).await.unwrap();
        manager.process_desired_layers(&[]).await.unwrap();

        let entry = manager.get_layer(&digest).await.unwrap();
        assert_eq!(entry.state, ItemState::Cached);

        manager
            .store
            .set_layer_state(&digest, ItemState::Cached, Utc::now() - chrono::Duration::hours(2))
            .await
            .unwrap();

        manager.remove_outdated().await.unwrap();
        assert!(manager.get_layer(&digest).await.is_err());
    }

    #[tokio::test]
    async fn retained_layer_survives_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let (archive, sha256, size) = make_layer_archive(dir.path()).await;
        let manager = manager(dir.path()).await;

        let digest = format!("sha256:{sha256}");
        manager
            .install_layer(&info(&digest, archive.to_str().unwrap(), &sha256, size))
            .await
            .unwrap();

        manager.retain_layer(&digest).await;
        manager
            .store
            .set_layer_state(&digest, ItemState::Cached, Utc::now() - chrono::Duration::hours(2))
            .await
            .unwrap();

        manager.remove_outdated().await.unwrap();
        assert!(manager.get_layer(&digest).await.is_ok());
    }
}
