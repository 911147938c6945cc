//! Content-addressed service image store.
//!
//! Services install into `services_dir/<digest>` through the space
//! allocator; the durable index lives in the database. Entries not present
//! in the desired set become `Cached` and are evicted after the TTL, unless
//! a running instance still references them.

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
use crate::storage::{ItemState, ServiceEntry, Store};
use crate::types::ServiceInfo;

#[derive(Debug, Clone)]
pub struct ServiceManagerConfig {
    pub services_dir: PathBuf,
    pub download_dir: PathBuf,
    pub ttl: Duration,
    pub remove_outdated_period: Duration,
}

/// Deletes an evicted service from disk and the index on behalf of the
/// space allocator.
pub struct ServiceItemRemover {
    store: Arc<Store>,
}

impl ServiceItemRemover {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ItemRemover for ServiceItemRemover {
    async fn remove_item(&self, digest: &str) -> Result<()> {
        let Some(entry) = self.store.get_service_by_digest(digest).await? else {
            return Ok(());
        };

        info!(digest, path = %entry.local_path, "evicting service");

        tokio::fs::remove_dir_all(&entry.local_path).await.ok();
        self.store.remove_service(digest).await
    }
}

pub struct ServiceManager {
    config: ServiceManagerConfig,
    store: Arc<Store>,
    downloader: Arc<dyn Downloader>,
    allocator: Arc<SpaceAllocator>,
    download_allocator: Arc<SpaceAllocator>,
    refcounts: Mutex<HashMap<String, usize>>,
    shutdown: watch::Sender<bool>,
}

impl ServiceManager {
    pub fn new(
        config: ServiceManagerConfig,
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

    /// Rebuilds allocator accounting from the database and starts the
    /// outdated-eviction timer.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.services_dir).await?;
        tokio::fs::create_dir_all(&self.config.download_dir).await?;

        for entry in self.store.get_all_services().await? {
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
                            error!(%err, "outdated service cleanup failed");
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

    /// Diffs the desired service list against the database: installs
    /// new/updated revisions, marks absentees cached and evictable.
    /// Install failures are collected per service id; the batch continues.
    pub async fn process_desired_services(
        &self,
        services: &[ServiceInfo],
    ) -> Result<HashMap<String, Error>> {
        debug!(count = services.len(), "processing desired services");

        let mut failed = HashMap::new();

        for info in services {
            if let Err(err) = self.install_service(info).await {
                error!(
                    service_id = %info.service_id,
                    version = %info.version,
                    %err,
                    "service install failed"
                );

                failed.insert(info.service_id.clone(), err);
            }
        }

        for entry in self.store.get_all_services().await? {
            let desired = services
                .iter()
                .any(|s| s.service_id == entry.service_id && s.version == entry.version);

            if !desired && entry.state == ItemState::Active {
                let now = Utc::now();

                self.store
                    .set_service_state(&entry.digest, ItemState::Cached, now)
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

    /// Installs one service revision. Idempotent: a pre-existing row for the
    /// same revision short-circuits.
    pub async fn install_service(&self, info: &ServiceInfo) -> Result<ServiceEntry> {
        if let Some(existing) = self
            .store
            .get_service(&info.service_id, &info.version)
            .await?
        {
            if existing.state == ItemState::Cached {
                self.store
                    .set_service_state(&existing.digest, ItemState::Active, Utc::now())
                    .await?;
                self.allocator.remove_outdated_item(&existing.digest).await;
            }

            return Ok(ServiceEntry {
                state: ItemState::Active,
                ..existing
            });
        }

        info!(
            service_id = %info.service_id,
            version = %info.version,
            url = %info.url,
            "installing service"
        );

        let digest = image::digest_hex(&info.sha256).to_string();
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
                warn!(service_id = %info.service_id, %err, "install rolled back");

                Err(err)
            }
        }
    }

    async fn download_and_unpack(
        &self,
        info: &ServiceInfo,
        digest: &str,
        archive_path: &std::path::Path,
    ) -> Result<ServiceEntry> {
        self.downloader.download(&info.url, archive_path).await?;

        image::check_file_info(archive_path, info.size, &info.sha256).await?;

        let unpacked_size = image::unpacked_archive_size(archive_path).await?;
        let install_space = self.allocator.allocate_space(digest, unpacked_size).await?;

        let install_dir = image::digest_path(&self.config.services_dir, digest);

        let unpack_result: Result<ServiceEntry> = async {
            image::unpack_archive(archive_path, &install_dir).await?;
            image::load_manifest(&install_dir).await?;

            let entry = ServiceEntry {
                service_id: info.service_id.clone(),
                version: info.version.clone(),
                provider_id: info.provider_id.clone(),
                digest: digest.to_string(),
                local_path: install_dir.display().to_string(),
                size: unpacked_size,
                gid: info.gid,
                state: ItemState::Active,
                timestamp: Utc::now(),
            };

            self.store.add_service(&entry).await?;

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

    /// Removes an installed service. Fails while instances still hold it.
    pub async fn remove_service(&self, digest: &str) -> Result<()> {
        if self.refcount(digest).await > 0 {
            return Err(Error::Failed(format!("service {digest} is in use")));
        }

        let entry = self
            .store
            .get_service_by_digest(digest)
            .await?
            .ok_or_else(|| Error::NotFound(format!("service digest {digest}")))?;

        tokio::fs::remove_dir_all(&entry.local_path).await.ok();
        self.allocator.free_space(digest).await;
        self.store.remove_service(digest).await?;

        Ok(())
    }

    /// Returns installed service metadata and marks it recently used.
    pub async fn get_service(&self, service_id: &str, version: &str) -> Result<ServiceEntry> {
        let entry = self
            .store
            .get_service(service_id, version)
            .await?
            .ok_or_else(|| Error::NotFound(format!("service {service_id} {version}")))?;

        if entry.state == ItemState::Cached {
            self.store
                .set_service_state(&entry.digest, ItemState::Cached, Utc::now())
                .await?;
        }

        Ok(entry)
    }

    /// Marks a service referenced by a running instance.
    pub async fn retain_service(&self, digest: &str) {
        let mut refcounts = self.refcounts.lock().await;

        *refcounts.entry(digest.to_string()).or_insert(0) += 1;
        self.allocator.remove_outdated_item(digest).await;
    }

    /// Drops one reference; the service becomes evictable at zero.
    pub async fn release_service(&self, digest: &str) {
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

        if let Ok(Some(entry)) = self.store.get_service_by_digest(digest).await {
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

    /// Drops cached entries whose TTL expired.
    pub async fn remove_outdated(&self) -> Result<()> {
        let deadline = Utc::now()
            - chrono::Duration::from_std(self.config.ttl)
                .map_err(|err| Error::InvalidArgument(err.to_string()))?;

        for entry in self.store.get_all_services().await? {
            if entry.state == ItemState::Cached
                && entry.timestamp < deadline
                && self.refcount(&entry.digest).await == 0
            {
                info!(
                    service_id = %entry.service_id,
                    version = %entry.version,
                    "removing outdated service"
                );

                self.remove_service(&entry.digest).await?;
            }
        }

        Ok(())
    }
}
