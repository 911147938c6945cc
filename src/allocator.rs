//! Transactional disk-space accounting for one on-disk pool.
//!
//! The allocator tracks reserved bytes against a fixed capacity and keeps an
//! index of outdated (unreferenced, evictable) items. When a reservation does
//! not fit, outdated items are evicted oldest-first through the owner's
//! [`ItemRemover`] until the request fits or candidates run out.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};

/// Removes an evicted item from disk and the durable index. Supplied by the
/// pool owner (service or layer manager).
#[async_trait]
pub trait ItemRemover: Send + Sync {
    async fn remove_item(&self, id: &str) -> Result<()>;
}

/// Remover for pools that never register outdated items, e.g. the
/// download staging pool.
pub struct NullRemover;

#[async_trait]
impl ItemRemover for NullRemover {
    async fn remove_item(&self, id: &str) -> Result<()> {
        Err(Error::NotFound(format!("no removable item {id}")))
    }
}

/// An uncommitted space reservation. Must be passed back to
/// [`SpaceAllocator::accept_allocation`] or
/// [`SpaceAllocator::restore_allocation`].
#[derive(Debug)]
pub struct Reservation {
    id: String,
    size: u64,
}

impl Reservation {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

#[derive(Debug, Clone)]
struct OutdatedItem {
    id: String,
    size: u64,
    timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct PoolState {
    allocated: u64,
    // accounted size per committed item id
    items: HashMap<String, u64>,
    outdated: Vec<OutdatedItem>,
}

pub struct SpaceAllocator {
    name: String,
    capacity: u64,
    state: Mutex<PoolState>,
    remover: Arc<dyn ItemRemover>,
}

impl SpaceAllocator {
    pub fn new(name: &str, capacity: u64, remover: Arc<dyn ItemRemover>) -> Self {
        Self {
            name: name.to_string(),
            capacity,
            state: Mutex::new(PoolState::default()),
            remover,
        }
    }

    /// Creates an allocator whose capacity is `part_limit` percent of the
    /// filesystem holding `root`. A zero part limit means unlimited.
    pub fn with_part_limit(
        name: &str,
        root: &Path,
        part_limit: u32,
        remover: Arc<dyn ItemRemover>,
    ) -> Result<Self> {
        let capacity = if part_limit == 0 {
            u64::MAX
        } else {
            let stat = nix::sys::statvfs::statvfs(root)?;
            let fs_capacity = stat.blocks() as u64 * stat.fragment_size() as u64;

            fs_capacity / 100 * part_limit.min(100) as u64
        };

        Ok(Self::new(name, capacity, remover))
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub async fn allocated_bytes(&self) -> u64 {
        self.state.lock().await.allocated
    }

    /// Reserves `size` bytes for item `id`, evicting outdated items
    /// oldest-first when the pool is full.
    pub async fn allocate_space(&self, id: &str, size: u64) -> Result<Reservation> {
        let mut state = self.state.lock().await;

        while state.allocated.saturating_add(size) > self.capacity {
            let victim = state
                .outdated
                .iter()
                .min_by_key(|item| item.timestamp)
                .cloned()
                .ok_or_else(|| {
                    Error::NoSpace(format!(
                        "pool {}: {} bytes requested, {} of {} allocated",
                        self.name, size, state.allocated, self.capacity
                    ))
                })?;

            debug!(pool = %self.name, item = %victim.id, size = victim.size, "evicting outdated item");

            self.remover.remove_item(&victim.id).await?;

            state.outdated.retain(|item| item.id != victim.id);
            state.items.remove(&victim.id);
            state.allocated = state.allocated.saturating_sub(victim.size);
        }

        state.allocated += size;

        Ok(Reservation {
            id: id.to_string(),
            size,
        })
    }

    /// Finalises a reservation: the bytes stay accounted under the item id.
    pub async fn accept_allocation(&self, reservation: Reservation) {
        let mut state = self.state.lock().await;

        *state.items.entry(reservation.id).or_insert(0) += reservation.size;
    }

    /// Rolls a reservation back and frees its bytes.
    pub async fn restore_allocation(&self, reservation: Reservation) {
        let mut state = self.state.lock().await;

        state.allocated = state.allocated.saturating_sub(reservation.size);
    }

    /// Accounts an already-installed item, e.g. when rebuilding state from
    /// the database at startup.
    pub async fn add_item(&self, id: &str, size: u64) {
        let mut state = self.state.lock().await;

        state.allocated += size;
        state.items.insert(id.to_string(), size);
    }

    /// Marks an item evictable. Called when its refcount drops to zero.
    pub async fn add_outdated_item(&self, id: &str, size: u64, timestamp: DateTime<Utc>) {
        let mut state = self.state.lock().await;

        state.outdated.retain(|item| item.id != id);
        state.outdated.push(OutdatedItem {
            id: id.to_string(),
            size,
            timestamp,
        });
    }

    /// Removes an item from the eviction index. Called when its refcount
    /// becomes non-zero again.
    pub async fn remove_outdated_item(&self, id: &str) {
        let mut state = self.state.lock().await;

        state.outdated.retain(|item| item.id != id);
    }

    /// Immediately releases the bytes accounted for `id` on explicit removal.
    pub async fn free_space(&self, id: &str) {
        let mut state = self.state.lock().await;

        if let Some(size) = state.items.remove(id) {
            state.allocated = state.allocated.saturating_sub(size);
        }

        state.outdated.retain(|item| item.id != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MockRemover {
        removed: StdMutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl ItemRemover for MockRemover {
        async fn remove_item(&self, id: &str) -> Result<()> {
            if self.fail {
                return Err(Error::Failed("remove failed".into()));
            }

            self.removed.lock().unwrap().push(id.to_string());

            Ok(())
        }
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[tokio::test]
    async fn allocate_within_capacity() {
        let allocator = SpaceAllocator::new("test", 100, Arc::new(MockRemover::default()));

        let res = allocator.allocate_space("a", 100).await.unwrap();
        allocator.accept_allocation(res).await;

        assert_eq!(allocator.allocated_bytes().await, 100);
    }

    #[tokio::test]
    async fn over_capacity_fails_no_space() {
        let allocator = SpaceAllocator::new("test", 100, Arc::new(MockRemover::default()));

        let err = allocator.allocate_space("a", 101).await.unwrap_err();
        assert!(matches!(err, Error::NoSpace(_)));
        assert_eq!(allocator.allocated_bytes().await, 0);
    }

    #[tokio::test]
    async fn restore_frees_bytes() {
        let allocator = SpaceAllocator::new("test", 100, Arc::new(MockRemover::default()));

        let res = allocator.allocate_space("a", 60).await.unwrap();
        allocator.restore_allocation(res).await;

        assert_eq!(allocator.allocated_bytes().await, 0);
        assert!(allocator.allocate_space("b", 100).await.is_ok());
    }

    #[tokio::test]
    async fn eviction_frees_oldest_first() {
        let remover = Arc::new(MockRemover::default());
        let allocator = SpaceAllocator::new("test", 100, remover.clone());

        allocator.add_item("old", 60).await;
        allocator.add_item("new", 30).await;
        allocator.add_outdated_item("new", 30, ts(200)).await;
        allocator.add_outdated_item("old", 60, ts(100)).await;

        // 90 allocated; 50 more requires evicting only the oldest item.
        let res = allocator.allocate_space("incoming", 50).await.unwrap();
        allocator.accept_allocation(res).await;

        assert_eq!(*remover.removed.lock().unwrap(), vec!["old".to_string()]);
        assert_eq!(allocator.allocated_bytes().await, 80);
    }

    #[tokio::test]
    async fn eviction_exhausted_fails_no_space() {
        let remover = Arc::new(MockRemover::default());
        let allocator = SpaceAllocator::new("test", 100, remover.clone());

        allocator.add_item("only", 60).await;
        allocator.add_outdated_item("only", 60, ts(100)).await;

        let err = allocator.allocate_space("incoming", 120).await.unwrap_err();
        assert!(matches!(err, Error::NoSpace(_)));
        // The one candidate was still evicted while trying to satisfy the
        // request.
        assert_eq!(remover.removed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remover_failure_aborts_allocation() {
        let remover = Arc::new(MockRemover {
            fail: true,
            ..Default::default()
        });
        let allocator = SpaceAllocator::new("test", 100, remover);

        allocator.add_item("item", 80).await;
        allocator.add_outdated_item("item", 80, ts(100)).await;

        let err = allocator.allocate_space("incoming", 50).await.unwrap_err();
        assert!(matches!(err, Error::Failed(_)));
        assert_eq!(allocator.allocated_bytes().await, 80);
    }

    #[tokio::test]
    async fn referenced_item_not_evictable() {
        let remover = Arc::new(MockRemover::default());
        let allocator = SpaceAllocator::new("test", 100, remover.clone());

        allocator.add_item("item", 80).await;
        allocator.add_outdated_item("item", 80, ts(100)).await;
        allocator.remove_outdated_item("item").await;

        assert!(allocator.allocate_space("incoming", 50).await.is_err());
        assert!(remover.removed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn free_space_releases_item() {
        let allocator = SpaceAllocator::new("test", 100, Arc::new(MockRemover::default()));

        allocator.add_item("item", 80).await;
        allocator.free_space("item").await;

        assert_eq!(allocator.allocated_bytes().await, 0);
    }
}
