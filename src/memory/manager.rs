//! Owned-address storage: one cell, one lease lock and one copy-holder list
//! per address, all preallocated for the server's owned range at startup.

use super::item::MemoryItem;
use super::lease::LeaseLock;
use crate::types::{now_nanos, Address, ItemStatus, NetAddress, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("address {0} outside owned range")]
    NotOwned(Address),
}

struct Cell {
    lock: Arc<LeaseLock>,
    item: Mutex<MemoryItem>,
    holders: Mutex<Vec<NetAddress>>,
}

/// Storage and locking for one server's owned range `[lo, hi)`.
///
/// The per-address [`LeaseLock`] serialises all reads and writes of a cell
/// and its holder list; the inner mutexes only guard the data structures
/// themselves. Only the home server ever mutates the holder list.
pub struct MemoryManager {
    lo: Address,
    hi: Address,
    cells: Vec<Cell>,
}

impl MemoryManager {
    pub fn new(range: (Address, Address)) -> Self {
        let (lo, hi) = range;
        let seed = now_nanos();
        let cells = (lo..hi)
            .map(|_| Cell {
                lock: Arc::new(LeaseLock::new(seed)),
                item: Mutex::new(MemoryItem::empty(seed)),
                holders: Mutex::new(Vec::new()),
            })
            .collect();
        Self { lo, hi, cells }
    }

    pub fn range(&self) -> (Address, Address) {
        (self.lo, self.hi)
    }

    pub fn owns(&self, address: Address) -> bool {
        address >= self.lo && address < self.hi
    }

    fn cell(&self, address: Address) -> Result<&Cell, MemoryError> {
        if !self.owns(address) {
            return Err(MemoryError::NotOwned(address));
        }
        Ok(&self.cells[(address - self.lo) as usize])
    }

    /// Snapshot of the cell at `address`.
    pub async fn read(&self, address: Address) -> Result<MemoryItem, MemoryError> {
        Ok(self.cell(address)?.item.lock().await.clone())
    }

    /// Store `data` and bump the write tag. Returns the updated cell.
    pub async fn write(&self, address: Address, data: Value) -> Result<MemoryItem, MemoryError> {
        let mut item = self.cell(address)?.item.lock().await;
        item.data = data;
        item.wtag = item.wtag.wrapping_add(1);
        Ok(item.clone())
    }

    /// Take the advisory lock for `address`; with a lease, arm the timer
    /// that reclaims the lock if the holder never comes back. Returns the
    /// post-acquire `(ltag, wtag)`.
    pub async fn acquire_lock(
        &self,
        address: Address,
        lease: Option<Duration>,
    ) -> Result<(u64, u64), MemoryError> {
        let cell = self.cell(address)?;
        let ltag = cell.lock.acquire().await;
        if let Some(lease) = lease.filter(|l| !l.is_zero()) {
            LeaseLock::schedule_release(&cell.lock, ltag, lease);
        }
        let wtag = cell.item.lock().await.wtag;
        Ok((ltag, wtag))
    }

    /// Release the advisory lock if `expected` is still the current tag.
    /// Returns `(released, ltag, wtag)`; the write tag is snapshotted while
    /// the caller still holds the lock.
    pub async fn release_lock(
        &self,
        address: Address,
        expected: u64,
    ) -> Result<(bool, u64, u64), MemoryError> {
        let cell = self.cell(address)?;
        let wtag = cell.item.lock().await.wtag;
        let (released, ltag) = cell.lock.release(expected).await;
        Ok((released, ltag, wtag))
    }

    /// Ordered snapshot of the copy-holders of `address`.
    pub async fn copy_holders(&self, address: Address) -> Result<Vec<NetAddress>, MemoryError> {
        Ok(self.cell(address)?.holders.lock().await.clone())
    }

    /// Record `holder` as caching `address` (insertion-ordered, duplicates
    /// suppressed) and mark the cell shared.
    pub async fn add_copy_holder(
        &self,
        address: Address,
        holder: NetAddress,
    ) -> Result<(), MemoryError> {
        let cell = self.cell(address)?;
        {
            let mut holders = cell.holders.lock().await;
            if !holders.contains(&holder) {
                holders.push(holder);
            }
        }
        cell.item.lock().await.status = ItemStatus::Shared;
        Ok(())
    }

    /// Drop `holder` from the list; an emptied list flips the cell back to
    /// exclusive.
    pub async fn remove_copy_holder(
        &self,
        address: Address,
        holder: &NetAddress,
    ) -> Result<(), MemoryError> {
        let cell = self.cell(address)?;
        let emptied = {
            let mut holders = cell.holders.lock().await;
            holders.retain(|h| h != holder);
            holders.is_empty()
        };
        if emptied {
            cell.item.lock().await.status = ItemStatus::Exclusive;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cells_start_empty_and_exclusive() {
        let mm = MemoryManager::new((10, 20));
        assert!(mm.owns(10) && mm.owns(19));
        assert!(!mm.owns(9) && !mm.owns(20));

        let item = mm.read(15).await.unwrap();
        assert_eq!(item.data, Value::Null);
        assert_eq!(item.status, ItemStatus::Exclusive);
        assert!(mm.read(20).await.is_err());
    }

    #[tokio::test]
    async fn writes_bump_the_tag_strictly() {
        let mm = MemoryManager::new((0, 4));
        let before = mm.read(0).await.unwrap().wtag;
        let first = mm.write(0, Value::Int(1)).await.unwrap();
        let second = mm.write(0, Value::Int(2)).await.unwrap();
        assert_eq!(first.wtag, before + 1);
        assert_eq!(second.wtag, before + 2);
        assert_eq!(second.data, Value::Int(2));
    }

    #[tokio::test]
    async fn holders_dedupe_and_drive_status() {
        let mm = MemoryManager::new((0, 4));
        let peer1 = NetAddress::new("10.0.0.1", 6000);
        let peer2 = NetAddress::new("10.0.0.2", 6000);

        mm.add_copy_holder(1, peer1.clone()).await.unwrap();
        mm.add_copy_holder(1, peer2.clone()).await.unwrap();
        mm.add_copy_holder(1, peer1.clone()).await.unwrap();

        assert_eq!(
            mm.copy_holders(1).await.unwrap(),
            vec![peer1.clone(), peer2.clone()]
        );
        assert_eq!(mm.read(1).await.unwrap().status, ItemStatus::Shared);

        mm.remove_copy_holder(1, &peer1).await.unwrap();
        assert_eq!(mm.read(1).await.unwrap().status, ItemStatus::Shared);
        mm.remove_copy_holder(1, &peer2).await.unwrap();
        assert_eq!(mm.read(1).await.unwrap().status, ItemStatus::Exclusive);
        // Removing an absent holder is a no-op.
        mm.remove_copy_holder(1, &peer2).await.unwrap();
    }

    #[tokio::test]
    async fn lock_tags_pair_with_write_tags() {
        let mm = MemoryManager::new((0, 2));
        let (ltag, wtag) = mm.acquire_lock(0, None).await.unwrap();
        let written = mm.write(0, Value::Int(5)).await.unwrap();
        let (released, ltag2, wtag2) = mm.release_lock(0, ltag).await.unwrap();
        assert!(released);
        assert_eq!(ltag2, ltag + 1);
        assert_eq!(wtag2, wtag + 1);
        assert_eq!(written.wtag, wtag2);
    }

    #[tokio::test]
    async fn lease_frees_the_lock_for_the_next_acquirer() {
        let mm = MemoryManager::new((0, 1));
        let (ltag, _) = mm
            .acquire_lock(0, Some(Duration::from_millis(30)))
            .await
            .unwrap();
        // Holder vanishes; acquire blocks until the lease timer fires.
        let (ltag2, _) = mm.acquire_lock(0, None).await.unwrap();
        assert!(ltag2 > ltag);
        let (released, _, _) = mm.release_lock(0, ltag).await.unwrap();
        assert!(!released);
    }
}
