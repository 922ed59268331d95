//! Direct-mapped cache of non-owned addresses.
//!
//! Slot index is `address mod CACHE_SIZE`; a write unconditionally evicts
//! whatever previously occupied the slot. Every field of a cached item comes
//! from a home server's cell; the cache never invents tags.

use super::item::MemoryItem;
use crate::types::Address;
use tokio::sync::Mutex;

struct Slot {
    address: Address,
    item: MemoryItem,
}

pub struct Cache {
    slots: Vec<Mutex<Option<Slot>>>,
}

impl Cache {
    pub fn new(size: usize) -> Self {
        Self {
            slots: (0..size).map(|_| Mutex::new(None)).collect(),
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, address: Address) -> &Mutex<Option<Slot>> {
        &self.slots[address.rem_euclid(self.slots.len() as i64) as usize]
    }

    /// The cached item for `address`, or `None` when the slot is empty or
    /// occupied by a colliding address.
    pub async fn read(&self, address: Address) -> Option<MemoryItem> {
        let slot = self.slot(address).lock().await;
        slot.as_ref()
            .filter(|s| s.address == address)
            .map(|s| s.item.clone())
    }

    /// Install `item` for `address`, evicting any prior occupant.
    pub async fn write(&self, address: Address, item: MemoryItem) {
        *self.slot(address).lock().await = Some(Slot { address, item });
    }

    /// Clear the slot if `address` occupies it.
    pub async fn remove(&self, address: Address) {
        let mut slot = self.slot(address).lock().await;
        if slot.as_ref().is_some_and(|s| s.address == address) {
            *slot = None;
        }
    }

    /// Snapshot of all occupied slots. Not atomic across slots.
    pub async fn dump(&self) -> Vec<(Address, MemoryItem)> {
        let mut entries = Vec::new();
        for slot in &self.slots {
            if let Some(s) = slot.lock().await.as_ref() {
                entries.push((s.address, s.item.clone()));
            }
        }
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ItemStatus, Value};

    fn item(v: i64, wtag: u64) -> MemoryItem {
        MemoryItem::new(Value::Int(v), ItemStatus::Shared, wtag)
    }

    #[tokio::test]
    async fn read_misses_on_empty_and_colliding_slots() {
        let cache = Cache::new(8);
        assert!(cache.read(3).await.is_none());

        cache.write(3, item(30, 1)).await;
        assert_eq!(cache.read(3).await.unwrap().data, Value::Int(30));
        // 11 maps to the same slot but is a different address.
        assert!(cache.read(11).await.is_none());
    }

    #[tokio::test]
    async fn collision_evicts_unconditionally() {
        let cache = Cache::new(8);
        cache.write(3, item(30, 1)).await;
        cache.write(11, item(110, 2)).await;
        assert!(cache.read(3).await.is_none());
        assert_eq!(cache.read(11).await.unwrap().data, Value::Int(110));
    }

    #[tokio::test]
    async fn remove_only_clears_a_matching_address() {
        let cache = Cache::new(4);
        cache.write(5, item(50, 1)).await;
        cache.remove(9).await; // same slot, different address
        assert!(cache.read(5).await.is_some());
        cache.remove(5).await;
        assert!(cache.read(5).await.is_none());
    }

    #[tokio::test]
    async fn dump_lists_occupied_slots() {
        let cache = Cache::new(8);
        cache.write(1, item(10, 1)).await;
        cache.write(6, item(60, 2)).await;
        let mut dump = cache.dump().await;
        dump.sort_by_key(|(a, _)| *a);
        assert_eq!(dump.len(), 2);
        assert_eq!(dump[0].0, 1);
        assert_eq!(dump[1].0, 6);
    }
}
