//! In-memory inventory table for a single node.
//!
//! The store owns three pieces of state that always move together: the
//! quantity table, the version counter and the transaction log. They live behind
//! one `RwLock`, so a reader either sees a mutation completely or not at all.
//! Invariant: `log.len() == version` and `log[i].version == i + 1`.

use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use nanoid::nanoid;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{InventoryError, Result};

/// Marketplace catalog every node starts with unless seeding is disabled.
const SEED_CATALOG: &[(&str, &str, &[(&str, u64)])] = &[
    ("borivali", "Fresh_Mart", &[("apple", 50), ("banana", 30), ("milk", 25), ("bread", 20)]),
    ("borivali", "Daily_Needs", &[("rice", 100), ("oil", 20), ("sugar", 40), ("salt", 15)]),
    ("andheri", "Tech_Store", &[("laptop", 5), ("phone", 10), ("charger", 50), ("headphones", 25)]),
    ("andheri", "Food_Corner", &[("pizza", 15), ("burger", 20), ("fries", 25), ("coke", 30)]),
    ("goregaon", "Veggie_World", &[("tomato", 60), ("potato", 80), ("onion", 45), ("carrot", 35)]),
    ("goregaon", "Bakery_House", &[("bread", 40), ("cake", 8), ("cookies", 30), ("pastry", 12)]),
    ("bhayandar", "Farm_Fresh", &[("mango", 25), ("apple", 30), ("banana", 40), ("grapes", 20)]),
    ("bhayandar", "Kitchen_Needs", &[("spices", 50), ("salt", 25), ("sugar", 35), ("flour", 45)]),
];

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InventoryKey {
    pub area: String,
    pub shop: String,
    pub item: String,
}

impl InventoryKey {
    pub fn new(area: impl Into<String>, shop: impl Into<String>, item: impl Into<String>) -> Self {
        Self {
            area: area.into(),
            shop: shop.into(),
            item: item.into(),
        }
    }
}

impl fmt::Display for InventoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.area, self.shop, self.item)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    AddStock,
    Buy,
}

/// One applied mutation. The primary creates it; backups apply it verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionLogEntry {
    pub version: u64,
    pub operation: Operation,
    pub key: InventoryKey,
    pub delta: u64,
    pub timestamp_ms: u64,
    pub transaction_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub area: String,
    pub shop: String,
    pub item: String,
    pub quantity: u64,
}

/// Full copy of a store, used to resynchronize a backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u64,
    pub records: Vec<InventoryRecord>,
    pub log: Vec<TransactionLogEntry>,
}

/// Result of a locally originated mutation.
#[derive(Debug, Clone)]
pub struct Applied {
    pub quantity: u64,
    pub version: u64,
    pub entry: TransactionLogEntry,
}

/// Outcome of applying an entry received from the primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaApply {
    Applied { version: u64 },
    /// Already applied with the same transaction id; nothing changed.
    Duplicate { version: u64 },
    /// Entries between `local` and `received` are missing.
    Gap { local: u64, received: u64 },
}

#[derive(Default)]
struct StoreState {
    records: HashMap<InventoryKey, u64>,
    version: u64,
    log: Vec<TransactionLogEntry>,
}

impl StoreState {
    fn mutate(&mut self, operation: Operation, key: &InventoryKey, delta: u64) -> Result<u64> {
        match operation {
            Operation::AddStock => {
                let current = self.records.get(key).copied().unwrap_or(0);
                let next = current.checked_add(delta).ok_or_else(|| {
                    InventoryError::Validation(format!("quantity overflow for {key}"))
                })?;
                self.records.insert(key.clone(), next);
                Ok(next)
            }
            Operation::Buy => {
                let current = self
                    .records
                    .get_mut(key)
                    .ok_or_else(|| InventoryError::ItemNotFound(key.to_string()))?;
                if delta > *current {
                    return Err(InventoryError::InsufficientStock {
                        available: *current,
                        requested: delta,
                    });
                }
                *current -= delta;
                Ok(*current)
            }
        }
    }
}

#[derive(Default)]
pub struct InventoryStore {
    state: RwLock<StoreState>,
}

impl InventoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-filled with the marketplace catalog at version 0.
    pub fn seeded() -> Self {
        let records = SEED_CATALOG.iter().flat_map(|(area, shop, items)| {
            items
                .iter()
                .map(move |(item, quantity)| (InventoryKey::new(*area, *shop, *item), *quantity))
        });
        Self::from_records(records)
    }

    pub fn from_records(records: impl IntoIterator<Item = (InventoryKey, u64)>) -> Self {
        Self {
            state: RwLock::new(StoreState {
                records: records.into_iter().collect(),
                ..StoreState::default()
            }),
        }
    }

    /// Applies a locally originated mutation and assigns it the next version.
    ///
    /// A failed mutation leaves quantity, version and log untouched.
    pub fn apply(&self, operation: Operation, key: &InventoryKey, delta: u64) -> Result<Applied> {
        let mut state = self.state.write();
        let quantity = state.mutate(operation, key, delta)?;
        state.version += 1;
        let entry = TransactionLogEntry {
            version: state.version,
            operation,
            key: key.clone(),
            delta,
            timestamp_ms: now_millis(),
            transaction_id: nanoid!(16),
        };
        state.log.push(entry.clone());
        Ok(Applied {
            quantity,
            version: state.version,
            entry,
        })
    }

    /// Applies an entry authored by the primary, strictly in version order.
    pub fn apply_entry(&self, entry: &TransactionLogEntry) -> Result<ReplicaApply> {
        let mut state = self.state.write();
        if entry.version <= state.version {
            let index = (entry.version as usize).wrapping_sub(1);
            return match state.log.get(index) {
                Some(local) if local.transaction_id != entry.transaction_id => {
                    Err(InventoryError::Diverged {
                        version: entry.version,
                    })
                }
                _ => Ok(ReplicaApply::Duplicate {
                    version: state.version,
                }),
            };
        }
        if entry.version > state.version + 1 {
            return Ok(ReplicaApply::Gap {
                local: state.version,
                received: entry.version,
            });
        }

        // The primary already validated this mutation; failing here means our
        // table no longer matches the one it was validated against.
        if state.mutate(entry.operation, &entry.key, entry.delta).is_err() {
            return Err(InventoryError::Diverged {
                version: entry.version,
            });
        }
        state.version = entry.version;
        state.log.push(entry.clone());
        Ok(ReplicaApply::Applied {
            version: state.version,
        })
    }

    /// Returns `(quantity, version)` observed atomically.
    pub fn read(&self, key: &InventoryKey) -> Result<(u64, u64)> {
        let state = self.state.read();
        let quantity = state
            .records
            .get(key)
            .copied()
            .ok_or_else(|| InventoryError::ItemNotFound(key.to_string()))?;
        Ok((quantity, state.version))
    }

    /// In-stock records whose item name contains `query` (case-insensitive),
    /// together with the version they were read at.
    pub fn search(&self, query: &str) -> (Vec<InventoryRecord>, u64) {
        let needle = query.trim().to_lowercase();
        let state = self.state.read();
        let mut results: Vec<InventoryRecord> = state
            .records
            .iter()
            .filter(|(key, quantity)| **quantity > 0 && key.item.to_lowercase().contains(&needle))
            .map(|(key, quantity)| InventoryRecord {
                area: key.area.clone(),
                shop: key.shop.clone(),
                item: key.item.clone(),
                quantity: *quantity,
            })
            .collect();
        results.sort_by(|a, b| (&a.area, &a.shop, &a.item).cmp(&(&b.area, &b.shop, &b.item)));
        (results, state.version)
    }

    pub fn version(&self) -> u64 {
        self.state.read().version
    }

    pub fn transaction_count(&self) -> usize {
        self.state.read().log.len()
    }

    /// Log entries with a version greater than `version`, oldest first.
    pub fn entries_after(&self, version: u64) -> Vec<TransactionLogEntry> {
        let state = self.state.read();
        let start = (version as usize).min(state.log.len());
        state.log[start..].to_vec()
    }

    pub fn snapshot(&self) -> Snapshot {
        let state = self.state.read();
        let mut records: Vec<InventoryRecord> = state
            .records
            .iter()
            .map(|(key, quantity)| InventoryRecord {
                area: key.area.clone(),
                shop: key.shop.clone(),
                item: key.item.clone(),
                quantity: *quantity,
            })
            .collect();
        records.sort_by(|a, b| (&a.area, &a.shop, &a.item).cmp(&(&b.area, &b.shop, &b.item)));
        Snapshot {
            version: state.version,
            records,
            log: state.log.clone(),
        }
    }

    /// Replaces local state with `snapshot`.
    ///
    /// Without `force` a snapshot older than or equal to the local version is
    /// ignored. Returns whether the snapshot was installed.
    pub fn install_snapshot(&self, snapshot: Snapshot, force: bool) -> Result<bool> {
        if snapshot.log.len() as u64 != snapshot.version
            || snapshot
                .log
                .iter()
                .enumerate()
                .any(|(index, entry)| entry.version != index as u64 + 1)
        {
            return Err(InventoryError::Validation(format!(
                "snapshot log does not match version {}",
                snapshot.version
            )));
        }

        let mut state = self.state.write();
        if !force && snapshot.version <= state.version {
            return Ok(false);
        }
        state.records = snapshot
            .records
            .into_iter()
            .map(|record| {
                (
                    InventoryKey::new(record.area, record.shop, record.item),
                    record.quantity,
                )
            })
            .collect();
        state.version = snapshot.version;
        state.log = snapshot.log;
        Ok(true)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apple() -> InventoryKey {
        InventoryKey::new("borivali", "Fresh_Mart", "apple")
    }

    #[test]
    fn add_stock_increments_version_and_logs() {
        let store = InventoryStore::seeded();
        let applied = store.apply(Operation::AddStock, &apple(), 10).unwrap();
        assert_eq!(applied.quantity, 60);
        assert_eq!(applied.version, 1);
        assert_eq!(store.read(&apple()).unwrap(), (60, 1));
        assert_eq!(store.transaction_count(), 1);
        assert_eq!(applied.entry.version, 1);
    }

    #[test]
    fn add_stock_creates_missing_records() {
        let store = InventoryStore::new();
        let key = InventoryKey::new("dadar", "New_Shop", "kiwi");
        store.apply(Operation::AddStock, &key, 3).unwrap();
        assert_eq!(store.read(&key).unwrap(), (3, 1));
    }

    #[test]
    fn buy_rejects_underflow_without_side_effects() {
        let store = InventoryStore::from_records([(apple(), 10)]);
        let applied = store.apply(Operation::Buy, &apple(), 2).unwrap();
        assert_eq!((applied.quantity, applied.version), (8, 1));

        let err = store.apply(Operation::Buy, &apple(), 9).unwrap_err();
        assert_eq!(
            err,
            InventoryError::InsufficientStock {
                available: 8,
                requested: 9
            }
        );
        assert_eq!(store.read(&apple()).unwrap(), (8, 1));
        assert_eq!(store.transaction_count(), 1);
    }

    #[test]
    fn buy_unknown_item_fails() {
        let store = InventoryStore::seeded();
        let key = InventoryKey::new("borivali", "Fresh_Mart", "durian");
        assert!(matches!(
            store.apply(Operation::Buy, &key, 1),
            Err(InventoryError::ItemNotFound(_))
        ));
        assert_eq!(store.version(), 0);
    }

    #[test]
    fn search_matches_substrings_and_skips_empty_stock() {
        let store = InventoryStore::seeded();
        let (results, version) = store.search("APP");
        assert_eq!(version, 0);
        let shops: Vec<_> = results.iter().map(|r| r.shop.as_str()).collect();
        assert_eq!(shops, vec!["Farm_Fresh", "Fresh_Mart"]);

        let cake = InventoryKey::new("goregaon", "Bakery_House", "cake");
        store.apply(Operation::Buy, &cake, 8).unwrap();
        let (results, version) = store.search("cake");
        assert!(results.is_empty());
        assert_eq!(version, 1);
    }

    #[test]
    fn replicated_entries_apply_in_order_and_ignore_duplicates() {
        let primary = InventoryStore::seeded();
        let backup = InventoryStore::seeded();
        let first = primary.apply(Operation::AddStock, &apple(), 10).unwrap().entry;
        let second = primary.apply(Operation::Buy, &apple(), 5).unwrap().entry;

        assert_eq!(
            backup.apply_entry(&first).unwrap(),
            ReplicaApply::Applied { version: 1 }
        );
        assert_eq!(
            backup.apply_entry(&first).unwrap(),
            ReplicaApply::Duplicate { version: 1 }
        );
        assert_eq!(
            backup.apply_entry(&second).unwrap(),
            ReplicaApply::Applied { version: 2 }
        );
        assert_eq!(backup.read(&apple()).unwrap(), primary.read(&apple()).unwrap());
        assert_eq!(backup.snapshot(), primary.snapshot());
    }

    #[test]
    fn replicated_entry_past_the_next_version_reports_gap() {
        let primary = InventoryStore::seeded();
        let backup = InventoryStore::seeded();
        primary.apply(Operation::AddStock, &apple(), 1).unwrap();
        let third = {
            primary.apply(Operation::AddStock, &apple(), 1).unwrap();
            primary.apply(Operation::AddStock, &apple(), 1).unwrap().entry
        };
        assert_eq!(
            backup.apply_entry(&third).unwrap(),
            ReplicaApply::Gap {
                local: 0,
                received: 3
            }
        );
        assert_eq!(backup.version(), 0);

        for entry in primary.entries_after(backup.version()) {
            backup.apply_entry(&entry).unwrap();
        }
        assert_eq!(backup.version(), 3);
        assert_eq!(backup.read(&apple()).unwrap(), (53, 3));
    }

    #[test]
    fn conflicting_entry_at_applied_version_is_divergence() {
        let primary = InventoryStore::seeded();
        let backup = InventoryStore::seeded();
        let entry = primary.apply(Operation::AddStock, &apple(), 1).unwrap().entry;
        backup.apply(Operation::AddStock, &apple(), 7).unwrap();
        assert_eq!(
            backup.apply_entry(&entry).unwrap_err(),
            InventoryError::Diverged { version: 1 }
        );
    }

    #[test]
    fn snapshot_install_never_regresses_unless_forced() {
        let primary = InventoryStore::seeded();
        primary.apply(Operation::AddStock, &apple(), 10).unwrap();
        let snapshot = primary.snapshot();

        let backup = InventoryStore::seeded();
        assert!(backup.install_snapshot(snapshot.clone(), false).unwrap());
        assert_eq!(backup.read(&apple()).unwrap(), (60, 1));
        assert!(!backup.install_snapshot(snapshot.clone(), false).unwrap());

        backup.apply(Operation::AddStock, &apple(), 1).unwrap();
        backup.apply(Operation::AddStock, &apple(), 1).unwrap();
        assert!(backup.install_snapshot(snapshot, true).unwrap());
        assert_eq!(backup.read(&apple()).unwrap(), (60, 1));
        assert_eq!(backup.transaction_count(), 1);
    }

    #[test]
    fn malformed_snapshot_is_rejected() {
        let store = InventoryStore::new();
        let snapshot = Snapshot {
            version: 2,
            records: Vec::new(),
            log: Vec::new(),
        };
        assert!(matches!(
            store.install_snapshot(snapshot, true),
            Err(InventoryError::Validation(_))
        ));
    }
}
