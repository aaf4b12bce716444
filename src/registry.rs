//! In-memory buyer directory with copy-on-write snapshots.
//!
//! Administrative writes clone the current state, mutate the clone, and
//! swap it in atomically. Auctions capture an `Arc<RegistrySnapshot>` at
//! entry and resolve eligibility against that frozen view, so a config
//! change mid-auction never produces a half-old, half-new candidate set.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::domain::{BuyerConfig, ZipEligibility};
use crate::error::{EngineError, Result};

/// Immutable view of buyers and ZIP entitlements at one point in time.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    buyers: BTreeMap<String, BuyerConfig>,
    /// service_type_id -> zip -> rows (one per buyer)
    eligibility: BTreeMap<String, BTreeMap<String, Vec<ZipEligibility>>>,
}

impl RegistrySnapshot {
    pub fn buyer(&self, buyer_id: &str) -> Option<&BuyerConfig> {
        self.buyers.get(buyer_id)
    }

    pub fn buyers(&self) -> impl Iterator<Item = &BuyerConfig> {
        self.buyers.values()
    }

    pub fn buyer_count(&self) -> usize {
        self.buyers.len()
    }

    /// Entitlement rows for an exact service/ZIP pair. No wildcard or
    /// prefix matching; "90210" never matches "9021".
    pub fn rows_for(&self, service_type_id: &str, zip: &str) -> &[ZipEligibility] {
        self.eligibility
            .get(service_type_id)
            .and_then(|by_zip| by_zip.get(zip))
            .map(|rows| rows.as_slice())
            .unwrap_or(&[])
    }

    pub fn eligibility_count(&self) -> usize {
        self.eligibility
            .values()
            .flat_map(|by_zip| by_zip.values())
            .map(|rows| rows.len())
            .sum()
    }
}

/// Mutable registry owned by the engine; auctions only ever see
/// snapshots taken through [`BuyerRegistry::snapshot`].
#[derive(Debug, Default)]
pub struct BuyerRegistry {
    state: RwLock<Arc<RegistrySnapshot>>,
}

impl BuyerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state as a cheap refcounted handle.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&self.read_guard())
    }

    /// Insert or replace a buyer. The config is validated first; a
    /// rejected config leaves the registry untouched.
    pub fn upsert_buyer(&self, buyer: BuyerConfig) -> Result<()> {
        if let Err(problems) = buyer.validate() {
            return Err(EngineError::InvalidBuyerConfig {
                buyer: buyer.buyer_id.clone(),
                reason: problems.join("; "),
            });
        }
        self.update(|state| {
            state.buyers.insert(buyer.buyer_id.clone(), buyer);
        });
        Ok(())
    }

    /// Remove a buyer and every entitlement row that references it.
    pub fn remove_buyer(&self, buyer_id: &str) -> bool {
        let mut removed = false;
        self.update(|state| {
            removed = state.buyers.remove(buyer_id).is_some();
            if removed {
                for by_zip in state.eligibility.values_mut() {
                    for rows in by_zip.values_mut() {
                        rows.retain(|row| row.buyer_id != buyer_id);
                    }
                }
            }
        });
        removed
    }

    pub fn set_buyer_active(&self, buyer_id: &str, active: bool) -> bool {
        let mut found = false;
        self.update(|state| {
            if let Some(buyer) = state.buyers.get_mut(buyer_id) {
                buyer.active = active;
                found = true;
            }
        });
        found
    }

    /// Insert or replace the row for the row's (buyer, service, zip)
    /// triple. At most one row per triple exists at a time.
    pub fn upsert_eligibility(&self, row: ZipEligibility) {
        self.update(|state| {
            let rows = state
                .eligibility
                .entry(row.service_type_id.clone())
                .or_default()
                .entry(row.zip.clone())
                .or_default();
            match rows.iter_mut().find(|r| r.buyer_id == row.buyer_id) {
                Some(existing) => *existing = row,
                None => rows.push(row),
            }
        });
    }

    pub fn remove_eligibility(&self, buyer_id: &str, service_type_id: &str, zip: &str) -> bool {
        let mut removed = false;
        self.update(|state| {
            if let Some(rows) = state
                .eligibility
                .get_mut(service_type_id)
                .and_then(|by_zip| by_zip.get_mut(zip))
            {
                let before = rows.len();
                rows.retain(|row| row.buyer_id != buyer_id);
                removed = rows.len() < before;
            }
        });
        removed
    }

    /// Bulk load, used when hydrating from the buyer directory file.
    pub fn register_all(
        &self,
        buyers: Vec<BuyerConfig>,
        eligibility: Vec<ZipEligibility>,
    ) -> Result<()> {
        for buyer in buyers {
            self.upsert_buyer(buyer)?;
        }
        for row in eligibility {
            self.upsert_eligibility(row);
        }
        Ok(())
    }

    fn update<F: FnOnce(&mut RegistrySnapshot)>(&self, mutate: F) {
        let mut guard = self
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut next = (**guard).clone();
        mutate(&mut next);
        *guard = Arc::new(next);
    }

    fn read_guard(&self) -> std::sync::RwLockReadGuard<'_, Arc<RegistrySnapshot>> {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
