//! Named device groups and the membership oracle the dispatcher consults.
//!
//! Fleets live in process memory. The dispatcher only ever sees the
//! read-only [`FleetDirectory`] view and snapshots membership once per
//! fan-out; concurrent edits affect later dispatches, not in-flight ones.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Read side consumed by the dispatcher when expanding a group dispatch.
pub trait FleetDirectory: Send + Sync + 'static {
    /// Membership snapshot, or `None` when the fleet does not exist.
    fn members_of(&self, fleet_id: &str) -> Option<Vec<String>>;
}

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("fleet not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct Fleet {
    pub fleet_id: String,
    pub name: String,
    pub members: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Default)]
pub struct FleetStore {
    fleets: Arc<DashMap<String, Fleet>>,
}

impl FleetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, name: &str, members: Vec<String>) -> Fleet {
        let now = Utc::now();
        let fleet = Fleet {
            fleet_id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            members: members.into_iter().collect(),
            created_at: now,
            updated_at: now,
        };
        self.fleets.insert(fleet.fleet_id.clone(), fleet.clone());
        fleet
    }

    pub fn get(&self, fleet_id: &str) -> Option<Fleet> {
        self.fleets.get(fleet_id).map(|entry| entry.value().clone())
    }

    pub fn list(&self) -> Vec<Fleet> {
        let mut fleets: Vec<Fleet> = self
            .fleets
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        fleets.sort_by(|a, b| a.name.cmp(&b.name));
        fleets
    }

    pub fn delete(&self, fleet_id: &str) -> bool {
        self.fleets.remove(fleet_id).is_some()
    }

    /// Replace the member set wholesale.
    pub fn set_members(&self, fleet_id: &str, members: Vec<String>) -> Result<Fleet, FleetError> {
        self.update(fleet_id, |fleet| {
            fleet.members = members.iter().cloned().collect();
        })
    }

    pub fn add_members(&self, fleet_id: &str, members: Vec<String>) -> Result<Fleet, FleetError> {
        self.update(fleet_id, |fleet| {
            fleet.members.extend(members.iter().cloned());
        })
    }

    pub fn remove_member(&self, fleet_id: &str, device_id: &str) -> Result<Fleet, FleetError> {
        self.update(fleet_id, |fleet| {
            fleet.members.remove(device_id);
        })
    }

    fn update(
        &self,
        fleet_id: &str,
        apply: impl FnOnce(&mut Fleet),
    ) -> Result<Fleet, FleetError> {
        let mut entry = self
            .fleets
            .get_mut(fleet_id)
            .ok_or_else(|| FleetError::NotFound(fleet_id.to_string()))?;
        apply(entry.value_mut());
        entry.updated_at = Utc::now();
        Ok(entry.value().clone())
    }
}

impl FleetDirectory for FleetStore {
    fn members_of(&self, fleet_id: &str) -> Option<Vec<String>> {
        self.fleets
            .get(fleet_id)
            .map(|entry| entry.members.iter().cloned().collect())
    }
}
