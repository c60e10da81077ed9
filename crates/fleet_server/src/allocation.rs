//! # Allocation Selector
//!
//! Picks the instance of a role that should receive a new session, using the
//! self-reported [`ServerRecord`]s in the shared store.
//!
//! Load is consolidated onto warm (ALLOCATED) instances, lowest load first.
//! An instance whose projected load would reach the hard ceiling, or come
//! within the safety margin of it, is passed over in favour of the
//! least-loaded cold (READY) instance.

use fleet_core::{LifecycleState, ServerRecord, ServerRole, StoreError, StoreMap};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Capacity thresholds applied when choosing an instance.
///
/// The ceiling and the margin are independent settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationPolicy {
    /// Hard limit on used capacity units per instance
    pub capacity_ceiling: u64,
    /// Distance below the ceiling that already counts as full
    pub safety_margin: u64,
    /// Units one more session or resource is expected to add
    pub reservation_units: u64,
}

impl Default for AllocationPolicy {
    fn default() -> Self {
        Self {
            capacity_ceiling: 8192,
            safety_margin: 50,
            reservation_units: 1,
        }
    }
}

impl AllocationPolicy {
    /// Whether adding one reservation to `used` would meet the ceiling or
    /// enter the safety margin.
    pub fn would_overload(&self, used: u64) -> bool {
        let projected = used.saturating_add(self.reservation_units);
        projected >= self.capacity_ceiling
            || projected >= self.capacity_ceiling.saturating_sub(self.safety_margin)
    }
}

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("No capacity available for role {0}")]
    NoCapacityAvailable(ServerRole),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

fn least_loaded<'a>(
    candidates: &[&'a ServerRecord],
    state: LifecycleState,
) -> Option<&'a ServerRecord> {
    candidates
        .iter()
        .copied()
        .filter(|record| record.lifecycle_state == state)
        .min_by(|a, b| {
            a.used_capacity_units
                .cmp(&b.used_capacity_units)
                .then_with(|| a.id.cmp(&b.id))
        })
}

/// Chooses an instance of `role` among `records`.
pub fn select_from<'a, I>(
    records: I,
    role: ServerRole,
    policy: &AllocationPolicy,
) -> Result<ServerRecord, AllocationError>
where
    I: IntoIterator<Item = &'a ServerRecord>,
{
    let candidates: Vec<&ServerRecord> = records
        .into_iter()
        .filter(|record| record.role == role)
        .collect();

    let chosen = match least_loaded(&candidates, LifecycleState::Allocated) {
        Some(warm) if policy.would_overload(warm.used_capacity_units) => {
            debug!(
                "Instance {} is near capacity ({} units), looking for a ready instance",
                warm.id, warm.used_capacity_units
            );
            least_loaded(&candidates, LifecycleState::Ready)
        }
        Some(warm) => Some(warm),
        None => least_loaded(&candidates, LifecycleState::Ready),
    };

    match chosen {
        Some(record) => {
            debug!(
                "🎯 Selected {} for role {} ({} units used)",
                record.id, role, record.used_capacity_units
            );
            Ok(record.clone())
        }
        None => {
            warn!("No instance of role {} can take more load", role);
            Err(AllocationError::NoCapacityAvailable(role))
        }
    }
}

/// Store-backed selector over the fleet's server records.
#[derive(Debug, Clone)]
pub struct AllocationSelector {
    servers: StoreMap<String, ServerRecord>,
    policy: AllocationPolicy,
}

impl AllocationSelector {
    pub fn new(servers: StoreMap<String, ServerRecord>, policy: AllocationPolicy) -> Self {
        Self { servers, policy }
    }

    pub fn policy(&self) -> &AllocationPolicy {
        &self.policy
    }

    /// Blocking selection from the current server snapshot.
    pub fn select_instance(&self, role: ServerRole) -> Result<ServerRecord, AllocationError> {
        let records = self.servers.values()?;
        select_from(&records, role, &self.policy)
    }

    pub async fn select_instance_async(
        &self,
        role: ServerRole,
    ) -> Result<ServerRecord, AllocationError> {
        let records = self.servers.values_async().await?;
        select_from(&records, role, &self.policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, role: ServerRole, state: LifecycleState, used: u64) -> ServerRecord {
        ServerRecord {
            id: id.to_string(),
            role,
            lifecycle_state: state,
            used_capacity_units: used,
            current_session_count: 0,
        }
    }

    fn policy(ceiling: u64, margin: u64) -> AllocationPolicy {
        AllocationPolicy {
            capacity_ceiling: ceiling,
            safety_margin: margin,
            reservation_units: 1,
        }
    }

    #[test]
    fn test_prefers_least_loaded_allocated_instance() {
        let records = vec![
            record("a-1", ServerRole::Spawn, LifecycleState::Allocated, 10),
            record("a-2", ServerRole::Spawn, LifecycleState::Allocated, 195),
            record("a-3", ServerRole::Spawn, LifecycleState::Ready, 0),
        ];

        let chosen = select_from(&records, ServerRole::Spawn, &policy(200, 50)).unwrap();
        assert_eq!(chosen.id, "a-1");
        assert_eq!(chosen.used_capacity_units, 10);
    }

    #[test]
    fn test_no_instance_of_role() {
        let records = vec![record("a-1", ServerRole::Spawn, LifecycleState::Allocated, 10)];

        let err = select_from(&records, ServerRole::Limbo, &policy(200, 50)).unwrap_err();
        assert!(matches!(err, AllocationError::NoCapacityAvailable(ServerRole::Limbo)));
    }

    #[test]
    fn test_near_ceiling_spills_to_ready_instance() {
        let records = vec![
            record("w-1", ServerRole::WorldHost, LifecycleState::Allocated, 160),
            record("w-2", ServerRole::WorldHost, LifecycleState::Ready, 40),
            record("w-3", ServerRole::WorldHost, LifecycleState::Ready, 12),
        ];

        let chosen = select_from(&records, ServerRole::WorldHost, &policy(200, 50)).unwrap();
        assert_eq!(chosen.id, "w-3");
    }

    #[test]
    fn test_overloaded_without_ready_instance_fails() {
        let records = vec![record("w-1", ServerRole::WorldHost, LifecycleState::Allocated, 199)];

        assert!(matches!(
            select_from(&records, ServerRole::WorldHost, &policy(200, 50)),
            Err(AllocationError::NoCapacityAvailable(ServerRole::WorldHost))
        ));
    }

    #[test]
    fn test_ready_only_fleet() {
        let records = vec![
            record("s-2", ServerRole::Spawn, LifecycleState::Ready, 30),
            record("s-1", ServerRole::Spawn, LifecycleState::Ready, 30),
            record("s-3", ServerRole::Spawn, LifecycleState::Ready, 31),
        ];

        let chosen = select_from(&records, ServerRole::Spawn, &policy(200, 50)).unwrap();
        assert_eq!(chosen.id, "s-1");
    }

    #[test]
    fn test_thresholds_are_independent() {
        let no_margin = policy(200, 0);
        assert!(!no_margin.would_overload(198));
        assert!(no_margin.would_overload(199));

        let wide_margin = policy(200, 100);
        assert!(!wide_margin.would_overload(98));
        assert!(wide_margin.would_overload(99));

        let margin_past_ceiling = policy(40, 500);
        assert!(margin_past_ceiling.would_overload(0));
    }
}
