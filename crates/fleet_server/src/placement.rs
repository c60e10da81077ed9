//! # Session Placement Orchestrator
//!
//! Runs on the waiting-room instances. Once per polling tick it looks at every
//! session held there and decides where that session belongs:
//!
//! - last routed from a world host and still owning a live resource: mark the
//!   session `TELEPORT_RESOURCE_HOME` and send a [`PlacementRequest`] to the
//!   chosen world host
//! - anything else: send a [`RedirectRequest`] to the default role
//!
//! The orchestrator only decides and notifies. Moving the session is the
//! destination's job. A per-session [`RetryWindow`] keeps a decision from
//! being re-issued while the previous one is still in flight.

use crate::allocation::{AllocationError, AllocationSelector};
use crate::redirect::TransferError;
use crate::retry::RetryWindow;
use fleet_core::{
    ChannelError, ChannelRegistry, PlacementRequest, PositionResolution, RedirectRequest,
    ServerRole, SessionId, SessionRecord, SharedState, StoreError,
};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Failures while deciding, routing or resolving a session's position.
#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Allocation error: {0}")]
    Allocation(#[from] AllocationError),

    #[error("No position resolver registered for {0:?}")]
    NoResolver(PositionResolution),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),
}

/// A session currently sitting in the waiting room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occupant {
    pub session_id: SessionId,
    pub display_name: String,
}

impl Occupant {
    pub fn new(session_id: SessionId, display_name: impl Into<String>) -> Self {
        Self {
            session_id,
            display_name: display_name.into(),
        }
    }
}

/// The game runtime's view of who is in the waiting room.
pub trait HoldingArea: Send + Sync {
    fn occupants(&self) -> Vec<Occupant>;
}

/// What was published for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementDecision {
    Placement(PlacementRequest),
    Redirect(RedirectRequest),
}

impl PlacementDecision {
    pub fn session_id(&self) -> SessionId {
        match self {
            PlacementDecision::Placement(request) => request.session_id,
            PlacementDecision::Redirect(request) => request.session_id,
        }
    }
}

/// Decides and announces where waiting sessions go next.
pub struct PlacementOrchestrator {
    state: SharedState,
    channels: ChannelRegistry,
    selector: AllocationSelector,
    retries: RetryWindow<SessionId>,
    default_role: ServerRole,
}

impl PlacementOrchestrator {
    pub fn new(
        state: SharedState,
        channels: ChannelRegistry,
        selector: AllocationSelector,
        retries: RetryWindow<SessionId>,
    ) -> Self {
        Self {
            state,
            channels,
            selector,
            retries,
            default_role: ServerRole::Spawn,
        }
    }

    /// Role that sessions without a better destination are sent to.
    pub fn with_default_role(mut self, role: ServerRole) -> Self {
        self.default_role = role;
        self
    }

    /// Records a session's first contact, or refreshes its display name.
    ///
    /// Concurrent first contacts for one session create a single record.
    pub async fn register_arrival(
        &self,
        session_id: SessionId,
        display_name: &str,
    ) -> Result<SessionRecord, PlacementError> {
        let sessions = self.state.sessions();
        let name = display_name.to_string();
        let mut record = sessions
            .compute_if_absent_async(session_id, move || {
                SessionRecord::first_contact(session_id, name)
            })
            .await?;

        if record.display_name != display_name {
            record.display_name = display_name.to_string();
            sessions.put_async(session_id, record.clone()).await?;
        }
        debug!("👋 {} ({}) entered the waiting room", display_name, session_id);
        Ok(record)
    }

    /// Decides where `session_id` goes and publishes the matching message.
    pub async fn decide(
        &self,
        session_id: SessionId,
        display_name: &str,
    ) -> Result<PlacementDecision, PlacementError> {
        let sessions = self.state.sessions();

        let Some(record) = sessions.get_async(session_id).await? else {
            warn!("No session record for {}, sending to {}", session_id, self.default_role);
            return self.redirect(session_id).await;
        };

        if record.last_server_role != ServerRole::WorldHost {
            return self.redirect(session_id).await;
        }
        let Some(resource_id) = record.resource_id else {
            return self.redirect(session_id).await;
        };
        if self.state.resources().get_async(resource_id).await?.is_none() {
            debug!("Resource {} of {} no longer exists", resource_id, session_id);
            return self.redirect(session_id).await;
        }

        let target = match self
            .selector
            .select_instance_async(record.last_server_role)
            .await
        {
            Ok(target) => target,
            Err(AllocationError::NoCapacityAvailable(role)) => {
                warn!("No {} instance can take {}, falling back", role, session_id);
                return self.redirect(session_id).await;
            }
            Err(e) => return Err(e.into()),
        };

        sessions
            .put_async(
                session_id,
                record.with_resolution(PositionResolution::TeleportResourceHome),
            )
            .await?;

        let request = PlacementRequest {
            target_instance_id: target.id,
            session_id,
            resource_id,
            display_name: display_name.to_string(),
            home: true,
        };
        self.channels.publish_async(request.clone()).await?;
        info!(
            "🏠 Placing {} in resource {} on {}",
            session_id, resource_id, request.target_instance_id
        );
        Ok(PlacementDecision::Placement(request))
    }

    async fn redirect(&self, session_id: SessionId) -> Result<PlacementDecision, PlacementError> {
        let request = RedirectRequest {
            session_id,
            target_role: self.default_role,
        };
        self.channels.publish_async(request.clone()).await?;
        info!("↪️ Redirecting {} to {}", session_id, self.default_role);
        Ok(PlacementDecision::Redirect(request))
    }

    /// Decides for every occupant outside its retry window.
    pub async fn tick(&self, occupants: Vec<Occupant>) -> Vec<PlacementDecision> {
        let due: Vec<Occupant> = occupants
            .into_iter()
            .filter(|occupant| self.retries.try_acquire(&occupant.session_id))
            .collect();
        if due.is_empty() {
            return Vec::new();
        }

        let outcomes = join_all(
            due.iter()
                .map(|occupant| self.decide(occupant.session_id, &occupant.display_name)),
        )
        .await;

        due.iter()
            .zip(outcomes)
            .filter_map(|(occupant, outcome)| match outcome {
                Ok(decision) => Some(decision),
                Err(e) => {
                    error!("❌ Placement decision for {} failed: {}", occupant.session_id, e);
                    None
                }
            })
            .collect()
    }

    /// Spawns the polling loop over `holding`.
    pub fn run(self: Arc<Self>, holding: Arc<dyn HoldingArea>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let decisions = self.tick(holding.occupants()).await;
                if !decisions.is_empty() {
                    debug!("Issued {} placement decision(s)", decisions.len());
                }
            }
        })
    }
}
