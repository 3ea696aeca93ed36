use std::sync::Arc;

use chrono::Utc;
use futures_util::Stream;
use passpool_core::model::{Coach, GroupState, GroupView, UserId};
use passpool_core::repository::GroupStore;
use passpool_core::schedule::{NotJoinableReason, ScheduleLookup};
use passpool_shared::models::events::TripChangedEvent;
use passpool_shared::TripId;
use tracing::{debug, instrument};

use crate::actions::GroupAction;
use crate::coordinator::{CommandOutcome, RebalanceCoordinator, TripCommand};
use crate::error::{GroupError, GroupResult};
use crate::lock::TripLocks;
use crate::notifier::ChangeNotifier;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Join and leave close this long before departure
    pub cutoff: chrono::Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            cutoff: chrono::Duration::minutes(10),
        }
    }
}

/// Entry point for everything a rider does on a trip.
///
/// Mutating operations for one trip run one at a time; different trips run in
/// parallel. Each operation runs on its own task, so a caller that goes away does
/// not abort a rebalance halfway.
#[derive(Clone)]
pub struct TripGateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    coordinator: RebalanceCoordinator,
    store: Arc<dyn GroupStore>,
    schedule: Arc<dyn ScheduleLookup>,
    notifier: ChangeNotifier,
    locks: TripLocks,
    config: GatewayConfig,
}

impl TripGateway {
    pub fn new(
        coordinator: RebalanceCoordinator,
        store: Arc<dyn GroupStore>,
        schedule: Arc<dyn ScheduleLookup>,
        notifier: ChangeNotifier,
        config: GatewayConfig,
    ) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                coordinator,
                store,
                schedule,
                notifier,
                locks: TripLocks::new(),
                config,
            }),
        }
    }

    /// Register interest in a trip and return the group the rider lands in
    #[instrument(skip(self), fields(trip = %trip_id))]
    pub async fn join(&self, trip_id: TripId, user_id: UserId) -> GroupResult<GroupView> {
        let outcome = self.serialized(trip_id, TripCommand::Join(user_id)).await?;
        own_group(&outcome, user_id)
    }

    #[instrument(skip(self), fields(trip = %trip_id))]
    pub async fn leave(&self, trip_id: TripId, user_id: UserId) -> GroupResult<()> {
        self.serialized(trip_id, TripCommand::Leave(user_id)).await?;
        Ok(())
    }

    /// Recompute groups without a membership change, e.g. after a repair
    pub async fn rebalance(&self, trip_id: TripId) -> GroupResult<Vec<GroupView>> {
        let outcome = self.serialized(trip_id, TripCommand::Rebalance).await?;
        Ok(outcome.snapshot.views())
    }

    /// Current groups of a trip, for clients refreshing after a change signal
    pub async fn groups(&self, trip_id: &TripId) -> GroupResult<Vec<GroupView>> {
        let snapshot = self.inner.store.load_trip(trip_id).await?;
        Ok(snapshot.views())
    }

    pub async fn my_group(&self, trip_id: &TripId, user_id: UserId) -> GroupResult<GroupView> {
        let snapshot = self.inner.store.load_trip(trip_id).await?;
        snapshot
            .group_of(user_id)
            .map(GroupState::view)
            .ok_or(GroupError::NotJoined)
    }

    pub async fn volunteer_steward(&self, trip_id: TripId, user_id: UserId) -> GroupResult<GroupView> {
        self.act(trip_id, user_id, GroupAction::VolunteerSteward).await
    }

    pub async fn step_down(&self, trip_id: TripId, user_id: UserId) -> GroupResult<GroupView> {
        self.act(trip_id, user_id, GroupAction::StepDown).await
    }

    pub async fn upload_pass(
        &self,
        trip_id: TripId,
        user_id: UserId,
        ticket_id: String,
        screenshot_ref: Option<String>,
    ) -> GroupResult<GroupView> {
        self.act(
            trip_id,
            user_id,
            GroupAction::UploadPass {
                ticket_id,
                screenshot_ref,
            },
        )
        .await
    }

    pub async fn mark_paid(&self, trip_id: TripId, user_id: UserId, sent: bool) -> GroupResult<GroupView> {
        self.act(trip_id, user_id, GroupAction::MarkPaid(sent)).await
    }

    pub async fn set_coach(
        &self,
        trip_id: TripId,
        user_id: UserId,
        coach: Option<Coach>,
    ) -> GroupResult<GroupView> {
        self.act(trip_id, user_id, GroupAction::SetCoach(coach)).await
    }

    pub async fn check_in(&self, trip_id: TripId, user_id: UserId) -> GroupResult<GroupView> {
        self.act(trip_id, user_id, GroupAction::CheckIn).await
    }

    /// Change signals for `trip_id`
    pub fn subscribe(&self, trip_id: TripId) -> impl Stream<Item = TripChangedEvent> + Send + 'static {
        self.inner.notifier.subscribe(trip_id)
    }

    async fn act(&self, trip_id: TripId, user_id: UserId, action: GroupAction) -> GroupResult<GroupView> {
        let outcome = self.serialized(trip_id, TripCommand::Act(user_id, action)).await?;
        own_group(&outcome, user_id)
    }

    async fn serialized(&self, trip_id: TripId, command: TripCommand) -> GroupResult<CommandOutcome> {
        let inner = self.inner.clone();
        let task = tokio::spawn(async move { inner.execute(trip_id, command).await });
        task.await
            .map_err(|e| GroupError::Internal(format!("trip task failed: {}", e)))?
    }
}

impl GatewayInner {
    async fn execute(&self, trip_id: TripId, command: TripCommand) -> GroupResult<CommandOutcome> {
        let _guard = self.locks.acquire(&trip_id).await;
        debug!(trip = %trip_id, command = ?command, "Acquired trip lock");

        // a rider with nothing to leave hears that before any cutoff
        if let TripCommand::Leave(user_id) = command {
            let snapshot = self.store.load_trip(&trip_id).await?;
            if snapshot.interest(user_id).is_none() {
                return Err(GroupError::NotJoined);
            }
        }

        if command.changes_membership() {
            self.check_joinable(&trip_id).await?;
        }

        self.coordinator.run(&trip_id, &command).await
    }

    async fn check_joinable(&self, trip_id: &TripId) -> GroupResult<()> {
        let window = self
            .schedule
            .trip_window(trip_id)
            .await?
            .ok_or(GroupError::TripNotJoinable(NotJoinableReason::UnknownTrip))?;

        window
            .check_joinable(Utc::now(), self.config.cutoff)
            .map_err(GroupError::TripNotJoinable)
    }
}

fn own_group(outcome: &CommandOutcome, user_id: UserId) -> GroupResult<GroupView> {
    outcome
        .snapshot
        .group_of(user_id)
        .map(GroupState::view)
        .ok_or_else(|| GroupError::Internal(format!("rider {} has no group after commit", user_id)))
}
