use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use passpool_catalog::PricingTable;
use passpool_core::model::{Group, RiderInterest, TripSnapshot, UserId};
use passpool_core::repository::{GroupStore, InterestChange, StoreError, TripPlan};
use passpool_shared::models::events::{ChangeReason, GroupDissolvedEvent, TripChangedEvent};
use passpool_shared::TripId;
use rand::Rng;
use tracing::{error, info, warn};

use crate::actions::{plan_action, GroupAction};
use crate::error::{GroupError, GroupResult};
use crate::metrics::RebalanceMetrics;
use crate::notifier::ChangeNotifier;
use crate::planner::shape_target;
use crate::reconcile::reconcile;

/// Retry budget for one trip operation
#[derive(Debug, Clone)]
pub struct RebalancePolicy {
    pub max_attempts: u32,
    /// Covers load, plan and commit of a single attempt
    pub attempt_timeout: Duration,
    /// Base delay between attempts, scaled by attempt number plus jitter
    pub backoff: Duration,
}

impl Default for RebalancePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(2),
            backoff: Duration::from_millis(25),
        }
    }
}

/// A change to one trip, run under that trip's lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TripCommand {
    Join(UserId),
    Leave(UserId),
    Rebalance,
    Act(UserId, GroupAction),
}

impl TripCommand {
    pub fn reason(&self) -> ChangeReason {
        match self {
            TripCommand::Join(_) => ChangeReason::Joined,
            TripCommand::Leave(_) => ChangeReason::Left,
            TripCommand::Rebalance => ChangeReason::Rebalanced,
            TripCommand::Act(_, action) => action.reason(),
        }
    }

    /// Join and leave are subject to the departure cutoff
    pub fn changes_membership(&self) -> bool {
        matches!(self, TripCommand::Join(_) | TripCommand::Leave(_))
    }

    /// After a timed-out attempt the commit may have landed anyway
    fn already_applied(&self, snapshot: &TripSnapshot) -> bool {
        match self {
            TripCommand::Join(user) => snapshot.interest(*user).is_some(),
            TripCommand::Leave(user) => snapshot.interest(*user).is_none(),
            TripCommand::Act(user, GroupAction::StepDown) => snapshot
                .group_of(*user)
                .is_some_and(|g| g.group.steward_id != Some(*user)),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutcome {
    /// Trip state after the command
    pub snapshot: TripSnapshot,
    pub committed: bool,
}

enum AttemptError {
    Conflict,
    Fatal(GroupError),
}

impl From<GroupError> for AttemptError {
    fn from(err: GroupError) -> Self {
        AttemptError::Fatal(err)
    }
}

impl From<StoreError> for AttemptError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { .. } => AttemptError::Conflict,
            other => AttemptError::Fatal(other.into()),
        }
    }
}

struct Planned {
    plan: TripPlan,
    dissolved: Vec<Group>,
}

/// Loads a trip, plans the next group state and commits it, retrying on conflicts
pub struct RebalanceCoordinator {
    store: Arc<dyn GroupStore>,
    pricing: PricingTable,
    policy: RebalancePolicy,
    notifier: ChangeNotifier,
    metrics: RebalanceMetrics,
}

impl RebalanceCoordinator {
    pub fn new(
        store: Arc<dyn GroupStore>,
        pricing: PricingTable,
        policy: RebalancePolicy,
        notifier: ChangeNotifier,
        metrics: RebalanceMetrics,
    ) -> Self {
        Self {
            store,
            pricing,
            policy,
            notifier,
            metrics,
        }
    }

    /// Run `command` to completion. The caller must hold the trip's lock.
    pub async fn run(&self, trip_id: &TripId, command: &TripCommand) -> GroupResult<CommandOutcome> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut uncertain = false;
        // groups the last commit sent to the store would dissolve
        let mut in_flight: Vec<Group> = Vec::new();

        for attempt in 1..=max_attempts {
            self.metrics.attempts.inc();

            let result = tokio::time::timeout(
                self.policy.attempt_timeout,
                self.attempt(trip_id, command, uncertain, &mut in_flight),
            )
            .await;

            match result {
                Ok(Ok(outcome)) => return Ok(outcome),
                Ok(Err(AttemptError::Fatal(e))) => return Err(e),
                Ok(Err(AttemptError::Conflict)) => {
                    in_flight.clear();
                    self.metrics.conflicts.inc();
                    warn!(trip = %trip_id, attempt, "Trip changed concurrently, retrying");
                }
                Err(_) => {
                    self.metrics.timeouts.inc();
                    uncertain = true;
                    warn!(
                        trip = %trip_id,
                        attempt,
                        timeout_ms = self.policy.attempt_timeout.as_millis() as u64,
                        "Rebalance attempt timed out"
                    );
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.backoff_delay(attempt)).await;
            }
        }

        self.metrics.exhausted.inc();
        warn!(trip = %trip_id, attempts = max_attempts, "Giving up on trip change");
        Err(GroupError::RebalanceConflict {
            attempts: max_attempts,
        })
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.policy.backoff.as_millis() as u64 * attempt as u64;
        let jitter = if base > 0 {
            rand::thread_rng().gen_range(0..=base)
        } else {
            0
        };
        Duration::from_millis(base + jitter)
    }

    async fn attempt(
        &self,
        trip_id: &TripId,
        command: &TripCommand,
        uncertain: bool,
        in_flight: &mut Vec<Group>,
    ) -> Result<CommandOutcome, AttemptError> {
        let snapshot = self.store.load_trip(trip_id).await?;

        if uncertain && command.already_applied(&snapshot) {
            info!(trip = %trip_id, version = snapshot.version, "Earlier timed-out attempt had committed");
            self.announce_landed(trip_id, command, snapshot.version, in_flight);
            return Ok(CommandOutcome {
                snapshot,
                committed: false,
            });
        }

        let now = Utc::now();
        let Planned { plan, dissolved } = self.plan(&snapshot, command, now)?;

        if plan.is_empty() {
            if uncertain {
                // nothing left to do, so the timed-out attempt's commit landed or was a no-op
                self.announce_landed(trip_id, command, snapshot.version, in_flight);
            }
            return Ok(CommandOutcome {
                snapshot,
                committed: false,
            });
        }

        if let TripCommand::Act(_, GroupAction::UploadPass { .. }) = command {
            for (group_id, hash) in plan.pass_hashes() {
                if self.store.pass_hash_in_use(hash, Some(group_id)).await? {
                    return Err(GroupError::DuplicatePass.into());
                }
            }
        }

        let projected = snapshot.apply(&plan).map_err(|e| {
            error!(trip = %trip_id, error = %e, "Planned trip state violates invariants");
            GroupError::from(e)
        })?;

        in_flight.clone_from(&dissolved);
        let version = self.store.commit(&plan).await?;
        in_flight.clear();
        self.metrics.commits.inc();

        self.announce_dissolved(trip_id, &dissolved, now);

        info!(
            trip = %trip_id,
            version,
            reason = ?command.reason(),
            groups = projected.groups.len(),
            riders = projected.interests.len(),
            "Committed trip change"
        );

        self.notifier.publish(TripChangedEvent {
            trip_id: trip_id.clone(),
            version,
            reason: command.reason(),
            changed_at: now.timestamp(),
        });

        let mut snapshot = projected;
        snapshot.version = version;
        Ok(CommandOutcome {
            snapshot,
            committed: true,
        })
    }

    /// Signals for a commit whose attempt was dropped by the timeout before it could publish
    fn announce_landed(
        &self,
        trip_id: &TripId,
        command: &TripCommand,
        version: i64,
        in_flight: &mut Vec<Group>,
    ) {
        let now = Utc::now();
        let dissolved = std::mem::take(in_flight);
        self.announce_dissolved(trip_id, &dissolved, now);
        self.notifier.publish(TripChangedEvent {
            trip_id: trip_id.clone(),
            version,
            reason: command.reason(),
            changed_at: now.timestamp(),
        });
    }

    fn announce_dissolved(&self, trip_id: &TripId, dissolved: &[Group], at: DateTime<Utc>) {
        for group in dissolved.iter().filter(|g| g.has_pass_proof()) {
            warn!(
                trip = %trip_id,
                group = group.number,
                group_id = %group.id,
                "Dissolved a group that had uploaded pass proof"
            );
            self.notifier.publish_dissolved(GroupDissolvedEvent {
                trip_id: trip_id.clone(),
                group_id: group.id,
                group_number: group.number,
                steward_id: group.steward_id,
                had_pass_proof: true,
                dissolved_at: at.timestamp(),
            });
        }
    }

    fn plan(
        &self,
        snapshot: &TripSnapshot,
        command: &TripCommand,
        now: DateTime<Utc>,
    ) -> GroupResult<Planned> {
        let mut plan = TripPlan::new(snapshot.trip_id.clone(), snapshot.version);

        let dissolved = match command {
            TripCommand::Join(user) => {
                if snapshot.interest(*user).is_some() {
                    return Err(GroupError::AlreadyJoined);
                }
                let interest = RiderInterest::new(snapshot.trip_id.clone(), *user, now);
                let mut interests = snapshot.interests.clone();
                interests.push(interest.clone());
                plan.interest_change = Some(InterestChange::Add(interest));
                self.regroup(snapshot, &interests, now, &mut plan)?
            }
            TripCommand::Leave(user) => {
                if snapshot.interest(*user).is_none() {
                    return Err(GroupError::NotJoined);
                }
                let interests: Vec<RiderInterest> = snapshot
                    .interests
                    .iter()
                    .filter(|i| i.user_id != *user)
                    .cloned()
                    .collect();
                plan.interest_change = Some(InterestChange::Remove(*user));
                self.regroup(snapshot, &interests, now, &mut plan)?
            }
            TripCommand::Rebalance => self.regroup(snapshot, &snapshot.interests, now, &mut plan)?,
            TripCommand::Act(user, action) => {
                plan = plan_action(snapshot, *user, action, now)?;
                Vec::new()
            }
        };

        Ok(Planned { plan, dissolved })
    }

    fn regroup(
        &self,
        snapshot: &TripSnapshot,
        interests: &[RiderInterest],
        now: DateTime<Utc>,
        plan: &mut TripPlan,
    ) -> GroupResult<Vec<Group>> {
        let target = shape_target(&snapshot.groups, interests);
        let reconciliation = reconcile(&snapshot.trip_id, &snapshot.groups, &target, &self.pricing, now)?;
        let dissolved = reconciliation.deleted_groups.clone();
        reconciliation.into_plan(plan);
        Ok(dissolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use futures_util::StreamExt;
    use passpool_core::events::EventSink;
    use passpool_core::model::GroupId;
    use passpool_core::repository::StoreResult;
    use passpool_store::memory::InMemoryStore;
    use prometheus::Registry;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use uuid::Uuid;

    fn trip() -> TripId {
        TripId::new("S 8", NaiveDate::from_ymd_opt(2026, 10, 25).unwrap())
    }

    fn coordinator(store: Arc<InMemoryStore>, policy: RebalancePolicy) -> (RebalanceCoordinator, RebalanceMetrics) {
        coordinator_with(store, ChangeNotifier::new(16), policy)
    }

    fn coordinator_with(
        store: Arc<dyn GroupStore>,
        notifier: ChangeNotifier,
        policy: RebalancePolicy,
    ) -> (RebalanceCoordinator, RebalanceMetrics) {
        let metrics = RebalanceMetrics::new(&Registry::new()).unwrap();
        let coordinator = RebalanceCoordinator::new(store, PricingTable::default(), policy, notifier, metrics.clone());
        (coordinator, metrics)
    }

    /// Lets the next commit land and then keeps the caller waiting past the attempt timeout
    #[derive(Default)]
    struct StallingStore {
        inner: InMemoryStore,
        stall: AtomicBool,
    }

    impl StallingStore {
        fn stall_next_commit(&self) {
            self.stall.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl GroupStore for StallingStore {
        async fn load_trip(&self, trip_id: &TripId) -> StoreResult<TripSnapshot> {
            self.inner.load_trip(trip_id).await
        }

        async fn commit(&self, plan: &TripPlan) -> StoreResult<i64> {
            let version = self.inner.commit(plan).await?;
            if self.stall.swap(false, Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            Ok(version)
        }

        async fn pass_hash_in_use(&self, ticket_hash: &str, except: Option<GroupId>) -> StoreResult<bool> {
            self.inner.pass_hash_in_use(ticket_hash, except).await
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        dissolved: Mutex<Vec<GroupDissolvedEvent>>,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        async fn trip_changed(
            &self,
            _event: &TripChangedEvent,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Ok(())
        }

        async fn group_dissolved(
            &self,
            event: &GroupDissolvedEvent,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.dissolved.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn fast_policy() -> RebalancePolicy {
        RebalancePolicy {
            max_attempts: 3,
            attempt_timeout: Duration::from_millis(200),
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_join_creates_solo_group() {
        let store = Arc::new(InMemoryStore::new());
        let (coordinator, metrics) = coordinator(store.clone(), fast_policy());
        let user = Uuid::new_v4();

        let outcome = coordinator.run(&trip(), &TripCommand::Join(user)).await.unwrap();

        assert!(outcome.committed);
        let view = outcome.snapshot.group_of(user).unwrap().view();
        assert_eq!(view.group_number, 1);
        assert_eq!(view.cost_per_person, PricingTable::default().cost_per_person(1).unwrap());
        assert_eq!(metrics.commits.get(), 1);
        assert_eq!(store.load_trip(&trip()).await.unwrap(), outcome.snapshot);
    }

    #[tokio::test]
    async fn test_rebalance_without_changes_is_idempotent() {
        let store = Arc::new(InMemoryStore::new());
        let (coordinator, metrics) = coordinator(store.clone(), fast_policy());
        for _ in 0..7 {
            coordinator.run(&trip(), &TripCommand::Join(Uuid::new_v4())).await.unwrap();
        }
        let before = store.load_trip(&trip()).await.unwrap();

        let first = coordinator.run(&trip(), &TripCommand::Rebalance).await.unwrap();
        let second = coordinator.run(&trip(), &TripCommand::Rebalance).await.unwrap();

        assert!(!first.committed);
        assert!(!second.committed);
        assert_eq!(store.load_trip(&trip()).await.unwrap(), before);
        assert_eq!(metrics.commits.get(), 7);
    }

    #[tokio::test]
    async fn test_conflicts_are_retried() {
        let store = Arc::new(InMemoryStore::new());
        store.fail_next_commits(2);
        let (coordinator, metrics) = coordinator(store.clone(), fast_policy());

        let outcome = coordinator.run(&trip(), &TripCommand::Join(Uuid::new_v4())).await.unwrap();

        assert!(outcome.committed);
        assert_eq!(metrics.conflicts.get(), 2);
        assert_eq!(metrics.attempts.get(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_roll_back_join() {
        let store = Arc::new(InMemoryStore::new());
        store.fail_next_commits(10);
        let (coordinator, metrics) = coordinator(store.clone(), fast_policy());
        let user = Uuid::new_v4();

        let result = coordinator.run(&trip(), &TripCommand::Join(user)).await;

        assert!(matches!(result, Err(GroupError::RebalanceConflict { attempts: 3 })));
        assert_eq!(metrics.exhausted.get(), 1);
        let snapshot = store.load_trip(&trip()).await.unwrap();
        assert!(snapshot.interest(user).is_none());
        assert!(snapshot.groups.is_empty());
    }

    #[tokio::test]
    async fn test_slow_store_times_out_then_recovers() {
        let store = Arc::new(InMemoryStore::new());
        store.delay_next_loads(1, Duration::from_millis(500));
        let (coordinator, metrics) = coordinator(store.clone(), fast_policy());

        let outcome = coordinator.run(&trip(), &TripCommand::Join(Uuid::new_v4())).await.unwrap();

        assert!(outcome.committed);
        assert_eq!(metrics.timeouts.get(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_join_and_unknown_leave() {
        let store = Arc::new(InMemoryStore::new());
        let (coordinator, _) = coordinator(store, fast_policy());
        let user = Uuid::new_v4();

        coordinator.run(&trip(), &TripCommand::Join(user)).await.unwrap();
        assert!(matches!(
            coordinator.run(&trip(), &TripCommand::Join(user)).await,
            Err(GroupError::AlreadyJoined)
        ));
        assert!(matches!(
            coordinator.run(&trip(), &TripCommand::Leave(Uuid::new_v4())).await,
            Err(GroupError::NotJoined)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_pass_across_trips() {
        let store = Arc::new(InMemoryStore::new());
        let (coordinator, _) = coordinator(store, fast_policy());
        let other_trip = TripId::new("S 9", NaiveDate::from_ymd_opt(2026, 10, 25).unwrap());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        coordinator.run(&trip(), &TripCommand::Join(a)).await.unwrap();
        coordinator.run(&other_trip, &TripCommand::Join(b)).await.unwrap();
        coordinator
            .run(&trip(), &TripCommand::Act(a, GroupAction::VolunteerSteward))
            .await
            .unwrap();
        coordinator
            .run(&other_trip, &TripCommand::Act(b, GroupAction::VolunteerSteward))
            .await
            .unwrap();

        let upload = |ticket: &str| GroupAction::UploadPass {
            ticket_id: ticket.to_string(),
            screenshot_ref: None,
        };
        coordinator
            .run(&trip(), &TripCommand::Act(a, upload("DB 4711")))
            .await
            .unwrap();

        let result = coordinator
            .run(&other_trip, &TripCommand::Act(b, upload("db4711")))
            .await;
        assert!(matches!(result, Err(GroupError::DuplicatePass)));
    }

    #[tokio::test]
    async fn test_commit_outliving_timeout_still_signals_change() {
        let store = Arc::new(StallingStore::default());
        let notifier = ChangeNotifier::new(16);
        let mut changes = Box::pin(notifier.subscribe(trip()));
        let (coordinator, metrics) = coordinator_with(store.clone(), notifier, fast_policy());
        let user = Uuid::new_v4();

        coordinator.run(&trip(), &TripCommand::Join(user)).await.unwrap();
        assert_eq!(changes.next().await.unwrap().reason, ChangeReason::Joined);

        store.stall_next_commit();
        let outcome = coordinator
            .run(&trip(), &TripCommand::Act(user, GroupAction::MarkPaid(true)))
            .await
            .unwrap();

        assert!(!outcome.committed);
        assert_eq!(metrics.timeouts.get(), 1);
        let membership = outcome.snapshot.group_of(user).unwrap().membership_of(user).unwrap();
        assert!(membership.payment_marked_sent_at.is_some());

        let signal = tokio::time::timeout(Duration::from_secs(1), changes.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(signal.reason, ChangeReason::MemberUpdated);
        assert_eq!(signal.version, outcome.snapshot.version);
    }

    #[tokio::test]
    async fn test_dissolve_outliving_timeout_still_reported() {
        let store = Arc::new(StallingStore::default());
        let sink = Arc::new(RecordingSink::default());
        let notifier = ChangeNotifier::new(16).with_sink(sink.clone());
        let mut changes = Box::pin(notifier.subscribe(trip()));
        let (coordinator, _) = coordinator_with(store.clone(), notifier, fast_policy());
        let steward = Uuid::new_v4();

        coordinator.run(&trip(), &TripCommand::Join(steward)).await.unwrap();
        coordinator
            .run(&trip(), &TripCommand::Act(steward, GroupAction::VolunteerSteward))
            .await
            .unwrap();
        let upload = GroupAction::UploadPass {
            ticket_id: "S8-2291".to_string(),
            screenshot_ref: None,
        };
        let with_pass = coordinator
            .run(&trip(), &TripCommand::Act(steward, upload))
            .await
            .unwrap();
        let group_id = with_pass.snapshot.groups[0].group.id;
        for _ in 0..3 {
            changes.next().await.unwrap();
        }

        store.stall_next_commit();
        let outcome = coordinator.run(&trip(), &TripCommand::Leave(steward)).await.unwrap();
        assert!(!outcome.committed);
        assert!(outcome.snapshot.groups.is_empty());

        let signal = tokio::time::timeout(Duration::from_secs(1), changes.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(signal.reason, ChangeReason::Left);

        let mut reported = Vec::new();
        for _ in 0..50 {
            reported = sink.dissolved.lock().unwrap().clone();
            if !reported.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].group_id, group_id);
        assert_eq!(reported[0].steward_id, Some(steward));
        assert!(reported[0].had_pass_proof);
    }
}
