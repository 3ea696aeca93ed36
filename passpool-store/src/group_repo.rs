use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use passpool_core::model::{
    Coach, CoachLevel, Group, GroupId, GroupState, Membership, PassProof, RiderInterest, TripSnapshot,
};
use passpool_core::repository::{GroupStore, InterestChange, StoreError, StoreResult, TripPlan};
use passpool_core::schedule::{ScheduleLookup, TripStatus, TripWindow};
use passpool_core::CoreError;
use passpool_shared::{Masked, TripId};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

const TICKET_HASH_CONSTRAINT: &str = "pass_groups_ticket_hash_key";

pub struct PgGroupStore {
    pool: PgPool,
}

impl PgGroupStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct InterestRow {
    user_id: Uuid,
    joined_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct GroupRow {
    id: Uuid,
    group_number: i32,
    steward_id: Option<Uuid>,
    cost_per_person: i32,
    ticket_id: Option<String>,
    ticket_hash: Option<String>,
    activated_at: Option<DateTime<Utc>>,
    screenshot_ref: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct MembershipRow {
    id: Uuid,
    group_id: Uuid,
    user_id: Uuid,
    payment_marked_sent_at: Option<DateTime<Utc>>,
    coach_number: Option<i32>,
    coach_level: Option<String>,
    checked_in_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct TripRow {
    departs_at: DateTime<Utc>,
    status: String,
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn invalid(detail: String) -> StoreError {
    StoreError::Invalid(CoreError::ValidationError(detail))
}

/// A unique violation on the ticket hash means another group already holds the pass
fn write_error(e: sqlx::Error, ticket_hash: Option<&str>) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        if db.constraint() == Some(TICKET_HASH_CONSTRAINT) {
            return StoreError::DuplicatePass(ticket_hash.unwrap_or_default().to_string());
        }
    }
    backend(e)
}

impl GroupRow {
    fn into_group(self, trip_id: &TripId) -> StoreResult<Group> {
        let number = u32::try_from(self.group_number)
            .map_err(|_| invalid(format!("group {} has number {}", self.id, self.group_number)))?;

        let pass = match (self.ticket_id, self.ticket_hash, self.activated_at) {
            (Some(ticket_id), Some(ticket_hash), Some(activated_at)) => Some(PassProof {
                ticket_id: Masked::new(ticket_id),
                ticket_hash,
                activated_at,
                screenshot_ref: self.screenshot_ref,
            }),
            (None, None, None) => None,
            _ => return Err(invalid(format!("group {} has partial pass proof", self.id))),
        };

        Ok(Group {
            id: self.id,
            trip_id: trip_id.clone(),
            number,
            steward_id: self.steward_id,
            cost_per_person: self.cost_per_person,
            pass,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

impl MembershipRow {
    fn into_membership(self) -> StoreResult<Membership> {
        let coach = match (self.coach_number, self.coach_level) {
            (Some(number), Some(level)) => Some(Coach {
                number: u16::try_from(number)
                    .map_err(|_| invalid(format!("membership {} has coach {}", self.id, number)))?,
                level: CoachLevel::parse(&level)?,
            }),
            (None, None) => None,
            _ => return Err(invalid(format!("membership {} has partial coach", self.id))),
        };

        Ok(Membership {
            id: self.id,
            group_id: self.group_id,
            user_id: self.user_id,
            payment_marked_sent_at: self.payment_marked_sent_at,
            coach,
            checked_in_at: self.checked_in_at,
            created_at: self.created_at,
        })
    }
}

#[async_trait]
impl GroupStore for PgGroupStore {
    async fn load_trip(&self, trip_id: &TripId) -> StoreResult<TripSnapshot> {
        let service_ref = trip_id.service_ref.as_str();
        let service_date = trip_id.service_date;

        let mut tx = self.pool.begin().await.map_err(backend)?;
        // All four reads must see the same commit
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

        let version: Option<i64> = sqlx::query_scalar(
            "SELECT version FROM trip_versions WHERE service_ref = $1 AND service_date = $2",
        )
        .bind(service_ref)
        .bind(service_date)
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend)?;

        let interests: Vec<InterestRow> = sqlx::query_as(
            "SELECT user_id, joined_at FROM rider_interests WHERE service_ref = $1 AND service_date = $2",
        )
        .bind(service_ref)
        .bind(service_date)
        .fetch_all(&mut *tx)
        .await
        .map_err(backend)?;

        let groups: Vec<GroupRow> = sqlx::query_as(
            r#"
            SELECT id, group_number, steward_id, cost_per_person, ticket_id, ticket_hash,
                   activated_at, screenshot_ref, created_at, updated_at
            FROM pass_groups
            WHERE service_ref = $1 AND service_date = $2
            "#,
        )
        .bind(service_ref)
        .bind(service_date)
        .fetch_all(&mut *tx)
        .await
        .map_err(backend)?;

        let memberships: Vec<MembershipRow> = sqlx::query_as(
            r#"
            SELECT id, group_id, user_id, payment_marked_sent_at, coach_number, coach_level,
                   checked_in_at, created_at
            FROM memberships
            WHERE service_ref = $1 AND service_date = $2
            "#,
        )
        .bind(service_ref)
        .bind(service_date)
        .fetch_all(&mut *tx)
        .await
        .map_err(backend)?;

        tx.commit().await.map_err(backend)?;

        let mut states = groups
            .into_iter()
            .map(|row| {
                Ok(GroupState {
                    group: row.into_group(trip_id)?,
                    members: Vec::new(),
                })
            })
            .collect::<StoreResult<Vec<_>>>()?;

        for row in memberships {
            let membership = row.into_membership()?;
            let state = states
                .iter_mut()
                .find(|s| s.group.id == membership.group_id)
                .ok_or_else(|| invalid(format!("membership {} has no group", membership.id)))?;
            state.members.push(membership);
        }

        let mut snapshot = TripSnapshot {
            trip_id: trip_id.clone(),
            version: version.unwrap_or(0),
            interests: interests
                .into_iter()
                .map(|row| RiderInterest::new(trip_id.clone(), row.user_id, row.joined_at))
                .collect(),
            groups: states,
        };
        snapshot.normalize();
        Ok(snapshot)
    }

    async fn commit(&self, plan: &TripPlan) -> StoreResult<i64> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let version = bump_version(&mut tx, plan).await?;
        write_plan(&mut tx, plan).await?;

        // Deferred constraints fire here
        tx.commit()
            .await
            .map_err(|e| write_error(e, plan.pass_hashes().next().map(|(_, h)| h)))?;

        debug!(trip = %plan.trip_id, version, "Committed trip plan");
        Ok(version)
    }

    async fn pass_hash_in_use(&self, ticket_hash: &str, except: Option<GroupId>) -> StoreResult<bool> {
        let taken: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM pass_groups
                WHERE ticket_hash = $1 AND ($2::uuid IS NULL OR id <> $2)
            )
            "#,
        )
        .bind(ticket_hash)
        .bind(except)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;

        Ok(taken)
    }
}

#[async_trait]
impl ScheduleLookup for PgGroupStore {
    async fn trip_window(&self, trip_id: &TripId) -> StoreResult<Option<TripWindow>> {
        let row: Option<TripRow> = sqlx::query_as(
            "SELECT departs_at, status FROM trips WHERE service_ref = $1 AND service_date = $2",
        )
        .bind(trip_id.service_ref.as_str())
        .bind(trip_id.service_date)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.map(|row| {
            let status = TripStatus::parse(&row.status)
                .ok_or_else(|| invalid(format!("trip {} has status {}", trip_id, row.status)))?;
            Ok(TripWindow {
                departs_at: row.departs_at,
                status,
            })
        })
        .transpose()
    }
}

/// Move the trip from `expected_version` to the next one, or report a conflict.
///
/// The row lock taken by the update serializes concurrent committers on one trip.
async fn bump_version(tx: &mut Transaction<'_, Postgres>, plan: &TripPlan) -> StoreResult<i64> {
    let (service_ref, service_date) = trip_key(&plan.trip_id);

    sqlx::query(
        r#"
        INSERT INTO trip_versions (service_ref, service_date, version)
        VALUES ($1, $2, 0)
        ON CONFLICT (service_ref, service_date) DO NOTHING
        "#,
    )
    .bind(service_ref)
    .bind(service_date)
    .execute(&mut **tx)
    .await
    .map_err(backend)?;

    let next: Option<i64> = sqlx::query_scalar(
        r#"
        UPDATE trip_versions SET version = version + 1
        WHERE service_ref = $1 AND service_date = $2 AND version = $3
        RETURNING version
        "#,
    )
    .bind(service_ref)
    .bind(service_date)
    .bind(plan.expected_version)
    .fetch_optional(&mut **tx)
    .await
    .map_err(backend)?;

    next.ok_or_else(|| StoreError::Conflict {
        trip_id: plan.trip_id.clone(),
        expected: plan.expected_version,
    })
}

async fn write_plan(tx: &mut Transaction<'_, Postgres>, plan: &TripPlan) -> StoreResult<()> {
    let (service_ref, service_date) = trip_key(&plan.trip_id);
    let ticket_hash = plan.pass_hashes().next().map(|(_, h)| h);

    match &plan.interest_change {
        Some(InterestChange::Add(interest)) => {
            sqlx::query(
                "INSERT INTO rider_interests (service_ref, service_date, user_id, joined_at) VALUES ($1, $2, $3, $4)",
            )
            .bind(service_ref)
            .bind(service_date)
            .bind(interest.user_id)
            .bind(interest.joined_at)
            .execute(&mut **tx)
            .await
            .map_err(backend)?;
        }
        Some(InterestChange::Remove(user_id)) => {
            sqlx::query(
                "DELETE FROM rider_interests WHERE service_ref = $1 AND service_date = $2 AND user_id = $3",
            )
            .bind(service_ref)
            .bind(service_date)
            .bind(user_id)
            .execute(&mut **tx)
            .await
            .map_err(backend)?;
        }
        None => {}
    }

    if !plan.deleted_memberships.is_empty() {
        sqlx::query("DELETE FROM memberships WHERE id = ANY($1)")
            .bind(plan.deleted_memberships.as_slice())
            .execute(&mut **tx)
            .await
            .map_err(backend)?;
    }

    if !plan.deleted_groups.is_empty() {
        sqlx::query("DELETE FROM pass_groups WHERE id = ANY($1)")
            .bind(plan.deleted_groups.as_slice())
            .execute(&mut **tx)
            .await
            .map_err(backend)?;
    }

    for group in &plan.updated_groups {
        let pass = group.pass.as_ref();
        sqlx::query(
            r#"
            UPDATE pass_groups
            SET group_number = $2, steward_id = $3, cost_per_person = $4, ticket_id = $5,
                ticket_hash = $6, activated_at = $7, screenshot_ref = $8, updated_at = $9
            WHERE id = $1
            "#,
        )
        .bind(group.id)
        .bind(group.number as i32)
        .bind(group.steward_id)
        .bind(group.cost_per_person)
        .bind(pass.map(|p| p.ticket_id.expose().as_str()))
        .bind(pass.map(|p| p.ticket_hash.as_str()))
        .bind(pass.map(|p| p.activated_at))
        .bind(pass.and_then(|p| p.screenshot_ref.as_deref()))
        .bind(group.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| write_error(e, ticket_hash))?;
    }

    for group in &plan.created_groups {
        let pass = group.pass.as_ref();
        sqlx::query(
            r#"
            INSERT INTO pass_groups (id, service_ref, service_date, group_number, steward_id, cost_per_person,
                                     ticket_id, ticket_hash, activated_at, screenshot_ref, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(group.id)
        .bind(service_ref)
        .bind(service_date)
        .bind(group.number as i32)
        .bind(group.steward_id)
        .bind(group.cost_per_person)
        .bind(pass.map(|p| p.ticket_id.expose().as_str()))
        .bind(pass.map(|p| p.ticket_hash.as_str()))
        .bind(pass.map(|p| p.activated_at))
        .bind(pass.and_then(|p| p.screenshot_ref.as_deref()))
        .bind(group.created_at)
        .bind(group.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| write_error(e, ticket_hash))?;
    }

    for membership in &plan.created_memberships {
        sqlx::query(
            r#"
            INSERT INTO memberships (id, group_id, service_ref, service_date, user_id, payment_marked_sent_at,
                                     coach_number, coach_level, checked_in_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(membership.id)
        .bind(membership.group_id)
        .bind(service_ref)
        .bind(service_date)
        .bind(membership.user_id)
        .bind(membership.payment_marked_sent_at)
        .bind(membership.coach.map(|c| i32::from(c.number)))
        .bind(membership.coach.map(|c| c.level.as_str()))
        .bind(membership.checked_in_at)
        .bind(membership.created_at)
        .execute(&mut **tx)
        .await
        .map_err(backend)?;
    }

    for membership in &plan.updated_memberships {
        sqlx::query(
            r#"
            UPDATE memberships
            SET payment_marked_sent_at = $2, coach_number = $3, coach_level = $4, checked_in_at = $5
            WHERE id = $1
            "#,
        )
        .bind(membership.id)
        .bind(membership.payment_marked_sent_at)
        .bind(membership.coach.map(|c| i32::from(c.number)))
        .bind(membership.coach.map(|c| c.level.as_str()))
        .bind(membership.checked_in_at)
        .execute(&mut **tx)
        .await
        .map_err(backend)?;
    }

    Ok(())
}

fn trip_key(trip_id: &TripId) -> (&str, NaiveDate) {
    (trip_id.service_ref.as_str(), trip_id.service_date)
}
