// Postgres storage backends

use async_trait::async_trait;
use autoflow_shared::{
    Action, Automation, AutomationRun, ContactId, DailyMetric, Platform, RunStatus, Trigger, TriggerType,
};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{types::Json, FromRow, PgPool};
use uuid::Uuid;

use super::{AutomationRepository, MetricDelta, MetricsStore, RunQueue};
use crate::error::{EngineError, EngineResult};

const AUTOMATION_COLUMNS: &str = r#"
    id, owner_id, name, trigger_type, trigger_config, actions,
    is_active, last_triggered_at, created_at, updated_at
"#;

const WEBHOOK_TOKEN_INDEX: &str = "idx_automations_webhook_token";

/// A concurrent writer can claim a webhook token between the registry's
/// lookup and this write; the unique index has the final word.
fn automation_write_error(err: sqlx::Error) -> EngineError {
    if let Some(db_err) = err.as_database_error() {
        if db_err.code().as_deref() == Some("23505") && db_err.constraint() == Some(WEBHOOK_TOKEN_INDEX) {
            return EngineError::validation("trigger_config.token", "webhook token is already in use");
        }
    }
    err.into()
}

const RUN_COLUMNS: &str = r#"
    id, automation_id, owner_id, contact_id, platform, status,
    remaining_actions, delay_served, context, actions_completed,
    run_at, locked_until, error_message, started_at, completed_at
"#;

#[derive(Debug, FromRow)]
struct AutomationRow {
    id: Uuid,
    owner_id: Uuid,
    name: String,
    trigger_type: String,
    trigger_config: serde_json::Value,
    actions: serde_json::Value,
    is_active: bool,
    last_triggered_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
}

impl TryFrom<AutomationRow> for Automation {
    type Error = EngineError;

    fn try_from(row: AutomationRow) -> Result<Self, Self::Error> {
        let trigger: Trigger = serde_json::from_value(serde_json::json!({
            "trigger_type": row.trigger_type,
            "trigger_config": row.trigger_config,
        }))
        .map_err(|e| corrupt("automation", row.id, e))?;
        let actions: Vec<Action> =
            serde_json::from_value(row.actions).map_err(|e| corrupt("automation", row.id, e))?;

        Ok(Automation {
            id: row.id,
            owner_id: row.owner_id,
            name: row.name,
            trigger,
            actions,
            is_active: row.is_active,
            last_triggered_at: row.last_triggered_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn corrupt(what: &str, id: Uuid, err: impl std::fmt::Display) -> EngineError {
    EngineError::TransientInfra(format!("stored {} {} is unreadable: {}", what, id, err))
}

/// Config JSON without the `trigger_type` tag.
fn trigger_config(trigger: &Trigger) -> serde_json::Value {
    match trigger {
        Trigger::Keyword(config) => serde_json::json!(config),
        Trigger::Schedule(config) => serde_json::json!(config),
        Trigger::Webhook(config) => serde_json::json!(config),
    }
}

fn collect_automations(rows: Vec<AutomationRow>) -> EngineResult<Vec<Automation>> {
    rows.into_iter().map(Automation::try_from).collect()
}

pub struct PgAutomationRepository {
    db_pool: PgPool,
}

impl PgAutomationRepository {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl AutomationRepository for PgAutomationRepository {
    async fn insert(&self, automation: &Automation) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO automations
                (id, owner_id, name, trigger_type, trigger_config, actions, is_active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(automation.id)
        .bind(automation.owner_id)
        .bind(&automation.name)
        .bind(automation.trigger.trigger_type().as_str())
        .bind(trigger_config(&automation.trigger))
        .bind(Json(&automation.actions))
        .bind(automation.is_active)
        .bind(automation.created_at)
        .execute(&self.db_pool)
        .await
        .map_err(automation_write_error)?;

        Ok(())
    }

    async fn update(&self, automation: &Automation) -> EngineResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE automations
            SET name = $2, trigger_type = $3, trigger_config = $4, actions = $5,
                is_active = $6, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(automation.id)
        .bind(&automation.name)
        .bind(automation.trigger.trigger_type().as_str())
        .bind(trigger_config(&automation.trigger))
        .bind(Json(&automation.actions))
        .bind(automation.is_active)
        .bind(automation.updated_at)
        .execute(&self.db_pool)
        .await
        .map_err(automation_write_error)?;

        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound("Automation".to_string()));
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> EngineResult<Option<Automation>> {
        let row = sqlx::query_as::<_, AutomationRow>(&format!(
            "SELECT {} FROM automations WHERE id = $1",
            AUTOMATION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.db_pool)
        .await?;

        row.map(Automation::try_from).transpose()
    }

    async fn list(&self, owner_id: Uuid) -> EngineResult<Vec<Automation>> {
        let rows = sqlx::query_as::<_, AutomationRow>(&format!(
            "SELECT {} FROM automations WHERE owner_id = $1 ORDER BY seq ASC",
            AUTOMATION_COLUMNS
        ))
        .bind(owner_id)
        .fetch_all(&self.db_pool)
        .await?;

        collect_automations(rows)
    }

    async fn list_active(&self, owner_id: Uuid) -> EngineResult<Vec<Automation>> {
        let rows = sqlx::query_as::<_, AutomationRow>(&format!(
            "SELECT {} FROM automations WHERE owner_id = $1 AND is_active = true ORDER BY seq ASC",
            AUTOMATION_COLUMNS
        ))
        .bind(owner_id)
        .fetch_all(&self.db_pool)
        .await?;

        collect_automations(rows)
    }

    async fn list_active_by_trigger(&self, trigger_type: TriggerType) -> EngineResult<Vec<Automation>> {
        let rows = sqlx::query_as::<_, AutomationRow>(&format!(
            "SELECT {} FROM automations WHERE trigger_type = $1 AND is_active = true ORDER BY seq ASC",
            AUTOMATION_COLUMNS
        ))
        .bind(trigger_type.as_str())
        .fetch_all(&self.db_pool)
        .await?;

        collect_automations(rows)
    }

    async fn find_webhook(&self, token: &str) -> EngineResult<Option<Automation>> {
        let row = sqlx::query_as::<_, AutomationRow>(&format!(
            "SELECT {} FROM automations WHERE trigger_type = 'webhook' AND trigger_config->>'token' = $1",
            AUTOMATION_COLUMNS
        ))
        .bind(token)
        .fetch_optional(&self.db_pool)
        .await?;

        row.map(Automation::try_from).transpose()
    }

    async fn mark_triggered(&self, id: Uuid, at: DateTime<Utc>) -> EngineResult<()> {
        sqlx::query("UPDATE automations SET last_triggered_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.db_pool)
            .await?;
        Ok(())
    }
}

pub struct PgMetricsStore {
    db_pool: PgPool,
}

impl PgMetricsStore {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl MetricsStore for PgMetricsStore {
    async fn increment(&self, automation_id: Uuid, date: NaiveDate, delta: MetricDelta) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO automation_metrics (automation_id, date, triggers_count, messages_sent)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (automation_id, date) DO UPDATE SET
                triggers_count = automation_metrics.triggers_count + EXCLUDED.triggers_count,
                messages_sent = automation_metrics.messages_sent + EXCLUDED.messages_sent
            "#,
        )
        .bind(automation_id)
        .bind(date)
        .bind(delta.triggers)
        .bind(delta.messages)
        .execute(&self.db_pool)
        .await?;

        Ok(())
    }

    async fn add_contact(&self, automation_id: Uuid, date: NaiveDate, contact_id: ContactId) -> EngineResult<bool> {
        let mut tx = self.db_pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO automation_metric_contacts (automation_id, date, contact_id)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(automation_id)
        .bind(date)
        .bind(contact_id)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if inserted {
            sqlx::query(
                r#"
                INSERT INTO automation_metrics (automation_id, date, unique_contacts)
                VALUES ($1, $2, 1)
                ON CONFLICT (automation_id, date) DO UPDATE SET
                    unique_contacts = automation_metrics.unique_contacts + 1
                "#,
            )
            .bind(automation_id)
            .bind(date)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn set_conversion_rate(&self, automation_id: Uuid, date: NaiveDate, rate: f64) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO automation_metrics (automation_id, date, conversion_rate)
            VALUES ($1, $2, $3)
            ON CONFLICT (automation_id, date) DO UPDATE SET conversion_rate = EXCLUDED.conversion_rate
            "#,
        )
        .bind(automation_id)
        .bind(date)
        .bind(rate)
        .execute(&self.db_pool)
        .await?;

        Ok(())
    }

    async fn fetch(&self, automation_id: Uuid, start: NaiveDate, end: NaiveDate) -> EngineResult<Vec<DailyMetric>> {
        let rows = sqlx::query_as::<_, DailyMetric>(
            r#"
            SELECT date, triggers_count, messages_sent, unique_contacts, conversion_rate
            FROM automation_metrics
            WHERE automation_id = $1 AND date BETWEEN $2 AND $3
            ORDER BY date ASC
            "#,
        )
        .bind(automation_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.db_pool)
        .await?;

        Ok(rows)
    }
}

#[derive(Debug, FromRow)]
struct RunRow {
    id: Uuid,
    automation_id: Uuid,
    owner_id: Uuid,
    contact_id: i64,
    platform: String,
    status: String,
    remaining_actions: serde_json::Value,
    delay_served: bool,
    context: serde_json::Value,
    actions_completed: i32,
    run_at: DateTime<Utc>,
    locked_until: Option<DateTime<Utc>>,
    error_message: Option<String>,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<RunRow> for AutomationRun {
    type Error = EngineError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        let platform: Platform = row.platform.parse().map_err(|e| corrupt("run", row.id, e))?;
        let status: RunStatus = row.status.parse().map_err(|e| corrupt("run", row.id, e))?;
        let remaining_actions: Vec<Action> =
            serde_json::from_value(row.remaining_actions).map_err(|e| corrupt("run", row.id, e))?;

        Ok(AutomationRun {
            id: row.id,
            automation_id: row.automation_id,
            owner_id: row.owner_id,
            contact_id: row.contact_id,
            platform,
            status,
            remaining_actions,
            delay_served: row.delay_served,
            context: row.context,
            actions_completed: row.actions_completed,
            run_at: row.run_at,
            locked_until: row.locked_until,
            error_message: row.error_message,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

pub struct PgRunQueue {
    db_pool: PgPool,
}

impl PgRunQueue {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }

    /// Persist progress and move the run to `status`, releasing its lease.
    async fn store(&self, run: &AutomationRun, status: RunStatus) -> EngineResult<()> {
        sqlx::query(
            r#"
            UPDATE automation_runs
            SET status = $2, remaining_actions = $3, delay_served = $4, actions_completed = $5,
                run_at = $6, locked_until = NULL, error_message = $7, completed_at = $8,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(run.id)
        .bind(status.as_str())
        .bind(Json(&run.remaining_actions))
        .bind(run.delay_served)
        .bind(run.actions_completed)
        .bind(run.run_at)
        .bind(&run.error_message)
        .bind(run.completed_at)
        .execute(&self.db_pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl RunQueue for PgRunQueue {
    async fn insert(&self, run: &AutomationRun) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO automation_runs
                (id, automation_id, owner_id, contact_id, platform, status, remaining_actions,
                 delay_served, context, actions_completed, run_at, locked_until, started_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(run.id)
        .bind(run.automation_id)
        .bind(run.owner_id)
        .bind(run.contact_id)
        .bind(run.platform.as_str())
        .bind(run.status.as_str())
        .bind(Json(&run.remaining_actions))
        .bind(run.delay_served)
        .bind(&run.context)
        .bind(run.actions_completed)
        .bind(run.run_at)
        .bind(run.locked_until)
        .bind(run.started_at)
        .execute(&self.db_pool)
        .await?;

        Ok(())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        lease_until: DateTime<Utc>,
    ) -> EngineResult<Vec<AutomationRun>> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            r#"
            UPDATE automation_runs
            SET status = 'running', locked_until = $3, updated_at = NOW()
            WHERE id IN (
                SELECT id FROM automation_runs
                WHERE (status = 'suspended' AND run_at <= $1)
                   OR (status = 'running' AND locked_until < $1)
                ORDER BY run_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            RUN_COLUMNS
        ))
        .bind(now)
        .bind(limit)
        .bind(lease_until)
        .fetch_all(&self.db_pool)
        .await?;

        rows.into_iter().map(AutomationRun::try_from).collect()
    }

    async fn suspend(&self, run: &AutomationRun) -> EngineResult<()> {
        self.store(run, RunStatus::Suspended).await
    }

    async fn complete(&self, run: &AutomationRun) -> EngineResult<()> {
        self.store(run, RunStatus::Completed).await
    }

    async fn fail(&self, run: &AutomationRun) -> EngineResult<()> {
        self.store(run, RunStatus::Failed).await
    }

    async fn history(&self, automation_id: Uuid, limit: i64) -> EngineResult<Vec<AutomationRun>> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {} FROM automation_runs WHERE automation_id = $1 ORDER BY started_at DESC LIMIT $2",
            RUN_COLUMNS
        ))
        .bind(automation_id)
        .bind(limit)
        .fetch_all(&self.db_pool)
        .await?;

        rows.into_iter().map(AutomationRun::try_from).collect()
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> EngineResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM automation_runs
            WHERE status IN ('completed', 'failed') AND completed_at < $1
            "#,
        )
        .bind(before)
        .execute(&self.db_pool)
        .await?;

        Ok(result.rows_affected())
    }
}
