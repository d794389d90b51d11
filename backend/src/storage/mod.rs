//! Persistence seams for automations, daily metrics and the run queue.
//!
//! Each trait has a Postgres implementation and a process-local one; which one
//! is wired in is decided by `STORAGE_BACKEND`.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use autoflow_shared::{Automation, AutomationRun, ContactId, DailyMetric, TriggerType};
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::error::EngineResult;

pub use memory::{MemoryAutomationRepository, MemoryMetricsStore, MemoryRunQueue};
pub use postgres::{PgAutomationRepository, PgMetricsStore, PgRunQueue};

#[async_trait]
pub trait AutomationRepository: Send + Sync {
    async fn insert(&self, automation: &Automation) -> EngineResult<()>;

    /// Overwrites name, trigger, actions, active flag and `updated_at`.
    async fn update(&self, automation: &Automation) -> EngineResult<()>;

    async fn get(&self, id: Uuid) -> EngineResult<Option<Automation>>;

    /// All of an owner's automations in creation order.
    async fn list(&self, owner_id: Uuid) -> EngineResult<Vec<Automation>>;

    async fn list_active(&self, owner_id: Uuid) -> EngineResult<Vec<Automation>>;

    /// Active automations of every owner with the given trigger type, in creation order.
    async fn list_active_by_trigger(&self, trigger_type: TriggerType) -> EngineResult<Vec<Automation>>;

    async fn find_webhook(&self, token: &str) -> EngineResult<Option<Automation>>;

    async fn mark_triggered(&self, id: Uuid, at: DateTime<Utc>) -> EngineResult<()>;
}

/// Counter increments applied to one automation-day row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricDelta {
    pub triggers: i64,
    pub messages: i64,
}

impl MetricDelta {
    pub fn trigger() -> Self {
        Self { triggers: 1, messages: 0 }
    }

    pub fn message() -> Self {
        Self { triggers: 0, messages: 1 }
    }
}

#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn increment(&self, automation_id: Uuid, date: NaiveDate, delta: MetricDelta) -> EngineResult<()>;

    /// Registers a contact for the day; `true` when it was not yet counted.
    async fn add_contact(&self, automation_id: Uuid, date: NaiveDate, contact_id: ContactId) -> EngineResult<bool>;

    async fn set_conversion_rate(&self, automation_id: Uuid, date: NaiveDate, rate: f64) -> EngineResult<()>;

    /// Stored rows in `[start, end]`, ascending. Days without activity are absent.
    async fn fetch(&self, automation_id: Uuid, start: NaiveDate, end: NaiveDate) -> EngineResult<Vec<DailyMetric>>;
}

#[async_trait]
pub trait RunQueue: Send + Sync {
    async fn insert(&self, run: &AutomationRun) -> EngineResult<()>;

    /// Lease up to `limit` runs that are due: suspended with `run_at <= now`,
    /// or running with an expired lease. Claimed runs come back as `running`
    /// with `locked_until = lease_until`.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        lease_until: DateTime<Utc>,
    ) -> EngineResult<Vec<AutomationRun>>;

    async fn suspend(&self, run: &AutomationRun) -> EngineResult<()>;

    async fn complete(&self, run: &AutomationRun) -> EngineResult<()>;

    async fn fail(&self, run: &AutomationRun) -> EngineResult<()>;

    /// Most recent first.
    async fn history(&self, automation_id: Uuid, limit: i64) -> EngineResult<Vec<AutomationRun>>;

    /// Deletes completed and failed runs finished before `before`.
    async fn purge_finished(&self, before: DateTime<Utc>) -> EngineResult<u64>;
}
