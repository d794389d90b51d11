// Process-local storage backends

use async_trait::async_trait;
use autoflow_shared::{Automation, AutomationRun, ContactId, DailyMetric, RunStatus, Trigger, TriggerType};
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{AutomationRepository, MetricDelta, MetricsStore, RunQueue};
use crate::error::{EngineError, EngineResult};

/// Vec order is creation order.
#[derive(Default)]
pub struct MemoryAutomationRepository {
    automations: RwLock<Vec<Automation>>,
}

impl MemoryAutomationRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AutomationRepository for MemoryAutomationRepository {
    async fn insert(&self, automation: &Automation) -> EngineResult<()> {
        let mut automations = self.automations.write().await;
        if automations.iter().any(|a| a.id == automation.id) {
            return Err(EngineError::validation("id", "automation already exists"));
        }
        automations.push(automation.clone());
        Ok(())
    }

    async fn update(&self, automation: &Automation) -> EngineResult<()> {
        let mut automations = self.automations.write().await;
        let existing = automations
            .iter_mut()
            .find(|a| a.id == automation.id)
            .ok_or_else(|| EngineError::NotFound("Automation".to_string()))?;

        existing.name = automation.name.clone();
        existing.trigger = automation.trigger.clone();
        existing.actions = automation.actions.clone();
        existing.is_active = automation.is_active;
        existing.updated_at = automation.updated_at;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> EngineResult<Option<Automation>> {
        let automations = self.automations.read().await;
        Ok(automations.iter().find(|a| a.id == id).cloned())
    }

    async fn list(&self, owner_id: Uuid) -> EngineResult<Vec<Automation>> {
        let automations = self.automations.read().await;
        Ok(automations
            .iter()
            .filter(|a| a.owner_id == owner_id)
            .cloned()
            .collect())
    }

    async fn list_active(&self, owner_id: Uuid) -> EngineResult<Vec<Automation>> {
        let automations = self.automations.read().await;
        Ok(automations
            .iter()
            .filter(|a| a.owner_id == owner_id && a.is_active)
            .cloned()
            .collect())
    }

    async fn list_active_by_trigger(&self, trigger_type: TriggerType) -> EngineResult<Vec<Automation>> {
        let automations = self.automations.read().await;
        Ok(automations
            .iter()
            .filter(|a| a.is_active && a.trigger.trigger_type() == trigger_type)
            .cloned()
            .collect())
    }

    async fn find_webhook(&self, token: &str) -> EngineResult<Option<Automation>> {
        let automations = self.automations.read().await;
        Ok(automations
            .iter()
            .find(|a| matches!(&a.trigger, Trigger::Webhook(hook) if hook.token == token))
            .cloned())
    }

    async fn mark_triggered(&self, id: Uuid, at: DateTime<Utc>) -> EngineResult<()> {
        let mut automations = self.automations.write().await;
        if let Some(automation) = automations.iter_mut().find(|a| a.id == id) {
            automation.last_triggered_at = Some(at);
        }
        Ok(())
    }
}

type DayKey = (Uuid, NaiveDate);

/// Counters live in `DashMap` shards; each increment holds the shard lock.
#[derive(Default)]
pub struct MemoryMetricsStore {
    rows: DashMap<DayKey, DailyMetric>,
    contacts: DashMap<DayKey, HashSet<ContactId>>,
}

impl MemoryMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetricsStore for MemoryMetricsStore {
    async fn increment(&self, automation_id: Uuid, date: NaiveDate, delta: MetricDelta) -> EngineResult<()> {
        let mut row = self
            .rows
            .entry((automation_id, date))
            .or_insert_with(|| DailyMetric::empty(date));
        row.triggers_count += delta.triggers;
        row.messages_sent += delta.messages;
        Ok(())
    }

    async fn add_contact(&self, automation_id: Uuid, date: NaiveDate, contact_id: ContactId) -> EngineResult<bool> {
        let key = (automation_id, date);
        let inserted = self.contacts.entry(key).or_default().insert(contact_id);

        if inserted {
            self.rows
                .entry(key)
                .or_insert_with(|| DailyMetric::empty(date))
                .unique_contacts += 1;
        }
        Ok(inserted)
    }

    async fn set_conversion_rate(&self, automation_id: Uuid, date: NaiveDate, rate: f64) -> EngineResult<()> {
        self.rows
            .entry((automation_id, date))
            .or_insert_with(|| DailyMetric::empty(date))
            .conversion_rate = rate;
        Ok(())
    }

    async fn fetch(&self, automation_id: Uuid, start: NaiveDate, end: NaiveDate) -> EngineResult<Vec<DailyMetric>> {
        let mut rows: Vec<DailyMetric> = self
            .rows
            .iter()
            .filter(|entry| {
                let (id, date) = *entry.key();
                id == automation_id && date >= start && date <= end
            })
            .map(|entry| entry.value().clone())
            .collect();

        rows.sort_by_key(|row| row.date);
        Ok(rows)
    }
}

/// Runs kept in memory are lost on restart.
#[derive(Default)]
pub struct MemoryRunQueue {
    runs: RwLock<HashMap<Uuid, AutomationRun>>,
}

impl MemoryRunQueue {
    pub fn new() -> Self {
        Self::default()
    }

    async fn store(&self, run: &AutomationRun, status: RunStatus) {
        let mut stored = run.clone();
        stored.status = status;
        stored.locked_until = None;
        self.runs.write().await.insert(stored.id, stored);
    }
}

fn is_due(run: &AutomationRun, now: DateTime<Utc>) -> bool {
    match run.status {
        RunStatus::Suspended => run.run_at <= now,
        RunStatus::Running => run.locked_until.is_some_and(|until| until < now),
        _ => false,
    }
}

#[async_trait]
impl RunQueue for MemoryRunQueue {
    async fn insert(&self, run: &AutomationRun) -> EngineResult<()> {
        self.runs.write().await.insert(run.id, run.clone());
        Ok(())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        lease_until: DateTime<Utc>,
    ) -> EngineResult<Vec<AutomationRun>> {
        let mut runs = self.runs.write().await;

        let mut due: Vec<(DateTime<Utc>, Uuid)> = runs
            .values()
            .filter(|run| is_due(run, now))
            .map(|run| (run.run_at, run.id))
            .collect();
        due.sort();
        due.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(run) = runs.get_mut(&id) {
                run.status = RunStatus::Running;
                run.locked_until = Some(lease_until);
                claimed.push(run.clone());
            }
        }
        Ok(claimed)
    }

    async fn suspend(&self, run: &AutomationRun) -> EngineResult<()> {
        self.store(run, RunStatus::Suspended).await;
        Ok(())
    }

    async fn complete(&self, run: &AutomationRun) -> EngineResult<()> {
        self.store(run, RunStatus::Completed).await;
        Ok(())
    }

    async fn fail(&self, run: &AutomationRun) -> EngineResult<()> {
        self.store(run, RunStatus::Failed).await;
        Ok(())
    }

    async fn history(&self, automation_id: Uuid, limit: i64) -> EngineResult<Vec<AutomationRun>> {
        let runs = self.runs.read().await;
        let mut history: Vec<AutomationRun> = runs
            .values()
            .filter(|run| run.automation_id == automation_id)
            .cloned()
            .collect();

        history.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        history.truncate(limit.max(0) as usize);
        Ok(history)
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> EngineResult<u64> {
        let mut runs = self.runs.write().await;
        let count = runs.len();
        runs.retain(|_, run| {
            !(run.status.is_finished() && run.completed_at.is_some_and(|at| at < before))
        });
        Ok((count - runs.len()) as u64)
    }
}
