// Automation Engine - routes events to matching automations and drives their runs

use autoflow_shared::{Automation, AutomationRun, ContactId, Platform, RunStatus};
use chrono::Duration;
use futures::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::analytics::AnalyticsAggregator;
use super::clock::Clock;
use super::locks::ContactLocks;
use super::registry::AutomationRegistry;
use super::schedule::ScheduleOracle;
use super::sequencer::{ActionSequencer, RunOutcome};
use super::triggers::{TriggerEvent, TriggerMatcher};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::integrations::{ContactStore, MessageDispatcher, TemplateStore};
use crate::storage::{AutomationRepository, MetricsStore, RunQueue};

pub struct Stores {
    pub automations: Arc<dyn AutomationRepository>,
    pub metrics: Arc<dyn MetricsStore>,
    pub runs: Arc<dyn RunQueue>,
}

pub struct Collaborators {
    pub contacts: Arc<dyn ContactStore>,
    pub templates: Arc<dyn TemplateStore>,
    pub dispatcher: Arc<dyn MessageDispatcher>,
}

/// A run that was recorded and handed to its own task.
#[derive(Debug)]
pub struct DispatchedRun {
    pub run_id: Uuid,
    pub automation_id: Uuid,
    pub task: JoinHandle<RunStatus>,
}

pub struct AutomationEngine {
    registry: Arc<AutomationRegistry>,
    analytics: Arc<AnalyticsAggregator>,
    matcher: TriggerMatcher,
    sequencer: Arc<ActionSequencer>,
    runs: Arc<dyn RunQueue>,
    contacts: Arc<dyn ContactStore>,
    locks: Arc<ContactLocks>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl AutomationEngine {
    pub fn new(
        stores: Stores,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
        oracle: Arc<dyn ScheduleOracle>,
        config: EngineConfig,
    ) -> Self {
        let registry = Arc::new(AutomationRegistry::new(stores.automations, clock.clone()));
        let analytics = Arc::new(AnalyticsAggregator::new(
            stores.metrics,
            clock.clone(),
            config.analytics_max_range_days,
        ));
        let locks = Arc::new(ContactLocks::new());
        let sequencer = Arc::new(ActionSequencer::new(
            collaborators.contacts.clone(),
            collaborators.templates,
            collaborators.dispatcher,
            analytics.clone(),
            locks.clone(),
            clock.clone(),
        ));

        Self {
            registry,
            analytics,
            matcher: TriggerMatcher::new(oracle),
            sequencer,
            runs: stores.runs,
            contacts: collaborators.contacts,
            locks,
            clock,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<AutomationRegistry> {
        &self.registry
    }

    pub fn analytics(&self) -> &Arc<AnalyticsAggregator> {
        &self.analytics
    }

    /// Start one run per matching active automation of the event's owner,
    /// in creation order. A failure to start one run does not affect the others.
    pub async fn dispatch(&self, event: TriggerEvent) -> EngineResult<Vec<DispatchedRun>> {
        let automations = self.registry.list_active(event.owner_id).await?;
        let matched = self.matcher.select(&event, &automations);

        if matched.is_empty() {
            return Ok(Vec::new());
        }
        info!(
            "Event {} for contact {} matched {} automation(s)",
            event.event_id,
            event.contact_id,
            matched.len()
        );

        let mut dispatched = Vec::with_capacity(matched.len());
        for automation in matched {
            match self
                .start_run(automation, event.contact_id, event.source_platform, event.payload())
                .await
            {
                Ok(run) => dispatched.push(run),
                Err(e) => error!(
                    "Failed to start automation '{}' ({}) for contact {}: {}",
                    automation.name, automation.id, event.contact_id, e
                ),
            }
        }

        Ok(dispatched)
    }

    /// Record a `running` run with a snapshot of the automation's actions and spawn it.
    pub async fn start_run(
        &self,
        automation: &Automation,
        contact_id: ContactId,
        platform: Platform,
        context: Value,
    ) -> EngineResult<DispatchedRun> {
        let now = self.clock.now();
        let run = AutomationRun {
            id: Uuid::new_v4(),
            automation_id: automation.id,
            owner_id: automation.owner_id,
            contact_id,
            platform,
            status: RunStatus::Running,
            remaining_actions: automation.actions.clone(),
            delay_served: false,
            context,
            actions_completed: 0,
            run_at: now,
            locked_until: Some(now + Duration::seconds(self.config.run_lease_secs)),
            error_message: None,
            started_at: now,
            completed_at: None,
        };

        self.runs.insert(&run).await?;

        Ok(DispatchedRun {
            run_id: run.id,
            automation_id: run.automation_id,
            task: self.spawn(run),
        })
    }

    fn spawn(&self, run: AutomationRun) -> JoinHandle<RunStatus> {
        let sequencer = self.sequencer.clone();
        let runs = self.runs.clone();
        let clock = self.clock.clone();

        tokio::spawn(drive(sequencer, runs, clock, run))
    }

    /// Claim suspended runs whose delay elapsed (and runs whose lease expired)
    /// and drive them. Returns how many were resumed.
    pub async fn resume_due(&self) -> EngineResult<usize> {
        let now = self.clock.now();
        let lease_until = now + Duration::seconds(self.config.run_lease_secs);
        let claimed = self
            .runs
            .claim_due(now, self.config.queue_batch_size, lease_until)
            .await?;

        if claimed.is_empty() {
            return Ok(0);
        }

        let count = claimed.len();
        info!("Resuming {} due automation run(s)", count);

        let tasks: Vec<_> = claimed.into_iter().map(|run| self.spawn(run)).collect();
        for result in join_all(tasks).await {
            if let Err(e) = result {
                error!("Automation run task panicked: {}", e);
            }
        }

        Ok(count)
    }

    /// Fire every due schedule automation for all of its owner's contacts.
    /// Returns the number of runs started.
    pub async fn run_schedule_tick(&self) -> EngineResult<usize> {
        let now = self.clock.now();
        let schedules = self.registry.list_active_schedules().await?;
        let mut started = 0;

        for automation in schedules.iter().filter(|a| self.matcher.is_schedule_due(a, now)) {
            // Left unmarked on failure so the next tick in the same minute retries.
            let contacts = match self.contacts.list(automation.owner_id).await {
                Ok(contacts) => contacts,
                Err(e) => {
                    error!("Failed to list contacts for schedule automation {}: {}", automation.id, e);
                    continue;
                }
            };

            if let Err(e) = self.registry.mark_triggered(automation.id, now).await {
                error!("Failed to mark schedule automation {} as fired: {}", automation.id, e);
                continue;
            }

            info!(
                "Schedule automation '{}' fired for {} contact(s)",
                automation.name,
                contacts.len()
            );

            for contact in contacts {
                match self
                    .start_run(automation, contact.id, Platform::default(), Value::Null)
                    .await
                {
                    Ok(_) => started += 1,
                    Err(e) => error!(
                        "Failed to start schedule automation {} for contact {}: {}",
                        automation.id, contact.id, e
                    ),
                }
            }
        }

        Ok(started)
    }

    /// Inbound platform message: resolve the contact by phone, stamp its
    /// last interaction, then dispatch.
    pub async fn handle_inbound_message(
        &self,
        owner_id: Uuid,
        platform: Platform,
        phone: &str,
        text: &str,
    ) -> EngineResult<Vec<DispatchedRun>> {
        let now = self.clock.now();
        let contact = self.contacts.find_or_create_by_phone(owner_id, phone).await?;

        {
            let _guard = self.locks.acquire(owner_id, contact.id).await;
            let mut fresh = self.contacts.get(owner_id, contact.id).await?;
            fresh.last_interaction = Some(now);
            if let Err(e) = self.contacts.update(owner_id, &fresh).await {
                warn!("Failed to update last interaction for contact {}: {}", contact.id, e);
            }
        }

        self.dispatch(TriggerEvent::inbound_message(owner_id, platform, contact.id, text, now))
            .await
    }

    pub async fn handle_webhook(
        &self,
        token: &str,
        contact_id: ContactId,
        platform: Platform,
        payload: Value,
    ) -> EngineResult<Vec<DispatchedRun>> {
        let automation = self
            .registry
            .find_by_webhook_token(token)
            .await?
            .ok_or_else(|| EngineError::NotFound("Webhook".to_string()))?;

        let event = TriggerEvent::webhook_call(
            automation.owner_id,
            platform,
            contact_id,
            token,
            payload,
            self.clock.now(),
        );
        self.dispatch(event).await
    }

    pub async fn run_history(&self, owner_id: Uuid, automation_id: Uuid, limit: i64) -> EngineResult<Vec<AutomationRun>> {
        self.registry.get(owner_id, automation_id).await?;
        self.runs.history(automation_id, limit).await
    }

    /// Delete finished runs past retention and drop idle contact locks.
    pub async fn purge_finished_runs(&self) -> EngineResult<u64> {
        let before = self.clock.now() - Duration::days(self.config.run_retention_days);
        let purged = self.runs.purge_finished(before).await?;
        let pruned = self.locks.prune();

        info!("Purged {} finished run(s), pruned {} idle contact lock(s)", purged, pruned);
        Ok(purged)
    }
}

/// Advance a run and persist wherever it stopped. Persistence failures leave
/// the run leased; it is reclaimed once the lease expires.
async fn drive(
    sequencer: Arc<ActionSequencer>,
    runs: Arc<dyn RunQueue>,
    clock: Arc<dyn Clock>,
    mut run: AutomationRun,
) -> RunStatus {
    let outcome = sequencer.advance(&mut run).await;
    run.locked_until = None;

    let persisted = match outcome {
        RunOutcome::Completed => {
            run.status = RunStatus::Completed;
            run.completed_at = Some(clock.now());
            runs.complete(&run).await
        }
        RunOutcome::Suspended { .. } => {
            run.status = RunStatus::Suspended;
            runs.suspend(&run).await
        }
        RunOutcome::Failed(err) => {
            run.status = RunStatus::Failed;
            run.error_message = Some(err.to_string());
            run.completed_at = Some(clock.now());
            runs.fail(&run).await
        }
    };

    if let Err(e) = persisted {
        error!("Failed to persist run {} as {}: {}", run.id, run.status.as_str(), e);
    }

    run.status
}
