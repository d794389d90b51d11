// Action Sequencer - executes one (automation, contact) run step by step

use autoflow_shared::{Action, ActionKind, AutomationRun, Contact, OutboundMessage, TemplateId};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::analytics::AnalyticsAggregator;
use super::clock::Clock;
use super::locks::ContactLocks;
use super::template;
use crate::error::{EngineError, EngineResult};
use crate::integrations::{ContactStore, MessageDispatcher, TemplateStore};

/// Longer delays are clamped.
const MAX_DELAY_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Where a call to [`ActionSequencer::advance`] left the run.
#[derive(Debug)]
pub enum RunOutcome {
    Completed,
    Suspended { resume_at: DateTime<Utc> },
    Failed(EngineError),
}

pub struct ActionSequencer {
    contacts: Arc<dyn ContactStore>,
    templates: Arc<dyn TemplateStore>,
    dispatcher: Arc<dyn MessageDispatcher>,
    analytics: Arc<AnalyticsAggregator>,
    locks: Arc<ContactLocks>,
    clock: Arc<dyn Clock>,
}

impl ActionSequencer {
    pub fn new(
        contacts: Arc<dyn ContactStore>,
        templates: Arc<dyn TemplateStore>,
        dispatcher: Arc<dyn MessageDispatcher>,
        analytics: Arc<AnalyticsAggregator>,
        locks: Arc<ContactLocks>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            contacts,
            templates,
            dispatcher,
            analytics,
            locks,
            clock,
        }
    }

    /// Execute the run's remaining actions until it finishes, fails or has to wait.
    ///
    /// Progress is recorded on `run` as each action completes, so the caller
    /// can persist it whatever the outcome. Side effects of actions already
    /// executed are never rolled back.
    pub async fn advance(&self, run: &mut AutomationRun) -> RunOutcome {
        while let Some(action) = run.remaining_actions.first().cloned() {
            match &action.kind {
                ActionKind::Delay { seconds } => {
                    self.finish_step(run);
                    if *seconds > 0 {
                        return self.suspend(run, *seconds);
                    }
                }
                ActionKind::SendMessage { delay_seconds, .. } if *delay_seconds > 0 && !run.delay_served => {
                    run.delay_served = true;
                    return self.suspend(run, *delay_seconds);
                }
                _ => {
                    if let Err(err) = self.execute(run, &action).await {
                        warn!(
                            "Run {} failed at action {} ({}): {}",
                            run.id,
                            action.id,
                            action.kind.name(),
                            err
                        );
                        return RunOutcome::Failed(err);
                    }
                    self.finish_step(run);
                }
            }
        }

        self.record_completion(run).await;
        RunOutcome::Completed
    }

    fn finish_step(&self, run: &mut AutomationRun) {
        run.remaining_actions.remove(0);
        run.delay_served = false;
        run.actions_completed += 1;
    }

    fn suspend(&self, run: &mut AutomationRun, seconds: u64) -> RunOutcome {
        let resume_at = self.clock.now() + Duration::seconds(seconds.min(MAX_DELAY_SECS) as i64);

        run.run_at = resume_at;
        debug!("Run {} suspended until {}", run.id, resume_at);
        RunOutcome::Suspended { resume_at }
    }

    async fn execute(&self, run: &AutomationRun, action: &Action) -> EngineResult<()> {
        match &action.kind {
            ActionKind::SendMessage {
                template_id, message, ..
            } => self.send_message(run, *template_id, message).await,
            ActionKind::AddTag { tag } => {
                self.mutate_contact(run, |contact| contact.add_tag(tag)).await
            }
            ActionKind::RemoveTag { tag } => {
                self.mutate_contact(run, |contact| contact.remove_tag(tag)).await
            }
            ActionKind::UpdateField { field, value } => {
                self.mutate_contact(run, |contact| contact.set_field(field, value)).await
            }
            ActionKind::Delay { .. } => Ok(()),
        }
    }

    async fn send_message(&self, run: &AutomationRun, template_id: Option<TemplateId>, literal: &str) -> EngineResult<()> {
        let contact = self.contacts.get(run.owner_id, run.contact_id).await?;
        let body = self.resolve_body(run.owner_id, template_id, literal).await?;
        let content = template::render(&body, &contact, &run.context);

        if content.trim().is_empty() {
            return Err(EngineError::Dispatch("resolved message body is empty".to_string()));
        }

        let message = OutboundMessage::text(run.contact_id, content, run.platform, run.automation_id);
        self.dispatcher
            .send(run.owner_id, &message)
            .await
            .map_err(|e| EngineError::Dispatch(e.to_string()))?;

        info!("Automation {} sent message to contact {}", run.automation_id, run.contact_id);

        if let Err(e) = self.analytics.record_message(run.automation_id, self.analytics.today()).await {
            warn!("Failed to record message for automation {}: {}", run.automation_id, e);
        }
        Ok(())
    }

    /// Template content wins unless it is blank; a missing template falls back to the literal.
    async fn resolve_body(&self, owner_id: Uuid, template_id: Option<TemplateId>, literal: &str) -> EngineResult<String> {
        let Some(template_id) = template_id else {
            return Ok(literal.to_string());
        };

        match self.templates.get(owner_id, template_id).await? {
            Some(template) if !template.content.trim().is_empty() => Ok(template.content),
            Some(_) => Ok(literal.to_string()),
            None => {
                warn!("Template {} not found, using literal message", template_id);
                Ok(literal.to_string())
            }
        }
    }

    /// One locked read-modify-write of the contact. No-op mutations are not written back.
    async fn mutate_contact<F>(&self, run: &AutomationRun, mutate: F) -> EngineResult<()>
    where
        F: FnOnce(&mut Contact) -> bool,
    {
        let _guard = self.locks.acquire(run.owner_id, run.contact_id).await;

        let mut contact = self.contacts.get(run.owner_id, run.contact_id).await?;
        if mutate(&mut contact) {
            self.contacts.update(run.owner_id, &contact).await?;
        }
        Ok(())
    }

    async fn record_completion(&self, run: &AutomationRun) {
        let today = self.analytics.today();

        if let Err(e) = self.analytics.record_trigger(run.automation_id, today).await {
            warn!("Failed to record trigger for automation {}: {}", run.automation_id, e);
        }
        if let Err(e) = self.analytics.record_contact(run.automation_id, today, run.contact_id).await {
            warn!("Failed to record contact for automation {}: {}", run.automation_id, e);
        }
    }
}
