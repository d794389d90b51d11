// Automation Registry - owner-scoped CRUD over automation definitions

use autoflow_shared::{Automation, Trigger, TriggerType};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::clock::Clock;
use crate::error::{EngineError, EngineResult};
use crate::storage::AutomationRepository;
use crate::validation::{validate_draft, AutomationDraft, AutomationPatch, ValidAutomation};

pub struct AutomationRegistry {
    repo: Arc<dyn AutomationRepository>,
    clock: Arc<dyn Clock>,
}

impl AutomationRegistry {
    pub fn new(repo: Arc<dyn AutomationRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    pub async fn create(&self, owner_id: Uuid, draft: AutomationDraft) -> EngineResult<Automation> {
        let valid = validate_draft(&draft)?;
        let id = Uuid::new_v4();
        self.ensure_token_free(&valid.trigger, id).await?;

        let automation = Automation {
            id,
            owner_id,
            name: valid.name,
            trigger: valid.trigger,
            actions: valid.actions,
            is_active: valid.is_active,
            last_triggered_at: None,
            created_at: self.clock.now(),
            updated_at: None,
        };

        self.repo.insert(&automation).await?;
        info!(
            "Created automation '{}' ({}) with {} trigger for owner {}",
            automation.name,
            automation.id,
            automation.trigger.trigger_type(),
            owner_id
        );
        Ok(automation)
    }

    /// Merge the patch over the stored definition and validate the result as a whole.
    pub async fn update(&self, owner_id: Uuid, id: Uuid, patch: AutomationPatch) -> EngineResult<Automation> {
        let current = self.get(owner_id, id).await?;

        let type_changed = patch
            .trigger_type
            .as_deref()
            .is_some_and(|t| t != current.trigger.trigger_type().as_str());
        let trigger_config = match patch.trigger_config {
            Some(config) => config,
            None if type_changed => serde_json::Value::Null,
            None => trigger_config_value(&current.trigger),
        };
        let actions = match patch.actions {
            Some(actions) => actions,
            None => current
                .actions
                .iter()
                .map(serde_json::to_value)
                .collect::<Result<_, _>>()
                .map_err(|e| EngineError::TransientInfra(format!("re-encoding actions: {}", e)))?,
        };

        let draft = AutomationDraft {
            name: patch.name.unwrap_or_else(|| current.name.clone()),
            trigger_type: patch
                .trigger_type
                .unwrap_or_else(|| current.trigger.trigger_type().to_string()),
            trigger_config,
            actions,
            is_active: Some(patch.is_active.unwrap_or(current.is_active)),
        };
        let ValidAutomation {
            name,
            trigger,
            actions,
            is_active,
        } = validate_draft(&draft)?;
        self.ensure_token_free(&trigger, id).await?;

        let updated = Automation {
            name,
            trigger,
            actions,
            is_active,
            updated_at: Some(self.clock.now()),
            ..current
        };
        self.repo.update(&updated).await?;

        info!("Updated automation {} for owner {}", id, owner_id);
        Ok(updated)
    }

    /// NotFound when absent or owned by someone else.
    pub async fn get(&self, owner_id: Uuid, id: Uuid) -> EngineResult<Automation> {
        self.repo
            .get(id)
            .await?
            .filter(|automation| automation.owner_id == owner_id)
            .ok_or_else(|| EngineError::NotFound("Automation".to_string()))
    }

    pub async fn list(&self, owner_id: Uuid) -> EngineResult<Vec<Automation>> {
        self.repo.list(owner_id).await
    }

    pub async fn list_active(&self, owner_id: Uuid) -> EngineResult<Vec<Automation>> {
        self.repo.list_active(owner_id).await
    }

    /// Deactivation is the only removal path; in-flight runs are unaffected.
    pub async fn set_active(&self, owner_id: Uuid, id: Uuid, active: bool) -> EngineResult<Automation> {
        let current = self.get(owner_id, id).await?;
        if current.is_active == active {
            return Ok(current);
        }

        let updated = Automation {
            is_active: active,
            updated_at: Some(self.clock.now()),
            ..current
        };
        self.repo.update(&updated).await?;

        info!(
            "Automation {} {} by owner {}",
            id,
            if active { "activated" } else { "deactivated" },
            owner_id
        );
        Ok(updated)
    }

    pub async fn find_by_webhook_token(&self, token: &str) -> EngineResult<Option<Automation>> {
        if token.trim().is_empty() {
            return Ok(None);
        }
        self.repo.find_webhook(token).await
    }

    pub async fn list_active_schedules(&self) -> EngineResult<Vec<Automation>> {
        self.repo.list_active_by_trigger(TriggerType::Schedule).await
    }

    pub async fn mark_triggered(&self, id: Uuid, at: DateTime<Utc>) -> EngineResult<()> {
        self.repo.mark_triggered(id, at).await
    }

    async fn ensure_token_free(&self, trigger: &Trigger, id: Uuid) -> EngineResult<()> {
        let Trigger::Webhook(hook) = trigger else {
            return Ok(());
        };

        match self.repo.find_webhook(&hook.token).await? {
            Some(existing) if existing.id != id => Err(EngineError::validation(
                "trigger_config.token",
                "webhook token is already in use",
            )),
            _ => Ok(()),
        }
    }
}

fn trigger_config_value(trigger: &Trigger) -> serde_json::Value {
    serde_json::to_value(trigger)
        .ok()
        .and_then(|mut tagged| tagged.get_mut("trigger_config").map(serde_json::Value::take))
        .unwrap_or(serde_json::Value::Null)
}
