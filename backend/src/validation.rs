//! Validation of automation definitions.
//!
//! Drafts arrive as loosely typed JSON; everything is checked up front and all
//! field errors are reported together. Nothing invalid is ever persisted.

use autoflow_shared::{
    Action, ActionKind, KeywordTrigger, ScheduleKind, ScheduleTrigger, Trigger, TriggerType, WebhookTrigger,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use uuid::Uuid;

use crate::automations::schedule::parse_time;
use crate::error::{EngineError, EngineResult, ValidationBuilder};

pub const NAME_MAX_LEN: usize = 200;

/// Body of `POST /api/automations`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AutomationDraft {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub trigger_type: String,
    #[serde(default)]
    pub trigger_config: Value,
    #[serde(default)]
    pub actions: Vec<Value>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

/// Body of `PUT /api/automations/{id}`; absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AutomationPatch {
    pub name: Option<String>,
    pub trigger_type: Option<String>,
    pub trigger_config: Option<Value>,
    pub actions: Option<Vec<Value>>,
    pub is_active: Option<bool>,
}

/// A draft that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidAutomation {
    pub name: String,
    pub trigger: Trigger,
    pub actions: Vec<Action>,
    pub is_active: bool,
}

pub fn validate_draft(draft: &AutomationDraft) -> EngineResult<ValidAutomation> {
    let mut errors = ValidationBuilder::new();

    let name = draft.name.trim();
    if name.is_empty() {
        errors.push("name", "name is required");
    } else if name.chars().count() > NAME_MAX_LEN {
        errors.push("name", &format!("name must be {} characters or less", NAME_MAX_LEN));
    }

    let trigger = match draft.trigger_type.parse::<TriggerType>() {
        Ok(trigger_type) => validate_trigger(trigger_type, &draft.trigger_config, &mut errors),
        Err(_) => {
            errors.push("trigger_type", "trigger_type must be one of keyword, schedule, webhook");
            None
        }
    };

    let actions = validate_actions(&draft.actions, &mut errors);
    errors.finish(())?;

    let trigger = trigger.ok_or_else(|| EngineError::validation("trigger_config", "trigger_config is invalid"))?;
    Ok(ValidAutomation {
        name: name.to_string(),
        trigger,
        actions,
        is_active: draft.is_active.unwrap_or(true),
    })
}

fn parse_config<T: DeserializeOwned>(config: &Value, errors: &mut ValidationBuilder) -> Option<T> {
    let config = match config {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };

    match serde_json::from_value(config) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            errors.push("trigger_config", &format!("invalid trigger_config: {}", e));
            None
        }
    }
}

fn validate_trigger(trigger_type: TriggerType, config: &Value, errors: &mut ValidationBuilder) -> Option<Trigger> {
    match trigger_type {
        TriggerType::Keyword => {
            let config: KeywordTrigger = parse_config(config, errors)?;
            for (i, keyword) in config.keywords.iter().enumerate() {
                if keyword.trim().is_empty() {
                    errors.push(&format!("trigger_config.keywords[{}]", i), "keyword cannot be blank");
                }
            }
            Some(Trigger::Keyword(config))
        }
        TriggerType::Schedule => {
            let config: ScheduleTrigger = parse_config(config, errors)?;
            if parse_time(&config.time).is_none() {
                errors.push("trigger_config.time", "time must be HH:MM");
            }
            if config.schedule_type == ScheduleKind::Weekly && config.days.is_empty() {
                errors.push("trigger_config.days", "weekly schedules need at least one day");
            }
            if config.days.iter().any(|d| !(1..=7).contains(d)) {
                errors.push("trigger_config.days", "days must be between 1 (Monday) and 7 (Sunday)");
            }
            Some(Trigger::Schedule(ScheduleTrigger {
                time: config.time.trim().to_string(),
                ..config
            }))
        }
        TriggerType::Webhook => {
            let config: WebhookTrigger = parse_config(config, errors)?;
            let token = match config.token.trim() {
                "" => generate_token(),
                token => token.to_string(),
            };
            Some(Trigger::Webhook(WebhookTrigger { token }))
        }
    }
}

pub fn generate_token() -> String {
    Uuid::new_v4().simple().to_string()
}

fn validate_actions(raw: &[Value], errors: &mut ValidationBuilder) -> Vec<Action> {
    let mut actions = Vec::with_capacity(raw.len());
    let mut seen_ids = HashSet::new();

    for (i, value) in raw.iter().enumerate() {
        let field = format!("actions[{}]", i);
        let action: Action = match serde_json::from_value(value.clone()) {
            Ok(action) => action,
            Err(e) => {
                errors.push(&field, &format!("invalid action: {}", e));
                continue;
            }
        };

        if !seen_ids.insert(action.id) {
            errors.push(&format!("{}.id", field), "action ids must be unique");
        }

        match &action.kind {
            ActionKind::AddTag { tag } | ActionKind::RemoveTag { tag } if tag.trim().is_empty() => {
                errors.push(&format!("{}.tag", field), "tag cannot be blank");
            }
            ActionKind::UpdateField { field: name, .. } if name.trim().is_empty() => {
                errors.push(&format!("{}.field", field), "field cannot be blank");
            }
            ActionKind::SendMessage { template_id: None, message, .. } if message.trim().is_empty() => {
                errors.push(&format!("{}.message", field), "send_message needs a message or a template_id");
            }
            _ => {}
        }

        actions.push(action);
    }

    actions
}
