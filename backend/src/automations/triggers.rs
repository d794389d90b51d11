// Trigger events and the matcher that selects automations for them

use autoflow_shared::{Automation, ContactId, KeywordTrigger, Platform, Trigger};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use super::schedule::ScheduleOracle;

/// What happened. Only the event kind decides which trigger types can match.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    InboundMessage { text: String },
    ScheduleTick,
    WebhookCall { token: String, payload: Value },
}

/// Ephemeral event routed to one owner's automations.
#[derive(Debug, Clone)]
pub struct TriggerEvent {
    pub event_id: Uuid,
    pub owner_id: Uuid,
    pub source_platform: Platform,
    pub contact_id: ContactId,
    pub kind: EventKind,
    pub occurred_at: DateTime<Utc>,
}

impl TriggerEvent {
    fn new(
        owner_id: Uuid,
        source_platform: Platform,
        contact_id: ContactId,
        kind: EventKind,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            owner_id,
            source_platform,
            contact_id,
            kind,
            occurred_at,
        }
    }

    pub fn inbound_message(
        owner_id: Uuid,
        platform: Platform,
        contact_id: ContactId,
        text: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self::new(
            owner_id,
            platform,
            contact_id,
            EventKind::InboundMessage { text: text.into() },
            occurred_at,
        )
    }

    pub fn webhook_call(
        owner_id: Uuid,
        platform: Platform,
        contact_id: ContactId,
        token: impl Into<String>,
        payload: Value,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self::new(
            owner_id,
            platform,
            contact_id,
            EventKind::WebhookCall {
                token: token.into(),
                payload,
            },
            occurred_at,
        )
    }

    pub fn schedule_tick(
        owner_id: Uuid,
        platform: Platform,
        contact_id: ContactId,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self::new(owner_id, platform, contact_id, EventKind::ScheduleTick, occurred_at)
    }

    pub fn inbound_text(&self) -> Option<&str> {
        match &self.kind {
            EventKind::InboundMessage { text } => Some(text),
            _ => None,
        }
    }

    /// Template context handed to the sequencer.
    pub fn payload(&self) -> Value {
        match &self.kind {
            EventKind::WebhookCall { payload, .. } => payload.clone(),
            _ => Value::Null,
        }
    }
}

#[derive(Clone)]
pub struct TriggerMatcher {
    oracle: Arc<dyn ScheduleOracle>,
}

impl TriggerMatcher {
    pub fn new(oracle: Arc<dyn ScheduleOracle>) -> Self {
        Self { oracle }
    }

    /// Matching automations, in the order given (callers pass creation order).
    pub fn select<'a>(&self, event: &TriggerEvent, automations: &'a [Automation]) -> Vec<&'a Automation> {
        automations
            .iter()
            .filter(|automation| automation.owner_id == event.owner_id)
            .filter(|automation| self.matches(automation, event))
            .collect()
    }

    pub fn matches(&self, automation: &Automation, event: &TriggerEvent) -> bool {
        if !automation.is_active {
            return false;
        }

        match (&automation.trigger, &event.kind) {
            (Trigger::Keyword(config), EventKind::InboundMessage { text }) => {
                keyword_matches(config, text)
            }
            (Trigger::Schedule(_), EventKind::ScheduleTick) => {
                self.is_schedule_due(automation, event.occurred_at)
            }
            (Trigger::Webhook(config), EventKind::WebhookCall { token, .. }) => {
                !config.token.is_empty() && config.token == *token
            }
            _ => false,
        }
    }

    /// Evaluated once per automation per tick, before fan-out to contacts.
    pub fn is_schedule_due(&self, automation: &Automation, now: DateTime<Utc>) -> bool {
        match &automation.trigger {
            Trigger::Schedule(schedule) if automation.is_active => {
                self.oracle.is_due(schedule, automation.last_triggered_at, now)
            }
            _ => false,
        }
    }
}

pub fn keyword_matches(config: &KeywordTrigger, text: &str) -> bool {
    let fold = |s: &str| {
        if config.case_sensitive {
            s.to_string()
        } else {
            fold_case(s)
        }
    };

    let text = fold(text);
    let trimmed = text.trim();

    config
        .keywords
        .iter()
        .map(|k| fold(k.trim()))
        .filter(|k| !k.is_empty())
        .any(|keyword| {
            if config.exact_match {
                trimmed == keyword
            } else {
                text.contains(&keyword)
            }
        })
}

/// Simple one-to-one case folding: each char maps to exactly one char, so
/// `İ` folds to `i` rather than expanding to `i` plus a combining dot.
/// Final sigma is folded onto σ so that word position does not affect comparison.
pub fn fold_case(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'ς' => 'σ',
            c => c.to_lowercase().next().unwrap_or(c),
        })
        .collect()
}
