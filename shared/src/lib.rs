use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Contact ids are owned by the Contacts collaborator.
pub type ContactId = i64;
pub type TemplateId = i64;

// ==================== Automations ====================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Keyword,
    Schedule,
    Webhook,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Keyword => "keyword",
            Self::Schedule => "schedule",
            Self::Webhook => "webhook",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keyword" => Ok(Self::Keyword),
            "schedule" => Ok(Self::Schedule),
            "webhook" => Ok(Self::Webhook),
            other => Err(format!("unknown trigger type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct KeywordTrigger {
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub case_sensitive: bool,
    #[serde(default)]
    pub exact_match: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Daily,
    Weekly,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleTrigger {
    pub schedule_type: ScheduleKind,
    /// Wall-clock time in UTC, `HH:MM`.
    pub time: String,
    /// ISO weekdays, 1 = Monday .. 7 = Sunday. Only read for weekly schedules.
    #[serde(default)]
    pub days: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WebhookTrigger {
    #[serde(default)]
    pub token: String,
}

/// Trigger configuration, serialized as the `trigger_type` / `trigger_config` pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "trigger_type", content = "trigger_config", rename_all = "snake_case")]
pub enum Trigger {
    Keyword(KeywordTrigger),
    Schedule(ScheduleTrigger),
    Webhook(WebhookTrigger),
}

impl Trigger {
    pub fn trigger_type(&self) -> TriggerType {
        match self {
            Self::Keyword(_) => TriggerType::Keyword,
            Self::Schedule(_) => TriggerType::Schedule,
            Self::Webhook(_) => TriggerType::Webhook,
        }
    }
}

/// One step of an automation pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Action {
    pub id: i64,
    #[serde(flatten)]
    pub kind: ActionKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    SendMessage {
        #[serde(default)]
        template_id: Option<TemplateId>,
        #[serde(default)]
        message: String,
        #[serde(default, alias = "delay")]
        delay_seconds: u64,
    },
    AddTag {
        tag: String,
    },
    RemoveTag {
        tag: String,
    },
    UpdateField {
        field: String,
        #[serde(default)]
        value: String,
    },
    Delay {
        seconds: u64,
    },
}

impl ActionKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SendMessage { .. } => "send_message",
            Self::AddTag { .. } => "add_tag",
            Self::RemoveTag { .. } => "remove_tag",
            Self::UpdateField { .. } => "update_field",
            Self::Delay { .. } => "delay",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Automation {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    #[serde(flatten)]
    pub trigger: Trigger,
    pub actions: Vec<Action>,
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationList {
    pub automations: Vec<Automation>,
}

// ==================== Contacts & messaging ====================

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    #[default]
    Whatsapp,
    Instagram,
    Facebook,
    Telegram,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Whatsapp => "whatsapp",
            Self::Instagram => "instagram",
            Self::Facebook => "facebook",
            Self::Telegram => "telegram",
        }
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "whatsapp" => Ok(Self::Whatsapp),
            "instagram" => Ok(Self::Instagram),
            "facebook" => Ok(Self::Facebook),
            "telegram" => Ok(Self::Telegram),
            other => Err(format!("unsupported platform '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Contact {
    pub id: ContactId,
    pub phone: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub custom_fields: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "lenient_timestamp::deserialize")]
    pub last_interaction: Option<DateTime<Utc>>,
}

/// Accepts RFC 3339 as well as naive ISO-8601 timestamps (no offset), which
/// the Contacts service emits and which are taken to be UTC.
mod lenient_timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let Some(raw) = Option::<String>::deserialize(deserializer)? else {
            return Ok(None);
        };
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(None);
        }

        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Ok(Some(parsed.with_timezone(&Utc)));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
            .map(|naive| Some(naive.and_utc()))
            .map_err(|e| serde::de::Error::custom(format!("invalid timestamp '{}': {}", raw, e)))
    }
}

impl Contact {
    /// Returns false when the tag was already present.
    pub fn add_tag(&mut self, tag: &str) -> bool {
        if self.tags.iter().any(|t| t == tag) {
            return false;
        }
        self.tags.push(tag.to_string());
        true
    }

    /// Returns false when the tag was not present.
    pub fn remove_tag(&mut self, tag: &str) -> bool {
        let before = self.tags.len();
        self.tags.retain(|t| t != tag);
        self.tags.len() != before
    }

    /// Returns false when the field already held this value.
    pub fn set_field(&mut self, field: &str, value: &str) -> bool {
        match self.custom_fields.get(field) {
            Some(current) if current == value => false,
            _ => {
                self.custom_fields.insert(field.to_string(), value.to_string());
                true
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageTemplate {
    pub id: TemplateId,
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub variables: Vec<String>,
    #[serde(default)]
    pub category: Option<String>,
}

/// Body of `POST /api/messages/send`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundMessage {
    pub contact_id: ContactId,
    pub content: String,
    pub message_type: String,
    pub platform: Platform,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub automation_id: Option<Uuid>,
}

impl OutboundMessage {
    pub fn text(contact_id: ContactId, content: String, platform: Platform, automation_id: Uuid) -> Self {
        Self {
            contact_id,
            content,
            message_type: "text".to_string(),
            platform,
            automation_id: Some(automation_id),
        }
    }
}

// ==================== Analytics ====================

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DailyMetric {
    pub date: NaiveDate,
    pub triggers_count: i64,
    pub messages_sent: i64,
    pub unique_contacts: i64,
    /// Fraction in `[0, 1]`.
    pub conversion_rate: f64,
}

impl DailyMetric {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            triggers_count: 0,
            messages_sent: 0,
            unique_contacts: 0,
            conversion_rate: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutomationAnalytics {
    pub total_triggers: i64,
    pub total_messages: i64,
    pub avg_conversion_rate: f64,
    pub daily_metrics: Vec<DailyMetric>,
}

// ==================== Runs ====================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Suspended,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "suspended" => Ok(Self::Suspended),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown run status '{}'", other)),
        }
    }
}

/// One (automation, contact) execution, persisted so delayed steps survive restarts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutomationRun {
    pub id: Uuid,
    pub automation_id: Uuid,
    pub owner_id: Uuid,
    pub contact_id: ContactId,
    pub platform: Platform,
    pub status: RunStatus,
    /// Snapshot of the actions still to execute.
    pub remaining_actions: Vec<Action>,
    /// The head action's own `delay_seconds` has already been waited out.
    pub delay_served: bool,
    /// Webhook payload, or null.
    pub context: serde_json::Value,
    pub actions_completed: i32,
    pub run_at: DateTime<Utc>,
    pub locked_until: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunList {
    pub runs: Vec<AutomationRun>,
}
