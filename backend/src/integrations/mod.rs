//! External collaborators consumed by the action sequencer.
//!
//! Contacts, templates and message delivery live behind their own HTTP APIs;
//! the engine only sees these traits.

pub mod http;

use async_trait::async_trait;
use autoflow_shared::{Contact, ContactId, MessageTemplate, OutboundMessage, TemplateId};
use uuid::Uuid;

pub use http::HttpCollaborators;

#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("request rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected response body: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for CollaboratorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContactStore: Send + Sync {
    async fn get(&self, owner_id: Uuid, contact_id: ContactId) -> CollaboratorResult<Contact>;

    /// Writes back name, email, tags, custom fields and last interaction.
    async fn update(&self, owner_id: Uuid, contact: &Contact) -> CollaboratorResult<()>;

    async fn list(&self, owner_id: Uuid) -> CollaboratorResult<Vec<Contact>>;

    async fn find_or_create_by_phone(&self, owner_id: Uuid, phone: &str) -> CollaboratorResult<Contact>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TemplateStore: Send + Sync {
    /// `Ok(None)` when the owner has no template with this id.
    async fn get(&self, owner_id: Uuid, template_id: TemplateId) -> CollaboratorResult<Option<MessageTemplate>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync {
    async fn send(&self, owner_id: Uuid, message: &OutboundMessage) -> CollaboratorResult<()>;
}
