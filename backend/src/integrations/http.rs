use async_trait::async_trait;
use autoflow_shared::{Contact, ContactId, MessageTemplate, OutboundMessage, TemplateId};
use chrono::{DateTime, Utc};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::{CollaboratorError, CollaboratorResult, ContactStore, MessageDispatcher, TemplateStore};
use crate::config::CollaboratorConfig;

const OWNER_HEADER: &str = "X-Owner-Id";
const CONTACTS_PAGE_SIZE: u32 = 100;

/// reqwest client for the contacts, templates and messaging APIs.
#[derive(Clone)]
pub struct HttpCollaborators {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
}

#[derive(Debug, Deserialize)]
struct ContactPage {
    contacts: Vec<Contact>,
    #[serde(default)]
    pages: u32,
}

#[derive(Debug, Deserialize)]
struct CreatedContact {
    contact: Contact,
}

#[derive(Debug, Deserialize)]
struct TemplateList {
    templates: Vec<MessageTemplate>,
}

#[derive(Debug, Serialize)]
struct ContactUpdate<'a> {
    name: &'a Option<String>,
    email: &'a Option<String>,
    tags: &'a [String],
    custom_fields: &'a BTreeMap<String, String>,
    last_interaction: Option<DateTime<Utc>>,
}

impl HttpCollaborators {
    pub fn new(config: &CollaboratorConfig) -> CollaboratorResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, builder: RequestBuilder, owner_id: Uuid) -> RequestBuilder {
        builder
            .bearer_auth(&self.api_token)
            .header(OWNER_HEADER, owner_id.to_string())
    }

    async fn fetch_contact_page(
        &self,
        owner_id: Uuid,
        page: u32,
        phone: Option<&str>,
    ) -> CollaboratorResult<ContactPage> {
        let mut query = vec![
            ("page", page.to_string()),
            ("per_page", CONTACTS_PAGE_SIZE.to_string()),
        ];
        if let Some(phone) = phone {
            query.push(("phone", phone.to_string()));
        }

        let response = self
            .authorized(self.client.get(self.url("/api/contacts")), owner_id)
            .query(&query)
            .send()
            .await?;

        Ok(expect_success(response, "Contacts").await?.json().await?)
    }
}

/// Map non-2xx responses onto `CollaboratorError`.
async fn expect_success(response: Response, resource: &str) -> CollaboratorResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(CollaboratorError::NotFound(resource.to_string()));
    }

    let body = response.text().await.unwrap_or_default();
    Err(CollaboratorError::Rejected {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl ContactStore for HttpCollaborators {
    async fn get(&self, owner_id: Uuid, contact_id: ContactId) -> CollaboratorResult<Contact> {
        let response = self
            .authorized(
                self.client.get(self.url(&format!("/api/contacts/{}", contact_id))),
                owner_id,
            )
            .send()
            .await?;

        let resource = format!("Contact {}", contact_id);
        let body: serde_json::Value = expect_success(response, &resource).await?.json().await?;

        // The collaborator wraps single contacts as `{contact: {...}}`; accept bare objects too.
        let contact = body.get("contact").cloned().unwrap_or(body);
        serde_json::from_value(contact).map_err(|e| CollaboratorError::Decode(e.to_string()))
    }

    async fn update(&self, owner_id: Uuid, contact: &Contact) -> CollaboratorResult<()> {
        let body = ContactUpdate {
            name: &contact.name,
            email: &contact.email,
            tags: &contact.tags,
            custom_fields: &contact.custom_fields,
            last_interaction: contact.last_interaction,
        };

        let response = self
            .authorized(
                self.client.put(self.url(&format!("/api/contacts/{}", contact.id))),
                owner_id,
            )
            .json(&body)
            .send()
            .await?;

        expect_success(response, &format!("Contact {}", contact.id)).await?;
        debug!("Updated contact {} for owner {}", contact.id, owner_id);
        Ok(())
    }

    async fn list(&self, owner_id: Uuid) -> CollaboratorResult<Vec<Contact>> {
        let mut contacts = Vec::new();
        let mut page = 1;

        loop {
            let batch = self.fetch_contact_page(owner_id, page, None).await?;
            let last_page = batch.pages.max(1);
            contacts.extend(batch.contacts);

            if page >= last_page {
                break;
            }
            page += 1;
        }

        Ok(contacts)
    }

    async fn find_or_create_by_phone(&self, owner_id: Uuid, phone: &str) -> CollaboratorResult<Contact> {
        let existing = self.fetch_contact_page(owner_id, 1, Some(phone)).await?;
        if let Some(contact) = existing.contacts.into_iter().find(|c| c.phone == phone) {
            return Ok(contact);
        }

        let response = self
            .authorized(self.client.post(self.url("/api/contacts")), owner_id)
            .json(&serde_json::json!({ "phone": phone }))
            .send()
            .await?;

        let created: CreatedContact = expect_success(response, "Contacts").await?.json().await?;
        debug!("Created contact {} for phone {}", created.contact.id, phone);
        Ok(created.contact)
    }
}

#[async_trait]
impl TemplateStore for HttpCollaborators {
    async fn get(&self, owner_id: Uuid, template_id: TemplateId) -> CollaboratorResult<Option<MessageTemplate>> {
        let response = self
            .authorized(self.client.get(self.url("/api/templates")), owner_id)
            .send()
            .await?;

        let list: TemplateList = expect_success(response, "Templates").await?.json().await?;
        Ok(list.templates.into_iter().find(|t| t.id == template_id))
    }
}

#[async_trait]
impl MessageDispatcher for HttpCollaborators {
    async fn send(&self, owner_id: Uuid, message: &OutboundMessage) -> CollaboratorResult<()> {
        let response = self
            .authorized(self.client.post(self.url("/api/messages/send")), owner_id)
            .json(message)
            .send()
            .await?;

        expect_success(response, &format!("Contact {}", message.contact_id)).await?;
        Ok(())
    }
}
