//! Email client: a per-account inbox via a vendor API, per spec.md §6.
//! Out of scope as a platform (§1); in scope as the trait boundary the
//! Receipt Processor (C7) is written against.

use async_trait::async_trait;
use serde::Deserialize;

pub type Result<T> = std::result::Result<T, crate::errors::EmailError>;

#[derive(Debug, Clone, Deserialize)]
pub struct EmailSummary {
    pub id: String,
    pub from_address: String,
    pub subject: String,
}

#[derive(Debug, Clone)]
pub struct EmailAttachment {
    pub id: String,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub id: String,
    pub from_address: String,
    pub attachments: Vec<EmailAttachment>,
}

#[async_trait]
pub trait EmailClient: Send + Sync {
    async fn list_inboxes(&self) -> Result<Vec<String>>;
    /// Emails newer than `since_id`, per inbox.
    async fn list_emails(&self, inbox: &str, since_id: Option<&str>) -> Result<Vec<EmailSummary>>;
    async fn fetch_email(&self, inbox: &str, email_id: &str) -> Result<EmailMessage>;
    async fn download_attachment(
        &self,
        inbox: &str,
        email_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>>;
}

pub struct HttpEmailClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpEmailClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl EmailClient for HttpEmailClient {
    async fn list_inboxes(&self) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct Resp {
            inboxes: Vec<String>,
        }
        let resp: Resp = self
            .client
            .get(format!("{}/inboxes", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await?
            .json()
            .await?;
        Ok(resp.inboxes)
    }

    async fn list_emails(&self, inbox: &str, since_id: Option<&str>) -> Result<Vec<EmailSummary>> {
        let mut request = self
            .client
            .get(format!("{}/inboxes/{}/emails", self.base_url, inbox))
            .bearer_auth(&self.api_key);
        if let Some(since) = since_id {
            request = request.query(&[("since", since)]);
        }
        let emails: Vec<EmailSummary> = request.send().await?.json().await?;
        Ok(emails)
    }

    async fn fetch_email(&self, inbox: &str, email_id: &str) -> Result<EmailMessage> {
        #[derive(Deserialize)]
        struct Resp {
            id: String,
            from_address: String,
            attachments: Vec<AttachmentMeta>,
        }
        #[derive(Deserialize)]
        struct AttachmentMeta {
            id: String,
            file_name: String,
        }
        let resp: Resp = self
            .client
            .get(format!(
                "{}/inboxes/{}/emails/{}",
                self.base_url, inbox, email_id
            ))
            .bearer_auth(&self.api_key)
            .send()
            .await?
            .json()
            .await?;

        let mut attachments = Vec::with_capacity(resp.attachments.len());
        for meta in resp.attachments {
            let bytes = self
                .download_attachment(inbox, email_id, &meta.id)
                .await?;
            attachments.push(EmailAttachment {
                id: meta.id,
                file_name: meta.file_name,
                bytes,
            });
        }

        Ok(EmailMessage {
            id: resp.id,
            from_address: resp.from_address,
            attachments,
        })
    }

    async fn download_attachment(
        &self,
        inbox: &str,
        email_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get(format!(
                "{}/inboxes/{}/emails/{}/attachments/{}",
                self.base_url, inbox, email_id, attachment_id
            ))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(crate::errors::EmailError::AttachmentNotFound(
                attachment_id.to_string(),
            ));
        }
        Ok(resp.bytes().await?.to_vec())
    }
}
