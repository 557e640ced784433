//! Microsoft Graph mailbox adapter.
//!
//! Endpoints used:
//! - `GET  /me/mailFolders/{id}/messages` (newest first, paged via `@odata.nextLink`)
//! - `GET  /me/mailFolders` and `GET /me/mailFolders/{id}/childFolders`
//! - `POST /me/mailFolders` and `POST /me/mailFolders/{id}/childFolders`
//! - `POST /me/messages/{id}/move`, or `/me/mailFolders/{src}/messages/{id}/move`
//! - `GET` + `PATCH /me/messages/{id}` for categories
//!
//! Token acquisition is out of scope; the adapter takes a bearer token.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;

use crate::config::env_opt;
use crate::error::{ConfigError, StoreError};
use crate::pipeline::types::{ContentType, Email, EmailBody};
use crate::store::traits::{FolderEntry, MailboxStore, MessageQuery};

pub const DEFAULT_GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";

/// Per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Graph caps `$top` for messages.
const MAX_PAGE_SIZE: usize = 50;

const MESSAGE_FIELDS: &str =
    "id,parentFolderId,subject,receivedDateTime,body,sender,from,importance,categories,flag";

const FOLDER_FIELDS: &str = "id,displayName,parentFolderId";

/// Graph connection settings.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub access_token: SecretString,
    pub base_url: String,
}

impl GraphConfig {
    /// Build config from `GRAPH_ACCESS_TOKEN` and optional `GRAPH_BASE_URL`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let token = env_opt("GRAPH_ACCESS_TOKEN")
            .ok_or_else(|| ConfigError::MissingEnvVar("GRAPH_ACCESS_TOKEN".into()))?;
        Ok(Self {
            access_token: SecretString::from(token),
            base_url: env_opt("GRAPH_BASE_URL").unwrap_or_else(|| DEFAULT_GRAPH_BASE_URL.into()),
        })
    }
}

/// Mailbox store backed by Microsoft Graph.
pub struct GraphMailbox {
    client: reqwest::Client,
    base_url: Url,
    token: SecretString,
}

impl GraphMailbox {
    pub fn new(config: &GraphConfig) -> Result<Self, ConfigError> {
        let base_url = Url::parse(config.base_url.trim_end_matches('/')).map_err(|e| {
            ConfigError::InvalidValue {
                key: "GRAPH_BASE_URL".into(),
                message: e.to_string(),
            }
        })?;
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                key: "GRAPH_BASE_URL".into(),
                message: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            base_url,
            token: config.access_token.clone(),
        })
    }

    /// Base URL plus percent-encoded path segments.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<Value>,
    ) -> Result<T, StoreError> {
        let mut request = self
            .client
            .request(method.clone(), url.clone())
            .bearer_auth(self.token.expose_secret());
        if let Some(body) = body {
            request = request.json(&body);
        }

        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let text = resp.text().await.unwrap_or_default();
            debug!(%method, path = url.path(), status = status.as_u16(), "Graph request failed");
            return Err(StoreError::from_status(status.as_u16(), graph_error_message(&text), retry_after));
        }

        let text = resp.text().await?;
        let text = if text.trim().is_empty() { "null" } else { text.as_str() };
        serde_json::from_str(text).map_err(|e| StoreError::InvalidResponse(e.to_string()))
    }

    async fn get_paged<T: DeserializeOwned>(&self, mut url: Url, limit: usize) -> Result<Vec<T>, StoreError> {
        let mut items = Vec::new();
        loop {
            let page: Page<T> = self.send(Method::GET, url, None).await?;
            items.extend(page.value);
            match page.next_link {
                Some(next) if items.len() < limit => {
                    url = Url::parse(&next).map_err(|e| StoreError::InvalidResponse(e.to_string()))?;
                }
                _ => break,
            }
        }
        items.truncate(limit);
        Ok(items)
    }

    async fn messages_in(&self, folder_id: &str, query: &MessageQuery) -> Result<Vec<Email>, StoreError> {
        let limit = query.limit;
        let mut url = self.url(&["me", "mailFolders", folder_id, "messages"]);
        url.query_pairs_mut()
            .append_pair("$top", &limit.clamp(1, MAX_PAGE_SIZE).to_string())
            .append_pair("$select", MESSAGE_FIELDS)
            .append_pair("$orderby", "receivedDateTime desc");
        if let Some(filter) = message_filter(query) {
            url.query_pairs_mut().append_pair("$filter", &filter);
        }
        let raw: Vec<GraphMessage> = self.get_paged(url, limit).await?;
        Ok(raw.into_iter().map(|m| m.into_email(folder_id)).collect())
    }

    async fn child_folders(&self, parent: Option<&str>) -> Result<Vec<FolderEntry>, StoreError> {
        let mut url = match parent {
            Some(id) => self.url(&["me", "mailFolders", id, "childFolders"]),
            None => self.url(&["me", "mailFolders"]),
        };
        url.query_pairs_mut()
            .append_pair("$top", "100")
            .append_pair("$select", FOLDER_FIELDS);
        let raw: Vec<GraphFolder> = self.get_paged(url, usize::MAX).await?;
        Ok(raw
            .into_iter()
            .map(|f| FolderEntry {
                id: f.id,
                name: f.display_name,
                parent: parent.map(str::to_string),
            })
            .collect())
    }
}

#[async_trait]
impl MailboxStore for GraphMailbox {
    async fn list_messages(&self, query: &MessageQuery) -> Result<Vec<Email>, StoreError> {
        let mut messages = self.messages_in(&query.folder_id, query).await?;
        if !query.include_subfolders {
            return Ok(messages);
        }

        // Breadth-first over descendants; one request per folder.
        let mut pending = vec![query.folder_id.clone()];
        while let Some(folder) = pending.pop() {
            for child in self.child_folders(Some(folder.as_str())).await? {
                messages.extend(self.messages_in(&child.id, query).await?);
                pending.insert(0, child.id);
            }
        }
        messages.sort_by_key(|m| std::cmp::Reverse(m.received_at));
        messages.truncate(query.limit);
        Ok(messages)
    }

    async fn list_folders(&self, parent: Option<&str>) -> Result<Vec<FolderEntry>, StoreError> {
        self.child_folders(parent).await
    }

    async fn create_folder(&self, parent: Option<&str>, name: &str) -> Result<FolderEntry, StoreError> {
        let url = match parent {
            Some(id) => self.url(&["me", "mailFolders", id, "childFolders"]),
            None => self.url(&["me", "mailFolders"]),
        };
        let created: GraphFolder = self
            .send(Method::POST, url, Some(json!({ "displayName": name })))
            .await?;
        Ok(FolderEntry {
            id: created.id,
            name: created.display_name,
            parent: parent.map(str::to_string),
        })
    }

    async fn move_message(
        &self,
        message_id: &str,
        target_folder_id: &str,
        via_folder: Option<&str>,
    ) -> Result<String, StoreError> {
        let url = match via_folder {
            Some(folder) => self.url(&["me", "mailFolders", folder, "messages", message_id, "move"]),
            None => self.url(&["me", "messages", message_id, "move"]),
        };
        let moved: IdOnly = self
            .send(Method::POST, url, Some(json!({ "destinationId": target_folder_id })))
            .await?;
        Ok(moved.id.unwrap_or_else(|| message_id.to_string()))
    }

    async fn tag_message(&self, message_id: &str, tag: &str) -> Result<(), StoreError> {
        let mut url = self.url(&["me", "messages", message_id]);
        url.query_pairs_mut().append_pair("$select", "categories");
        let current: Categories = self.send(Method::GET, url, None).await?;

        if current.categories.iter().any(|c| c.eq_ignore_ascii_case(tag)) {
            return Ok(());
        }
        let mut categories = current.categories;
        categories.push(tag.to_string());

        let url = self.url(&["me", "messages", message_id]);
        let _: Value = self
            .send(Method::PATCH, url, Some(json!({ "categories": categories })))
            .await?;
        Ok(())
    }
}

// ── Wire format ─────────────────────────────────────────────────────

#[derive(Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphFolder {
    id: String,
    display_name: String,
}

#[derive(Deserialize)]
struct IdOnly {
    id: Option<String>,
}

#[derive(Deserialize)]
struct Categories {
    #[serde(default)]
    categories: Vec<String>,
    flag: Option<GraphFlag>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphFlag {
    flag_status: Option<String>,
}

impl GraphFlag {
    fn is_flagged(&self) -> bool {
        self.flag_status
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("flagged"))
    }
}

#[derive(Deserialize)]
struct GraphAddress {
    address: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphRecipient {
    email_address: Option<GraphAddress>,
}

impl GraphRecipient {
    fn address(&self) -> String {
        self.email_address
            .as_ref()
            .and_then(|a| a.address.as_deref())
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphBody {
    content_type: Option<String>,
    content: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    id: String,
    parent_folder_id: Option<String>,
    subject: Option<String>,
    received_date_time: Option<DateTime<Utc>>,
    body: Option<GraphBody>,
    sender: Option<GraphRecipient>,
    from: Option<GraphRecipient>,
    importance: Option<String>,
    #[serde(default)]
    categories: Vec<String>,
}

impl GraphMessage {
    fn into_email(self, fetched_from: &str) -> Email {
        let sender = self.sender.as_ref().map(GraphRecipient::address).unwrap_or_default();
        let from = self
            .from
            .as_ref()
            .map(GraphRecipient::address)
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| sender.clone());
        let body = self
            .body
            .map(|b| EmailBody {
                content_type: ContentType::parse(b.content_type.as_deref().unwrap_or("text")),
                content: b.content.unwrap_or_default(),
            })
            .unwrap_or_default();

        Email {
            id: self.id,
            subject: self.subject.unwrap_or_default(),
            sender,
            from,
            body,
            received_at: self.received_date_time,
            importance: self.importance.unwrap_or_else(|| "normal".into()),
            tags: self.categories,
            flagged: self.flag.as_ref().is_some_and(GraphFlag::is_flagged),
            folder_id: self.parent_folder_id.unwrap_or_else(|| fetched_from.to_string()),
        }
    }
}

/// OData filter excluding messages that carry `tag`.
fn exclude_tag_filter(tag: &str) -> String {
    format!("not(categories/any(c:c eq '{}'))", tag.replace('\'', "''"))
}

/// Combined `$filter` for a message query, if it needs one.
fn message_filter(query: &MessageQuery) -> Option<String> {
    let mut clauses = Vec::new();
    if let Some(tag) = query.exclude_tag.as_deref() {
        clauses.push(exclude_tag_filter(tag));
    }
    if query.skip_flagged {
        clauses.push("flag/flagStatus eq 'notFlagged'".to_string());
    }
    (!clauses.is_empty()).then(|| clauses.join(" and "))
}

/// Pull `error.message` out of a Graph error body, falling back to the raw text.
fn graph_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.chars().take(300).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mailbox() -> GraphMailbox {
        GraphMailbox::new(&GraphConfig {
            access_token: SecretString::from("token"),
            base_url: DEFAULT_GRAPH_BASE_URL.into(),
        })
        .unwrap()
    }

    #[test]
    fn url_encodes_ids() {
        let url = mailbox().url(&["me", "messages", "AAMk/abc=+", "move"]);
        assert_eq!(
            url.as_str(),
            "https://graph.microsoft.com/v1.0/me/messages/AAMk%2Fabc=+/move"
        );
    }

    #[test]
    fn filter_escapes_quotes() {
        assert_eq!(
            exclude_tag_filter("Bob's"),
            "not(categories/any(c:c eq 'Bob''s'))"
        );
    }

    #[test]
    fn filter_combines_tag_and_flag_clauses() {
        let query = MessageQuery::new("inbox", 10);
        assert_eq!(message_filter(&query), None);

        let query = query.excluding_tag("Categorized").skipping_flagged(true);
        assert_eq!(
            message_filter(&query).as_deref(),
            Some("not(categories/any(c:c eq 'Categorized')) and flag/flagStatus eq 'notFlagged'")
        );
    }

    #[test]
    fn error_message_from_graph_body() {
        let body = r#"{"error":{"code":"ErrorItemNotFound","message":"The specified object was not found in the store."}}"#;
        assert_eq!(
            graph_error_message(body),
            "The specified object was not found in the store."
        );
        assert_eq!(graph_error_message("plain failure"), "plain failure");
    }

    #[test]
    fn message_maps_to_email() {
        let raw = r#"{
            "id": "AAMk1",
            "parentFolderId": "inbox-id",
            "subject": "Hello",
            "receivedDateTime": "2026-03-01T10:00:00Z",
            "body": {"contentType": "html", "content": "<p>Hi</p>"},
            "sender": {"emailAddress": {"name": "Boss", "address": "Boss@Acme.com"}},
            "importance": "high",
            "categories": ["Categorized"],
            "flag": {"flagStatus": "flagged"}
        }"#;
        let email = serde_json::from_str::<GraphMessage>(raw).unwrap().into_email("inbox");
        assert_eq!(email.sender, "boss@acme.com");
        assert_eq!(email.from, "boss@acme.com");
        assert_eq!(email.body.content_type, ContentType::Html);
        assert_eq!(email.folder_id, "inbox-id");
        assert_eq!(email.importance, "high");
        assert!(email.has_tag("categorized"));
        assert!(email.received_at.is_some());
        assert!(email.flagged);
    }

    #[test]
    fn page_without_next_link() {
        let page: Page<GraphFolder> =
            serde_json::from_str(r#"{"value":[{"id":"1","displayName":"Inbox"}]}"#).unwrap();
        assert_eq!(page.value.len(), 1);
        assert!(page.next_link.is_none());
    }
}
