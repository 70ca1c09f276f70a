use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AppError, Result};
use crate::models::{url_hash, Annotation, Article, SyncState};
use crate::sync::{HighlightPage, HighlightsRemote, RemoteHighlight};

const PROVIDER: &str = "hypothesis";
const PAGE_SIZE: usize = 200;

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    rows: Vec<Row>,
}

#[derive(Debug, Deserialize)]
struct Row {
    id: String,
    uri: String,
    created: String,
    #[serde(default)]
    updated: Option<String>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    target: Vec<Target>,
    #[serde(default)]
    document: Document,
}

#[derive(Debug, Default, Deserialize)]
struct Target {
    #[serde(default)]
    selector: Option<Vec<Value>>,
}

#[derive(Debug, Default, Deserialize)]
struct Document {
    #[serde(default)]
    title: Vec<String>,
}

#[derive(Debug, Serialize)]
struct Permissions {
    read: Vec<String>,
}

#[derive(Debug, Serialize)]
struct CreateTarget<'a> {
    source: &'a str,
    #[serde(skip_serializing_if = "is_missing")]
    selector: &'a Value,
}

fn is_missing(selector: &&Value) -> bool {
    selector.is_null()
}

#[derive(Debug, Serialize)]
struct CreateDocument {
    title: Vec<String>,
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    uri: &'a str,
    text: &'a str,
    target: Vec<CreateTarget<'a>>,
    document: CreateDocument,
    tags: &'a [String],
    permissions: Permissions,
    references: Vec<String>,
}

#[derive(Debug, Serialize)]
struct UpdateRequest<'a> {
    text: &'a str,
    tags: &'a [String],
    permissions: Permissions,
}

#[derive(Debug, Deserialize)]
struct CreatedAnnotation {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Profile {
    #[serde(default)]
    userid: Option<String>,
}

fn millis(timestamp: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(timestamp)
        .ok()
        .map(|at| at.timestamp_millis())
}

impl SearchResponse {
    fn into_page(self) -> HighlightPage {
        let next_cursor = self.rows.last().map(Row::cursor);
        let highlights = self
            .rows
            .into_iter()
            .filter_map(|row| {
                let id = row.id.clone();
                let highlight = row.into_highlight();
                if highlight.is_none() {
                    tracing::warn!("Skipping unreadable remote annotation {}", id);
                }
                highlight
            })
            .collect();
        HighlightPage {
            highlights,
            next_cursor,
        }
    }
}

impl Row {
    /// Server-side `updated` value, used as the pagination cursor.
    fn cursor(&self) -> String {
        self.updated.clone().unwrap_or_else(|| self.created.clone())
    }

    fn into_highlight(self) -> Option<RemoteHighlight> {
        let created_at = millis(&self.created)?;
        let updated_at = self.updated.as_deref().and_then(millis).unwrap_or(created_at);
        let selector = self
            .target
            .into_iter()
            .next()
            .and_then(|target| target.selector)
            .unwrap_or_default();
        let quote_text = selector
            .iter()
            .find(|s| s.get("type").and_then(Value::as_str) == Some("TextQuoteSelector"))
            .and_then(|s| s.get("exact"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let annotation = Annotation {
            id: self.id.clone(),
            article_id: url_hash(&self.uri),
            quote_text,
            quote_html_selector: Value::Array(selector),
            text: self.text,
            tags: self.tags,
            created_at,
            updated_at,
            h_id: Some(self.id),
            ai_created: false,
            ai_score: None,
        };
        Some(RemoteHighlight {
            annotation,
            page_url: self.uri,
            page_title: self.document.title.into_iter().next(),
        })
    }
}

/// Extract the account name from a `acct:<name>@hypothes.is` user id.
fn username_from_userid(userid: &str) -> Option<String> {
    let account_re = Regex::new(r"([^:]+)@").ok()?;
    account_re
        .captures(userid)
        .and_then(|cap| cap.get(1))
        .map(|m| m.as_str().to_string())
}

pub struct HypothesisClient {
    client: Client,
    api_url: String,
}

impl HypothesisClient {
    pub fn new(api_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
        })
    }

    fn account(state: &SyncState) -> Result<String> {
        state
            .username
            .as_ref()
            .map(|name| format!("acct:{name}@hypothes.is"))
            .ok_or_else(|| AppError::remote(PROVIDER, "username unknown"))
    }

    fn private_to(state: &SyncState) -> Result<Permissions> {
        Ok(Permissions {
            read: vec![Self::account(state)?],
        })
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::remote(
                PROVIDER,
                format!("{} failed with {}: {}", what, status, error_text),
            ));
        }
        Ok(response)
    }
}

#[async_trait]
impl HighlightsRemote for HypothesisClient {
    async fn search_page(&self, state: &SyncState, cursor: &str) -> Result<HighlightPage> {
        let account = Self::account(state)?;
        let request = self
            .client
            .get(format!("{}/search", self.api_url))
            .bearer_auth(&state.api_token)
            .query(&[
                ("limit", PAGE_SIZE.to_string().as_str()),
                ("sort", "updated"),
                ("order", "asc"),
                ("search_after", cursor),
                ("user", account.as_str()),
            ]);
        let response: SearchResponse = self.send(request, "search").await?.json().await?;
        Ok(response.into_page())
    }

    async fn create(&self, state: &SyncState, annotation: &Annotation, article: &Article) -> Result<String> {
        let body = CreateRequest {
            uri: &article.url,
            text: &annotation.text,
            target: vec![CreateTarget {
                source: &article.url,
                selector: &annotation.quote_html_selector,
            }],
            document: CreateDocument {
                title: vec![article.title.clone().unwrap_or_default()],
            },
            tags: &annotation.tags,
            permissions: Self::private_to(state)?,
            references: Vec::new(),
        };
        let request = self
            .client
            .post(format!("{}/annotations", self.api_url))
            .bearer_auth(&state.api_token)
            .json(&body);
        let created: CreatedAnnotation = self.send(request, "create").await?.json().await?;
        Ok(created.id)
    }

    async fn update(&self, state: &SyncState, annotation: &Annotation) -> Result<()> {
        let h_id = annotation
            .h_id
            .as_deref()
            .ok_or_else(|| AppError::invalid_argument("update", "annotation was never published"))?;
        let body = UpdateRequest {
            text: &annotation.text,
            tags: &annotation.tags,
            permissions: Self::private_to(state)?,
        };
        let request = self
            .client
            .patch(format!("{}/annotations/{}", self.api_url, h_id))
            .bearer_auth(&state.api_token)
            .json(&body);
        self.send(request, "update").await?;
        Ok(())
    }

    async fn delete(&self, state: &SyncState, remote_id: &str) -> Result<()> {
        let response = self
            .client
            .delete(format!("{}/annotations/{}", self.api_url, remote_id))
            .bearer_auth(&state.api_token)
            .send()
            .await?;

        // Already gone remotely counts as deleted.
        if response.status() == StatusCode::NOT_FOUND || response.status().is_success() {
            return Ok(());
        }
        let status = response.status();
        let error_text = response.text().await.unwrap_or_default();
        Err(AppError::remote(
            PROVIDER,
            format!("delete failed with {}: {}", status, error_text),
        ))
    }

    async fn username(&self, api_token: &str) -> Result<Option<String>> {
        let request = self
            .client
            .get(format!("{}/profile", self.api_url))
            .bearer_auth(api_token);
        let profile: Profile = self.send(request, "profile").await?.json().await?;
        Ok(profile.userid.as_deref().and_then(username_from_userid))
    }
}
