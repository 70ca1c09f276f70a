use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AppError, Result};
use crate::models::{Article, SyncState};
use crate::sync::ArticlesRemote;

const PROVIDER: &str = "pocket";
const CONSUMER_KEY: &str = "106099-bc04e91092ca30bacd08f96";

#[derive(Debug, Serialize)]
struct GetRequest<'a> {
    consumer_key: &'a str,
    access_token: &'a str,
    /// Unix seconds.
    since: i64,
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    consumer_key: &'a str,
    access_token: &'a str,
    actions: Vec<Action<'a>>,
}

#[derive(Debug, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum Action<'a> {
    Add {
        url: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<&'a str>,
        time: String,
    },
    Archive {
        item_id: &'a str,
        time: String,
    },
    Readd {
        item_id: &'a str,
        time: String,
    },
    Delete {
        item_id: &'a str,
    },
}

impl<'a> Action<'a> {
    /// Saved articles are archived once read and re-added otherwise.
    fn upsert(article: &'a Article) -> Self {
        match &article.pocket_id {
            Some(item_id) if article.is_completed() => Self::Archive {
                item_id,
                time: article.modified_at().to_string(),
            },
            Some(item_id) => Self::Readd {
                item_id,
                time: article.modified_at().to_string(),
            },
            None => Self::Add {
                url: &article.url,
                title: article.title.as_deref(),
                time: article.time_added.to_string(),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    action_results: Vec<Value>,
}

impl SendResponse {
    fn item_id(&self, index: usize) -> Option<String> {
        match self.action_results.get(index)?.get("item_id")? {
            Value::String(id) => Some(id.clone()),
            Value::Number(id) => Some(id.to_string()),
            _ => None,
        }
    }
}

/// Read-it-later service, reached through the library's proxy endpoints.
pub struct PocketClient {
    client: Client,
    proxy_url: String,
}

impl PocketClient {
    pub fn new(proxy_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            proxy_url: proxy_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post<B: Serialize + ?Sized>(&self, op: &str, body: &B) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}/api/pocket/{}", self.proxy_url, op))
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::remote(
                PROVIDER,
                format!("{} failed with {}: {}", op, status, error_text),
            ));
        }
        Ok(response)
    }

    async fn send_actions(&self, state: &SyncState, actions: Vec<Action<'_>>) -> Result<SendResponse> {
        let request = SendRequest {
            consumer_key: CONSUMER_KEY,
            access_token: &state.api_token,
            actions,
        };
        Ok(self.post("send", &request).await?.json().await?)
    }
}

#[async_trait]
impl ArticlesRemote for PocketClient {
    async fn fetch_since(&self, state: &SyncState, since_ms: Option<i64>) -> Result<Vec<Article>> {
        let request = GetRequest {
            consumer_key: CONSUMER_KEY,
            access_token: &state.api_token,
            since: since_ms.unwrap_or(0) / 1000,
        };
        let items: Vec<Value> = self.post("get", &request).await?.json().await?;

        Ok(items
            .into_iter()
            .filter_map(|item| match serde_json::from_value::<Article>(item) {
                Ok(article) => Some(article),
                Err(e) => {
                    tracing::warn!("Skipping unreadable saved article: {}", e);
                    None
                }
            })
            .collect())
    }

    async fn upsert(&self, state: &SyncState, article: &Article) -> Result<Option<String>> {
        let response = self.send_actions(state, vec![Action::upsert(article)]).await?;
        Ok(response.item_id(0))
    }

    async fn delete(&self, state: &SyncState, remote_id: &str) -> Result<()> {
        self.send_actions(state, vec![Action::Delete { item_id: remote_id }])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn actions_follow_reading_state() {
        let mut article = Article::from_url("https://example.com/a", Some("A".into()), 1_000);
        assert_eq!(
            serde_json::to_value(Action::upsert(&article)).unwrap(),
            json!({ "action": "add", "url": "https://example.com/a", "title": "A", "time": "1000" })
        );

        article.pocket_id = Some("42".into());
        article.time_updated = Some(2_000);
        assert_eq!(
            serde_json::to_value(Action::upsert(&article)).unwrap(),
            json!({ "action": "readd", "item_id": "42", "time": "2000" })
        );

        article.reading_progress = 1.0;
        assert_eq!(
            serde_json::to_value(Action::upsert(&article)).unwrap(),
            json!({ "action": "archive", "item_id": "42", "time": "2000" })
        );
    }

    #[test]
    fn reads_item_ids_from_action_results() {
        let response: SendResponse = serde_json::from_value(json!({
            "status": 1,
            "action_results": [{ "item_id": 229279689 }, false]
        }))
        .unwrap();
        assert_eq!(response.item_id(0).as_deref(), Some("229279689"));
        assert_eq!(response.item_id(1), None);
    }
}
