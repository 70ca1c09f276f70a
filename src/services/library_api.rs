use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AppError, Result};

const PROVIDER: &str = "library";
const SCHEMA_VERSION: &str = "";

/// A queued mutation as it travels to the account store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    pub id: u64,
    pub name: String,
    pub args: Value,
    pub timestamp: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PushRequest<'a> {
    #[serde(rename = "clientID")]
    client_id: &'a str,
    mutations: &'a [PendingMutation],
    push_version: u32,
    schema_version: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest<'a> {
    #[serde(rename = "clientID")]
    client_id: &'a str,
    cookie: &'a Value,
    pull_version: u32,
    schema_version: &'a str,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    #[serde(default)]
    pub cookie: Value,
    #[serde(default, rename = "lastMutationID")]
    pub last_mutation_id: u64,
    #[serde(default)]
    pub patch: Vec<PatchOperation>,
}

/// Incremental change to the account namespace returned by a pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOperation {
    Put { key: String, value: Value },
    Del { key: String },
    Clear,
}

/// Push/pull endpoints of the account-backed store.
#[async_trait]
pub trait LibraryRemote: Send + Sync {
    async fn push(&self, space_id: &str, client_id: &str, mutations: &[PendingMutation]) -> Result<()>;

    async fn pull(&self, space_id: &str, client_id: &str, cookie: &Value) -> Result<PullResponse>;
}

pub struct LibraryApiClient {
    client: Client,
    api_host: String,
    jwt: String,
}

impl LibraryApiClient {
    pub fn new(api_host: &str, jwt: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            api_host: api_host.trim_end_matches('/').to_string(),
            jwt: jwt.to_string(),
        })
    }

    async fn post<B: Serialize + ?Sized>(&self, op: &str, space_id: &str, body: &B) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}/api/replicache/{}", self.api_host, op))
            .query(&[("spaceID", space_id)])
            .bearer_auth(&self.jwt)
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
}

#[async_trait]
impl LibraryRemote for LibraryApiClient {
    async fn push(&self, space_id: &str, client_id: &str, mutations: &[PendingMutation]) -> Result<()> {
        let request = PushRequest {
            client_id,
            mutations,
            push_version: 0,
            schema_version: SCHEMA_VERSION,
        };
        self.post("push", space_id, &request).await?;
        Ok(())
    }

    async fn pull(&self, space_id: &str, client_id: &str, cookie: &Value) -> Result<PullResponse> {
        let request = PullRequest {
            client_id,
            cookie,
            pull_version: 0,
            schema_version: SCHEMA_VERSION,
        };
        let response = self.post("pull", space_id, &request).await?;
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_pull_patch_operations() {
        let response: PullResponse = serde_json::from_value(json!({
            "cookie": 42,
            "lastMutationID": 7,
            "patch": [
                { "op": "clear" },
                { "op": "put", "key": "articles/a", "value": { "id": "a" } },
                { "op": "del", "key": "articles/b" }
            ]
        }))
        .unwrap();

        assert_eq!(response.cookie, json!(42));
        assert_eq!(response.last_mutation_id, 7);
        assert_eq!(
            response.patch,
            vec![
                PatchOperation::Clear,
                PatchOperation::Put {
                    key: "articles/a".into(),
                    value: json!({ "id": "a" })
                },
                PatchOperation::Del {
                    key: "articles/b".into()
                },
            ]
        );
    }

    #[test]
    fn push_body_uses_wire_field_names() {
        let mutations = vec![PendingMutation {
            id: 1,
            name: "putTopic".into(),
            args: json!({ "id": "t1", "name": "Rust" }),
            timestamp: 10,
        }];
        let body = serde_json::to_value(PushRequest {
            client_id: "c1",
            mutations: &mutations,
            push_version: 0,
            schema_version: SCHEMA_VERSION,
        })
        .unwrap();

        assert_eq!(body["clientID"], json!("c1"));
        assert_eq!(body["pushVersion"], json!(0));
        assert_eq!(body["mutations"][0]["name"], json!("putTopic"));
    }
}
