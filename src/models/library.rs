use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub emoji: Option<String>,
    /// `None` for group topics.
    #[serde(default)]
    pub group_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tutorial_stage: Option<u32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signup_date: Option<String>,
    #[serde(default)]
    pub account_enabled: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A followed RSS feed. The id is the feed URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedSubscription {
    pub id: String,
    pub rss_url: String,
    #[serde(default)]
    pub link: Option<String>,
    /// Site the feed belongs to, as produced by `domain_of`.
    pub domain: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_frequency: Option<String>,
    #[serde(default)]
    pub time_added: i64,
    #[serde(default)]
    pub is_subscribed: bool,
    /// New feed items are looked for from here on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fetched: Option<i64>,
}

/// Marker left behind when a record that already exists remotely is deleted,
/// so the delete still reaches the remote service after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tombstone {
    /// Record family, e.g. `annotations` or `articles`.
    pub entity: String,
    pub id: String,
    pub remote_id: String,
    pub deleted_at: i64,
}

/// Partial update of a stored record: `id` plus the fields to overwrite.
/// A `null` field clears it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordUpdate {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl RecordUpdate {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(field.to_string(), value.into());
        self
    }

    /// Merge the fields into `record`, keeping its id.
    pub fn apply_to(&self, record: &mut Value) {
        if let Value::Object(map) = record {
            for (field, value) in &self.fields {
                if field != "id" {
                    map.insert(field.clone(), value.clone());
                }
            }
        }
    }
}
