use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: String,
    pub article_id: String,

    #[serde(default)]
    pub quote_text: Option<String>,
    /// Anchor descriptor owned by the page renderer; stored verbatim.
    #[serde(default)]
    pub quote_html_selector: Value,

    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub tags: Vec<String>,

    /// Unix milliseconds.
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,

    /// Id assigned by the remote annotation service once published.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub h_id: Option<String>,

    #[serde(default)]
    pub ai_created: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_score: Option<f64>,
}

impl Annotation {
    pub fn new(article_id: impl Into<String>, text: impl Into<String>, created_at: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            article_id: article_id.into(),
            quote_text: None,
            quote_html_selector: Value::Null,
            text: text.into(),
            tags: Vec::new(),
            created_at,
            updated_at: created_at,
            h_id: None,
            ai_created: false,
            ai_score: None,
        }
    }

    /// Published annotations are updated remotely; drafts are created.
    pub fn is_published(&self) -> bool {
        self.h_id.is_some()
    }

    pub fn modified_at(&self) -> i64 {
        self.updated_at.max(self.created_at)
    }

    /// AI suggestions are only uploaded once the user wrote something on them.
    pub fn should_upload(&self) -> bool {
        !self.ai_created || !self.text.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draft_until_remote_id_is_known() {
        let mut annotation = Annotation::new("art1", "foo", 10);
        assert!(!annotation.is_published());
        annotation.h_id = Some("h-1".into());
        assert!(annotation.is_published());
    }

    #[test]
    fn empty_ai_suggestions_are_not_uploaded() {
        let mut annotation = Annotation::new("art1", "", 10);
        annotation.ai_created = true;
        assert!(!annotation.should_upload());
        annotation.text = "kept".into();
        assert!(annotation.should_upload());
    }
}
