use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use annotated_reader::backend::{Library, LoggingHooks};
use annotated_reader::db::KvStore;
use annotated_reader::error::Result;
use annotated_reader::services::{LibraryRemote, PendingMutation, PullResponse};
use annotated_reader::store::{ManualClock, Mutation, Query, ScanOptions};

#[derive(Default)]
struct RecordingRemote {
    pushed: Mutex<Vec<PendingMutation>>,
}

#[async_trait]
impl LibraryRemote for RecordingRemote {
    async fn push(&self, _space_id: &str, _client_id: &str, mutations: &[PendingMutation]) -> Result<()> {
        self.pushed.lock().extend_from_slice(mutations);
        Ok(())
    }

    async fn pull(&self, _space_id: &str, _client_id: &str, cookie: &Value) -> Result<PullResponse> {
        Ok(PullResponse {
            cookie: cookie.clone(),
            last_mutation_id: 0,
            patch: Vec::new(),
        })
    }
}

async fn library() -> Arc<Library> {
    let store = KvStore::open_in_memory().await.unwrap();
    Arc::new(Library::new(store, Arc::new(ManualClock::new(10_000))))
}

async fn mutate(library: &Library, method: &str, args: Value) -> Value {
    library.mutate(Mutation::parse(method, args).unwrap()).await.unwrap()
}

async fn put_article(library: &Library, id: &str) {
    let article = json!({ "id": id, "url": format!("https://example.com/{id}"), "time_added": 1_000 });
    mutate(library, "putArticleIfNotExists", article).await;
}

async fn put_annotation(library: &Library, id: &str, text: &str, created_at: i64) {
    let annotation = json!({
        "id": id,
        "article_id": "art1",
        "text": text,
        "created_at": created_at,
        "updated_at": created_at
    });
    mutate(library, "putAnnotation", annotation).await;
}

fn ids(records: &Value) -> Vec<String> {
    records
        .as_array()
        .unwrap()
        .iter()
        .map(|record| record["id"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn signing_in_moves_local_annotations_into_the_account() {
    let library = library().await;
    put_article(&library, "art1").await;
    put_annotation(&library, "A1", "foo", 1_000).await;
    put_annotation(&library, "A2", "bar", 2_000).await;

    let remote = Arc::new(RecordingRemote::default());
    let report = library.sign_in("u1", remote, &LoggingHooks).await.unwrap();
    assert_eq!(report.migrated, 3);

    let annotations = library
        .query(&Query::ListArticleAnnotations("art1".into()))
        .await
        .unwrap();
    let mut migrated = ids(&annotations);
    migrated.sort();
    assert_eq!(migrated, vec!["A1", "A2"]);
    let texts: Vec<&str> = annotations
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["text"].as_str().unwrap())
        .collect();
    assert!(texts.contains(&"foo") && texts.contains(&"bar"));

    assert_eq!(library.store().count("local").await.unwrap(), 0);
    assert_eq!(library.store().count("account/u1").await.unwrap(), 3);

    library.sign_out().await;
    let local = library
        .query(&Query::ListArticleAnnotations("art1".into()))
        .await
        .unwrap();
    assert_eq!(local, json!([]));
}

#[tokio::test]
async fn applying_the_same_record_twice_changes_nothing() {
    let library = library().await;
    put_article(&library, "art1").await;
    put_annotation(&library, "A1", "foo", 1_000).await;
    let once = library.scan(&ScanOptions::default()).await.unwrap();

    put_article(&library, "art1").await;
    put_annotation(&library, "A1", "foo", 1_000).await;
    let twice = library.scan(&ScanOptions::default()).await.unwrap();
    assert_eq!(once, twice);

    let remote = json!([{
        "id": "h-1", "article_id": "art1", "text": "remote",
        "created_at": 500, "updated_at": 600, "h_id": "h-1"
    }]);
    mutate(&library, "mergeRemoteAnnotations", remote.clone()).await;
    let merged_once = library.scan(&ScanOptions::default()).await.unwrap();
    mutate(&library, "mergeRemoteAnnotations", remote).await;
    let merged_twice = library.scan(&ScanOptions::default()).await.unwrap();
    assert_eq!(merged_once, merged_twice);
}

#[tokio::test]
async fn scans_are_ordered_by_key() {
    let library = library().await;
    for id in ["m", "b", "z", "a"] {
        mutate(&library, "putTopic", json!({ "id": id, "name": id })).await;
    }
    put_article(&library, "art1").await;

    let all = library.scan(&ScanOptions::default()).await.unwrap();
    let keys: Vec<&str> = all.iter().map(|(key, _)| key.as_str()).collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted);

    let topics = library.scan(&ScanOptions::prefix("topics/")).await.unwrap();
    let topic_keys: Vec<&str> = topics.iter().map(|(key, _)| key.as_str()).collect();
    assert_eq!(topic_keys, vec!["topics/a", "topics/b", "topics/m", "topics/z"]);
}

#[tokio::test]
async fn unchanged_results_are_delivered_once() {
    let library = library().await;
    put_article(&library, "art1").await;

    let mut subscription = library.subscribe(Query::ListArticleAnnotations("art1".into()));
    assert_eq!(subscription.next().await, Some(json!([])));

    mutate(&library, "putTopic", json!({ "id": "t1", "name": "Rust" })).await;
    mutate(&library, "updateSettings", json!({ "seen_onboarding": true })).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(subscription.try_next().is_none());

    put_annotation(&library, "A1", "foo", 1_000).await;
    let delivered = subscription.next().await.unwrap();
    assert_eq!(ids(&delivered), vec!["A1"]);
}
