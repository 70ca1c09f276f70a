use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tokio::sync::watch;

use annotated_reader::backend::{Library, LoggingHooks};
use annotated_reader::config::Config;
use annotated_reader::db::KvStore;
use annotated_reader::legacy::{import_legacy_annotations, LegacyStore};
use annotated_reader::server;
use annotated_reader::services::{HypothesisClient, LibraryApiClient, PocketClient};
use annotated_reader::store::{Mutation, Query, SystemClock};
use annotated_reader::sync::{SyncEngine, SyncOptions};

const USAGE: &str = "usage: annotated-reader serve
       annotated-reader --sync
       annotated-reader --import-legacy <export.json>
       annotated-reader --sign-in <userId> <jwt>
       annotated-reader --query <methodName> [argsJson]
       annotated-reader --mutate <methodName> [argsJson]";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging (only show warnings and errors by default)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::load().context("loading configuration")?;

    let store = KvStore::open(&config.db_path)
        .await
        .with_context(|| format!("opening library at {}", config.db_path))?;
    let library = Arc::new(Library::new(store.clone(), Arc::new(SystemClock)));

    // Check for --sign-in flag before restoring the saved account
    if args.len() >= 4 && args[1] == "--sign-in" {
        config.account.user_id = Some(args[2].clone());
        config.account.jwt = Some(args[3].clone());
        config.save()?;
        let migrated = sign_in(&config, &library).await?;
        println!("Signed in as {}, moved {} local entries", args[2], migrated);
        return Ok(());
    }

    sign_in(&config, &library).await?;

    match args.get(1).map(String::as_str) {
        Some("serve") => serve(&config, library, store).await,
        Some("--sync") => {
            let engine = sync_engine(&config, library, store)?;
            let (highlights, articles) = engine.sync_all().await;
            println!("{}", serde_json::json!({ "hypothesis": highlights, "pocket": articles }));
            Ok(())
        }
        Some("--import-legacy") if args.len() >= 3 => {
            let legacy = LegacyStore::new(store);
            let path = PathBuf::from(&args[2]);
            let keys = legacy.load_export(&path).await?;
            let report = import_legacy_annotations(&library, &legacy).await?;
            println!(
                "Read {} legacy keys, imported {} articles and {} annotations",
                keys, report.articles, report.annotations
            );
            Ok(())
        }
        Some("--query") if args.len() >= 3 => {
            let query = Query::parse(&args[2], parse_args(args.get(3), Value::Array(Vec::new()))?)?;
            let result = library.query(&query).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Some("--mutate") if args.len() >= 3 => {
            let mutation = Mutation::parse(&args[2], parse_args(args.get(3), Value::Null)?)?;
            let result = library.mutate(mutation).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        _ => {
            eprintln!("{USAGE}");
            bail!("missing or incomplete command");
        }
    }
}

fn parse_args(raw: Option<&String>, default: Value) -> Result<Value> {
    match raw {
        Some(raw) => serde_json::from_str(raw).with_context(|| format!("arguments are not JSON: {raw}")),
        None => Ok(default),
    }
}

/// Route the library to the configured account, if any.
async fn sign_in(config: &Config, library: &Library) -> Result<usize> {
    let Some((user_id, jwt)) = config.signed_in_user() else {
        return Ok(0);
    };
    let remote = Arc::new(LibraryApiClient::new(&config.account.api_host, &jwt)?);
    let report = library
        .sign_in(&user_id, remote, &LoggingHooks)
        .await
        .with_context(|| format!("signing in as {user_id}"))?;
    Ok(report.migrated)
}

fn sync_engine(config: &Config, library: Arc<Library>, store: KvStore) -> Result<Arc<SyncEngine>> {
    let highlights = Arc::new(HypothesisClient::new(&config.sync.hypothesis_api_url)?);
    let articles = Arc::new(PocketClient::new(&config.sync.pocket_proxy_url)?);
    let engine = SyncEngine::new(library, highlights, articles, SyncOptions::from(&config.sync))
        .with_legacy(LegacyStore::new(store));
    Ok(Arc::new(engine))
}

async fn serve(config: &Config, library: Arc<Library>, store: KvStore) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    let engine = sync_engine(config, library.clone(), store)?;
    let every = Duration::from_secs(u64::from(config.sync.interval_minutes.max(1)) * 60);
    let scheduler = engine.spawn_periodic(every, shutdown_rx.clone());

    server::run(config, library, shutdown_rx)
        .await
        .with_context(|| format!("serving on {}", config.socket_path))?;
    let _ = scheduler.await;
    Ok(())
}
