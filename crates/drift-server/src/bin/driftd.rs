// SPDX-License-Identifier: Apache-2.0
//! Drift hub daemon.
//!
//! Loads `ServerConfig` from the per-user prefs file (writing defaults back
//! on first run), applies CLI overrides, and serves the TCP hub until
//! ctrl-c. Ships a tiny built-in hook set (a ticking counter per document)
//! so a bare `driftd` is immediately observable from a client.

use anyhow::{Context, Result};
use clap::Parser;
use drift_core::Value;
use drift_server::prefs::{FsPrefsStore, PrefsService};
use drift_server::{Hooks, Server, ServerConfig, TickContext};
use drift_store::FsDocStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Drift document-sync hub")]
struct Args {
    /// TCP port override (otherwise from prefs).
    #[arg(long)]
    port: Option<u16>,
    /// Directory for persisted documents; enables saving when set.
    #[arg(long)]
    store_dir: Option<PathBuf>,
    /// Document tick period override, in milliseconds.
    #[arg(long)]
    cycle_ms: Option<u64>,
    /// Keep documents ticking with zero subscribers.
    #[arg(long)]
    keep_alive: bool,
}

/// Demo behaviour: every document carries a counter bumped once per second
/// of simulated time, plus a private tick accumulator clients never see.
struct DemoHooks;

impl Hooks for DemoHooks {
    fn on_create(&self, name: &str) -> Result<Value> {
        info!(document = name, "creating demo document");
        let mut map = std::collections::BTreeMap::new();
        map.insert("count".to_owned(), Value::Int(0));
        map.insert("_elapsed_ms".to_owned(), Value::Int(0));
        Ok(Value::Object(map))
    }

    fn on_update(
        &self,
        _name: &str,
        state: &mut Value,
        _ctx: &mut TickContext,
        dt: Duration,
    ) -> Result<()> {
        let Some(map) = state.as_object_mut() else {
            return Ok(());
        };
        let elapsed = match map.get("_elapsed_ms") {
            Some(Value::Int(n)) => *n + dt.as_millis() as i64,
            _ => dt.as_millis() as i64,
        };
        map.insert("_elapsed_ms".to_owned(), Value::Int(elapsed % 1000));
        if let Some(Value::Int(count)) = map.get_mut("count") {
            *count += elapsed / 1000;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args = Args::parse();

    // Prefs (best-effort): missing config dir just means defaults.
    let prefs = FsPrefsStore::new().map(PrefsService::new).ok();
    let mut config: ServerConfig = prefs
        .as_ref()
        .and_then(|p| p.load("server").ok().flatten())
        .unwrap_or_default();

    // Persist defaults once so operators have a file to edit.
    if let Some(prefs) = &prefs {
        if let Err(err) = prefs.save("server", &config) {
            warn!(?err, "could not write prefs file");
        }
    }

    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(cycle_ms) = args.cycle_ms {
        config.cycle_ms = cycle_ms;
    }
    if args.keep_alive {
        config.keep_alive = true;
    }

    let store = match &args.store_dir {
        Some(dir) => {
            config.allow_save = true;
            let store = FsDocStore::new(dir.clone())
                .with_context(|| format!("open store at {}", dir.display()))?;
            Some(Arc::new(store) as Arc<dyn drift_store::DocStore>)
        }
        None => None,
    };

    let server = Server::new(config, Arc::new(DemoHooks), store);
    let listener = server.bind().await?;

    // Drain cleanly on ctrl-c.
    let drainer = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            drainer.shutdown().await;
        }
    });

    server.serve(listener).await?;
    info!("drift hub stopped");
    Ok(())
}
