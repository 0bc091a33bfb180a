//! Command implementations. `Client` is the composition root: it owns the
//! transports and the running engine for the lifetime of one command.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_json::json;
use tracing::info;
use tsk_config::ClientConfig;
use tsk_reconcile::{fields_from_json, View};
use tsk_runtime::{spawn_engine, EngineConfig, MutationHandle, MutationOutcome, SyncHandle};
use tsk_transport::{
    HttpMutationTransport, MutationTransport, PaperServer, PushTransport, WireFormat,
    WsPushTransport,
};

pub struct Client {
    handle: SyncHandle,
}

impl Client {
    pub fn connect(cfg: &ClientConfig, paper: bool) -> Result<Self> {
        let engine_cfg = engine_config(cfg);

        let (mutations, push): (Arc<dyn MutationTransport>, Arc<dyn PushTransport>) = if paper {
            let server = Arc::new(PaperServer::new());
            (server.clone(), server)
        } else {
            let credential = tsk_config::resolve_credential(cfg);
            if !credential.is_present() {
                info!(env_var = %credential.env_var, "no bearer credential, connecting anonymously");
            }
            let format = WireFormat::parse(&cfg.push.wire_format)
                .with_context(|| format!("unsupported push.wire_format '{}'", cfg.push.wire_format))?;
            let http = HttpMutationTransport::new(
                cfg.api.base_url.clone(),
                credential.bearer(),
                cfg.api.request_timeout(),
            )
            .context("building HTTP transport")?;
            let ws = WsPushTransport::new(
                cfg.push.url.clone(),
                format,
                credential.bearer().map(str::to_string),
            );
            (Arc::new(http), Arc::new(ws))
        };

        let handle = spawn_engine(tsk_reconcile::ReconcileStore::new(), mutations, push, engine_cfg);
        Ok(Self { handle })
    }

    pub async fn shutdown(&self) {
        self.handle.shutdown().await;
    }
}

fn engine_config(cfg: &ClientConfig) -> EngineConfig {
    EngineConfig {
        queue_capacity: cfg.engine.queue_capacity,
        notice_capacity: cfg.engine.notice_capacity,
        request_timeout: cfg.api.request_timeout(),
        reconnect_delay: cfg.push.reconnect_delay(),
        resync_on_reconnect: cfg.push.resync_on_reconnect,
        // Commands resync explicitly so they can report failures.
        initial_resync: false,
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn render_view(view: &View) -> String {
    if view.is_empty() {
        return "(no tasks)".to_string();
    }
    view.iter()
        .map(|r| {
            let mark = if r.completed() { "x" } else { " " };
            let pending = if r.provisional { " (pending)" } else { "" };
            format!(
                "{}\t[{mark}] {}{pending}",
                r.identity,
                r.title().unwrap_or("")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Wait for the outcome; returns the server identity on confirmation.
async fn settle(m: MutationHandle) -> Result<String> {
    let kind = m.kind.as_str();
    match m.settled().await {
        MutationOutcome::Confirmed { identity } => {
            println!("{kind} confirmed: {identity}");
            Ok(identity)
        }
        MutationOutcome::Rejected(reason) => bail!("{kind} rolled back: {reason}"),
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

pub async fn list(client: &Client) -> Result<()> {
    client.handle.resync().await.context("fetching task list")?;
    println!("{}", render_view(&client.handle.view()));
    Ok(())
}

pub async fn watch(client: &Client) -> Result<()> {
    let mut views = client.handle.subscribe();
    let mut notices = client.handle.notices();
    client.handle.resync().await.context("fetching task list")?;

    loop {
        tokio::select! {
            changed = views.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let view = views.borrow_and_update().clone();
                println!("--- v{} ---\n{}", view.version(), render_view(&view));
            }
            notice = notices.recv() => {
                match notice {
                    Ok(n) => println!("! {}: {}", n.kind.as_str(), n.message),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        println!("! {n} notices skipped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

pub async fn add(client: &Client, title: &str) -> Result<String> {
    let m = client
        .handle
        .create(fields_from_json(json!({ "title": title, "completed": false })))
        .await?;
    let token = m.token.clone();
    let identity = settle(m).await?;
    println!("{identity}\t{token}");
    Ok(identity)
}

pub async fn set_completed(client: &Client, id: &str, completed: bool) -> Result<()> {
    // The intent needs the record in the view first.
    client.handle.resync().await.context("fetching task list")?;
    let m = client
        .handle
        .update(id, fields_from_json(json!({ "completed": completed })))
        .await?;
    settle(m).await.map(drop)
}

pub async fn remove(client: &Client, id: &str) -> Result<()> {
    client.handle.resync().await.context("fetching task list")?;
    let m = client.handle.delete(id).await?;
    settle(m).await.map(drop)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tsk_reconcile::{ReconcileStore, StoreEvent};

    #[test]
    fn render_marks_completed_and_pending() {
        let mut s = ReconcileStore::new();
        s.apply(StoreEvent::Resync(vec![tsk_reconcile::NormalizedRecord::new(
            "srv-1",
            fields_from_json(json!({"title": "Buy milk", "completed": true})),
        )]))
        .unwrap();
        s.apply(StoreEvent::LocalCreate {
            token: tsk_reconcile::CorrelationToken::new("T1"),
            fields: fields_from_json(json!({"title": "Call mom"})),
        })
        .unwrap();

        let out = render_view(&s.view());
        assert_eq!(out, "srv-1\t[x] Buy milk\nlocal-000001\t[ ] Call mom (pending)");
    }

    #[tokio::test]
    async fn add_reports_the_identity_of_its_own_create() -> Result<()> {
        let client = Client::connect(&ClientConfig::default(), true)?;
        assert_eq!(add(&client, "Buy milk").await?, "srv-1");
        // Same title again: a title lookup would find srv-1.
        assert_eq!(add(&client, "Buy milk").await?, "srv-2");
        client.shutdown().await;
        Ok(())
    }

    #[test]
    fn render_empty() {
        assert_eq!(render_view(&View::empty()), "(no tasks)");
    }

    #[test]
    fn engine_config_follows_client_config() {
        let mut cfg = ClientConfig::default();
        cfg.push.reconnect_delay_ms = 0;
        let e = engine_config(&cfg);
        assert_eq!(e.reconnect_delay, None);
        assert_eq!(e.request_timeout, cfg.api.request_timeout());
        assert!(!e.initial_resync);
    }
}
