//! Push pump: keeps a push subscription alive and forwards its frames.
//!
//! Never touches the store. Frames go into the engine queue in arrival
//! order; connection changes are reported so the engine can resync.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tsk_transport::PushTransport;

use crate::engine::Inbound;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PushStatus {
    /// `reconnect` is false for the first successful connection.
    Connected { reconnect: bool },
    Disconnected(String),
}

/// Forward `msg`; `false` once the engine is gone.
async fn forward(inbound: &mpsc::WeakSender<Inbound>, msg: Inbound) -> bool {
    match inbound.upgrade() {
        Some(tx) => tx.send(msg).await.is_ok(),
        None => false,
    }
}

pub(crate) fn spawn_push_pump(
    push: Arc<dyn PushTransport>,
    inbound: mpsc::WeakSender<Inbound>,
    mut stop: watch::Receiver<()>,
    reconnect_delay: Option<Duration>,
) {
    tokio::spawn(async move {
        let mut connected_before = false;
        loop {
            let subscribed = tokio::select! {
                r = push.subscribe() => r,
                _ = stop.changed() => return,
            };

            match subscribed {
                Ok(mut stream) => {
                    let status = PushStatus::Connected {
                        reconnect: connected_before,
                    };
                    connected_before = true;
                    if !forward(&inbound, Inbound::PushStatus(status)).await {
                        return;
                    }
                    loop {
                        let frame = tokio::select! {
                            f = stream.next() => f,
                            _ = stop.changed() => return,
                        };
                        let Some(frame) = frame else { break };
                        if !forward(&inbound, Inbound::Push(frame)).await {
                            return;
                        }
                    }
                    info!(transport = push.name(), "push stream ended");
                    let status = PushStatus::Disconnected("push stream ended".to_string());
                    if !forward(&inbound, Inbound::PushStatus(status)).await {
                        return;
                    }
                }
                Err(e) => {
                    warn!(transport = push.name(), error = %e, "push subscribe failed");
                    let status = PushStatus::Disconnected(format!("subscribe failed: {e}"));
                    if !forward(&inbound, Inbound::PushStatus(status)).await {
                        return;
                    }
                }
            }

            let Some(delay) = reconnect_delay else {
                info!("push reconnect disabled");
                return;
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop.changed() => return,
            }
        }
    });
}
