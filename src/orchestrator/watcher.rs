use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::{Map, Shared};
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::RecvError;
use tracing::debug;
use uuid::Uuid;

use super::Orchestrator;

/// Polling cadence of the completion watcher.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchTimings {
    /// Phase one: how many times to look for a persisted container id.
    pub container_id_attempts: u32,
    /// Phase one: attempt `n` sleeps `step + step·n`.
    pub container_id_step: Duration,
    /// How long to wait for the stream reader to drain after exit.
    pub stream_drain: Duration,
    /// Phase two polling interval.
    pub fallback_poll: Duration,
}

impl Default for WatchTimings {
    fn default() -> Self {
        Self {
            container_id_attempts: 10,
            container_id_step: Duration::from_millis(100),
            stream_drain: Duration::from_secs(10),
            fallback_poll: Duration::from_secs(5),
        }
    }
}

type StreamDone = Shared<Map<oneshot::Receiver<()>, fn(Result<(), RecvError>)>>;

enum Observed {
    /// The agent is gone; `Some` carries the failure message.
    Exited(Option<String>),
    /// Another path already finalized the session.
    Finalized,
}

pub(super) async fn watch(
    orchestrator: Arc<Orchestrator>,
    tenant_id: Uuid,
    session_id: Uuid,
    stream_done: oneshot::Receiver<()>,
) {
    let done: StreamDone = stream_done
        .map(drop as fn(Result<(), RecvError>))
        .shared();
    let cancel = orchestrator.cancel.clone();

    let observed = tokio::select! {
        _ = cancel.cancelled() => return,
        observed = observe(&orchestrator, tenant_id, session_id, done.clone()) => observed,
    };
    let Observed::Exited(error) = observed else {
        debug!(%session_id, "watcher stopping, session finalized elsewhere");
        return;
    };

    if tokio::time::timeout(orchestrator.timings.stream_drain, done)
        .await
        .is_err()
    {
        debug!(%session_id, "stream reader still draining, finalizing anyway");
    }
    orchestrator.complete(tenant_id, session_id, error).await;
}

async fn observe(
    orchestrator: &Orchestrator,
    tenant_id: Uuid,
    session_id: Uuid,
    done: StreamDone,
) -> Observed {
    let timings = &orchestrator.timings;
    let sessions = &orchestrator.stores.sessions;

    // Phase one: find the container and block on its exit.
    for attempt in 0..timings.container_id_attempts {
        match sessions.get_session(tenant_id, session_id).await {
            Ok(session) if session.status.is_terminal() => return Observed::Finalized,
            Ok(session) => {
                if let Some(container_id) = session.container_id.filter(|c| !c.is_empty()) {
                    return match orchestrator.runtime.wait(&container_id).await {
                        Ok(0) => Observed::Exited(None),
                        Ok(code) => Observed::Exited(Some(format!("agent exited with code {code}"))),
                        Err(e) => Observed::Exited(Some(e.to_string())),
                    };
                }
            }
            Err(e) => debug!(%session_id, "watcher poll failed: {}", e),
        }
        tokio::time::sleep(timings.container_id_step * (attempt + 1)).await;
    }

    // Phase two: no container id; watch the stream and the session instead.
    debug!(%session_id, "no container id persisted, polling session");
    let mut done = done;
    loop {
        tokio::select! {
            _ = &mut done => return Observed::Exited(None),
            _ = tokio::time::sleep(timings.fallback_poll) => {}
        }
        if !orchestrator.is_active(session_id) {
            return Observed::Finalized;
        }
        match sessions.get_session(tenant_id, session_id).await {
            Ok(session) if session.status.is_terminal() => return Observed::Finalized,
            Ok(_) => {}
            Err(e) => debug!(%session_id, "watcher poll failed: {}", e),
        }
    }
}
