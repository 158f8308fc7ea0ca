//! HTTP control surface and orchestrator: `aira serve`.

use std::path::Path;
use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use aira::agent::Registry;
use aira::config::AiraConfig;
use aira::hitl::{AnswerHandler, HitlRouter, QuestionRouter};
use aira::messenger::{LogMessenger, SlackMessenger};
use aira::orchestrator::Orchestrator;
use aira::pubsub::BroadcastPubSub;
use aira::ratelimit::TenantRateLimiter;
use aira::server::{self, AppState};
use aira::store::{SqliteStore, Stores};
use aira_runtime::{ContainerRuntime, DockerRuntime, GitWorkspace, WorkspaceManager};

/// `db_path` value that keeps the database in memory.
const IN_MEMORY_DB: &str = ":memory:";

fn open_store(db_path: &Path) -> Result<SqliteStore> {
    if db_path.as_os_str() == IN_MEMORY_DB {
        return SqliteStore::new_in_memory();
    }
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    SqliteStore::new(db_path)
        .with_context(|| format!("Failed to open database: {}", db_path.display()))
}

pub async fn cmd_serve(config: AiraConfig) -> Result<()> {
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(
        DockerRuntime::connect(&config.runtime).context("Failed to connect to Docker")?,
    );
    let workspace: Arc<dyn WorkspaceManager> = Arc::new(GitWorkspace::new(
        runtime.clone(),
        &config.runtime.helper_image,
        &config.runtime.mount_path,
    ));

    let stores = Stores::from_store(Arc::new(open_store(&config.server.db_path)?));
    let bus = BroadcastPubSub::new();

    let mut router = HitlRouter::new(stores.questions.clone(), stores.sessions.clone(), &config.hitl)
        .with_messenger(Arc::new(LogMessenger));
    match &config.messengers.slack {
        Some(slack) if !slack.token.is_empty() => {
            router = router.with_messenger(Arc::new(SlackMessenger::new(
                &slack.token,
                slack.api_base.as_deref(),
            )));
        }
        _ if config.hitl.platform == "slack" => {
            warn!("hitl.platform is slack but no Slack token is configured");
        }
        _ => {}
    }
    let hitl = Arc::new(router);

    let registry = Arc::new(Registry::with_builtin(
        &config.agents,
        &config.runtime.image_default,
        config.runtime.stop_grace(),
    ));
    let orchestrator = Arc::new(
        Orchestrator::new(
            stores.clone(),
            Arc::new(bus.clone()),
            runtime,
            workspace,
            registry,
            hitl.clone() as Arc<dyn QuestionRouter>,
        )
        .with_stop_grace(config.runtime.stop_grace()),
    );
    let handler: Weak<dyn AnswerHandler> = Arc::<Orchestrator>::downgrade(&orchestrator);
    hitl.set_answer_handler(handler);

    orchestrator
        .recover()
        .await
        .context("Failed to recover sessions")?;

    let cancel = orchestrator.cancellation();
    let limiter = Arc::new(TenantRateLimiter::new(&config.rate_limit));
    let background = [
        hitl.start_timeout_watcher(cancel.clone()),
        limiter.spawn_sweeper(cancel.clone()),
    ];

    let state = Arc::new(AppState {
        stores,
        orchestrator: orchestrator.clone(),
        hitl,
        bus,
        hitl_platform: config.hitl.platform.clone(),
    });
    let app = server::build_router(state, limiter);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let served = server::serve(listener, app, shutdown_signal()).await;

    orchestrator.shutdown().await;
    for handle in background {
        if let Err(e) = handle.await {
            warn!("background task ended abnormally: {}", e);
        }
    }
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to install Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
