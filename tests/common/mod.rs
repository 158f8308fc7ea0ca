//! In-process fakes for the runtime, workspace, and messenger seams, plus a
//! harness wiring them to a real orchestrator and HITL router.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use aira::agent::Registry;
use aira::config::HitlConfig;
use aira::errors::MessengerError;
use aira::hitl::{AnswerHandler, HitlRouter, QuestionRouter};
use aira::messenger::{Messenger, thread_id};
use aira::orchestrator::{Orchestrator, WatchTimings};
use aira::pubsub::{BroadcastPubSub, PubSubFrame};
use aira::store::{MemoryStore, Stores};
use aira_common::models::{AgentSession, Project, SessionStatus, Task, session_channel};
use aira_runtime::{ContainerRuntime, CreateOptions, LogStream, RuntimeError, WorkspaceManager};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use uuid::Uuid;

pub const MOUNT: &str = "/workspace";
pub const PLATFORM: &str = "test";

// ── Runtime ───────────────────────────────────────────────────────────

#[derive(Default)]
struct RuntimeState {
    next_id: usize,
    created: Vec<(String, CreateOptions)>,
    logs: HashMap<String, mpsc::Sender<Vec<u8>>>,
    exits: HashMap<String, watch::Sender<Option<i64>>>,
    stopped: Vec<String>,
    removed: Vec<String>,
    stdin: Vec<(String, String)>,
}

/// Containers that live until the test calls [`FakeRuntime::exit`] or
/// something stops them (exit code 143).
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
}

impl FakeRuntime {
    fn state(&self) -> std::sync::MutexGuard<'_, RuntimeState> {
        self.state.lock().unwrap()
    }

    pub fn container_for(&self, session_id: Uuid) -> String {
        self.state()
            .created
            .iter()
            .find(|(_, opts)| opts.session_id == session_id.to_string())
            .map(|(id, _)| id.clone())
            .expect("no container created for session")
    }

    pub fn created(&self) -> Vec<CreateOptions> {
        self.state().created.iter().map(|(_, o)| o.clone()).collect()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.state().stopped.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.state().removed.clone()
    }

    pub fn stdin(&self) -> Vec<(String, String)> {
        self.state().stdin.clone()
    }

    /// Print one line on the container's stdout.
    pub async fn emit(&self, id: &str, line: &str) {
        let tx = self.state().logs.get(id).cloned().expect("no log stream");
        tx.send(format!("{line}\n").into_bytes()).await.unwrap();
    }

    /// End the log stream and report `code` to waiters.
    pub fn exit(&self, id: &str, code: i64) {
        let mut state = self.state();
        state.logs.remove(id);
        if let Some(tx) = state.exits.get(id) {
            tx.send_if_modified(|current| {
                if current.is_none() {
                    *current = Some(code);
                    true
                } else {
                    false
                }
            });
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create_volume(&self, _name: &str) -> aira_runtime::Result<()> {
        Ok(())
    }

    async fn create(&self, opts: &CreateOptions) -> aira_runtime::Result<String> {
        let mut state = self.state();
        state.next_id += 1;
        let id = format!("agent-{}", state.next_id);
        state.created.push((id.clone(), opts.clone()));
        state.exits.insert(id.clone(), watch::channel(None).0);
        Ok(id)
    }

    async fn start(&self, _id: &str) -> aira_runtime::Result<()> {
        Ok(())
    }

    async fn stop(&self, id: &str, _grace: Duration) -> aira_runtime::Result<()> {
        self.state().stopped.push(id.to_string());
        self.exit(id, 143);
        Ok(())
    }

    async fn remove(&self, id: &str) -> aira_runtime::Result<()> {
        self.state().removed.push(id.to_string());
        Ok(())
    }

    async fn stream_logs(&self, id: &str) -> aira_runtime::Result<LogStream> {
        let (tx, rx) = mpsc::channel(64);
        self.state().logs.insert(id.to_string(), tx);
        Ok(rx)
    }

    async fn wait(&self, id: &str) -> aira_runtime::Result<i64> {
        let gone = || RuntimeError::Wait {
            id: id.to_string(),
            reason: "no such container".to_string(),
        };
        let mut rx = self
            .state()
            .exits
            .get(id)
            .map(|tx| tx.subscribe())
            .ok_or_else(gone)?;
        let code = *rx.wait_for(Option::is_some).await.map_err(|_| gone())?;
        Ok(code.unwrap_or(-1))
    }

    async fn exec_stdin(&self, id: &str, _cmd: &[String], stdin: &[u8]) -> aira_runtime::Result<()> {
        self.state()
            .stdin
            .push((id.to_string(), String::from_utf8_lossy(stdin).into_owned()));
        Ok(())
    }
}

// ── Workspace ─────────────────────────────────────────────────────────

/// Records every call; `diff` returns a fixed string.
#[derive(Default)]
pub struct FakeWorkspace {
    calls: Mutex<Vec<String>>,
    diff: String,
    fail_clone: bool,
}

impl FakeWorkspace {
    pub fn failing_clone() -> Self {
        Self {
            fail_clone: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn removed_trees(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter_map(|c| c.strip_prefix("remove_working_tree ").map(str::to_string))
            .collect()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl WorkspaceManager for FakeWorkspace {
    async fn ensure_volume(&self, volume: &str) -> aira_runtime::Result<()> {
        self.record(format!("ensure_volume {volume}"));
        Ok(())
    }

    async fn clone_repo(&self, volume: &str, repo_url: &str) -> aira_runtime::Result<()> {
        self.record(format!("clone_repo {volume} {repo_url}"));
        if self.fail_clone {
            return Err(RuntimeError::GitCommandFailed {
                command: "clone".to_string(),
                code: 128,
                output: "repository not found".to_string(),
            });
        }
        Ok(())
    }

    async fn fetch(&self, volume: &str) -> aira_runtime::Result<()> {
        self.record(format!("fetch {volume}"));
        Ok(())
    }

    async fn create_working_tree(
        &self,
        _volume: &str,
        branch: &str,
        base: &str,
    ) -> aira_runtime::Result<String> {
        self.record(format!("create_working_tree {branch} {base}"));
        Ok(format!("{MOUNT}/.worktrees/{branch}"))
    }

    async fn remove_working_tree(&self, _volume: &str, branch: &str) -> aira_runtime::Result<()> {
        self.record(format!("remove_working_tree {branch}"));
        Ok(())
    }

    async fn diff(&self, _volume: &str, branch: &str, base: &str) -> aira_runtime::Result<String> {
        self.record(format!("diff {branch} {base}"));
        Ok(self.diff.clone())
    }

    fn mount_path(&self) -> &str {
        MOUNT
    }
}

// ── Messenger ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingMessenger {
    posts: Mutex<Vec<(String, String)>>,
    threads: Mutex<Vec<String>>,
    thread_posts: Mutex<Vec<(String, String)>>,
}

impl RecordingMessenger {
    pub fn posts(&self) -> Vec<(String, String)> {
        self.posts.lock().unwrap().clone()
    }

    pub fn threads(&self) -> Vec<String> {
        self.threads.lock().unwrap().clone()
    }

    pub fn thread_posts(&self) -> Vec<(String, String)> {
        self.thread_posts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    fn platform(&self) -> &str {
        PLATFORM
    }

    async fn post_message(&self, channel: &str, text: &str) -> Result<String, MessengerError> {
        let mut posts = self.posts.lock().unwrap();
        posts.push((channel.to_string(), text.to_string()));
        Ok(format!("{}.0", posts.len()))
    }

    async fn create_thread(
        &self,
        channel: &str,
        parent_id: &str,
        _title: &str,
    ) -> Result<String, MessengerError> {
        let thread = thread_id(channel, parent_id);
        self.threads.lock().unwrap().push(thread.clone());
        Ok(thread)
    }

    async fn post_in_thread(&self, thread_id: &str, text: &str) -> Result<(), MessengerError> {
        self.thread_posts
            .lock()
            .unwrap()
            .push((thread_id.to_string(), text.to_string()));
        Ok(())
    }
}

// ── Harness ───────────────────────────────────────────────────────────

pub fn fast_timings() -> WatchTimings {
    WatchTimings {
        container_id_attempts: 10,
        container_id_step: Duration::from_millis(5),
        stream_drain: Duration::from_secs(1),
        fallback_poll: Duration::from_millis(20),
    }
}

pub fn hitl_config() -> HitlConfig {
    HitlConfig {
        platform: PLATFORM.to_string(),
        ..HitlConfig::default()
    }
}

pub struct Harness {
    pub tenant: Uuid,
    pub stores: Stores,
    pub bus: BroadcastPubSub,
    pub runtime: Arc<FakeRuntime>,
    pub workspace: Arc<FakeWorkspace>,
    pub messenger: Arc<RecordingMessenger>,
    pub hitl: Arc<HitlRouter>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(FakeWorkspace::default(), hitl_config())
    }

    pub fn build(workspace: FakeWorkspace, config: HitlConfig) -> Self {
        let stores = Stores::from_store(Arc::new(MemoryStore::new()));
        let bus = BroadcastPubSub::new();
        let runtime = Arc::new(FakeRuntime::default());
        let workspace = Arc::new(workspace);
        let messenger = Arc::new(RecordingMessenger::default());

        let hitl = Arc::new(
            HitlRouter::new(stores.questions.clone(), stores.sessions.clone(), &config)
                .with_messenger(messenger.clone()),
        );
        let registry = Arc::new(Registry::with_builtin(
            &BTreeMap::new(),
            "aira/agent:test",
            Duration::from_secs(1),
        ));
        let orchestrator = Arc::new(
            Orchestrator::new(
                stores.clone(),
                Arc::new(bus.clone()),
                runtime.clone(),
                workspace.clone(),
                registry,
                hitl.clone() as Arc<dyn QuestionRouter>,
            )
            .with_timings(fast_timings())
            .with_stop_grace(Duration::from_secs(1)),
        );
        let handler: Weak<dyn AnswerHandler> = Arc::<Orchestrator>::downgrade(&orchestrator);
        hitl.set_answer_handler(handler);

        Self {
            tenant: Uuid::new_v4(),
            stores,
            bus,
            runtime,
            workspace,
            messenger,
            hitl,
            orchestrator,
        }
    }

    pub async fn seed_task(&self) -> Task {
        let project = self
            .stores
            .projects
            .create_project(Project::new(
                self.tenant,
                "billing",
                "https://git.example.com/billing.git",
                None,
            ))
            .await
            .unwrap();
        self.stores
            .tasks
            .create_task(Task::new(
                self.tenant,
                project.id,
                "Add invoices table",
                "Store invoices in the database",
            ))
            .await
            .unwrap()
    }

    /// Poll the store until the session reaches `status`.
    pub async fn wait_for_status(&self, session_id: Uuid, status: SessionStatus) -> AgentSession {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let session = self
                .stores
                .sessions
                .get_session(self.tenant, session_id)
                .await
                .unwrap();
            if session.status == status {
                return session;
            }
            assert!(
                Instant::now() < deadline,
                "session stuck in {} waiting for {}",
                session.status,
                status
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Every payload published on the session's channel, collected until a
/// short quiet period after the first `session_completed` (or a deadline).
pub async fn session_events(
    rx: &mut broadcast::Receiver<PubSubFrame>,
    session_id: Uuid,
) -> Vec<Value> {
    let channel = session_channel(session_id);
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut events: Vec<Value> = Vec::new();
    loop {
        let completed = events.iter().any(|e| e["type"] == "session_completed");
        let wait = if completed {
            Duration::from_millis(200)
        } else {
            deadline.saturating_duration_since(Instant::now())
        };
        match tokio::time::timeout(wait, rx.recv()).await {
            Ok(Ok(frame)) if frame.channel == channel => {
                events.push(serde_json::from_slice(&frame.payload).unwrap());
            }
            Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => break,
        }
    }
    events
}

pub fn completions(events: &[Value]) -> Vec<&Value> {
    events
        .iter()
        .filter(|e| e["type"] == "session_completed")
        .collect()
}
