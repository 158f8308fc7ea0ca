//! [`ContainerRuntime`] over the Docker Engine API.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::HostConfig;
use bollard::volume::CreateVolumeOptions;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::RuntimeConfig;
use crate::container::{ContainerRuntime, CreateOptions, LogStream};
use crate::error::{Result, RuntimeError};
use crate::limits::{CPU_PERIOD, ResourceLimits};

/// Seconds bollard waits on a single API request.
const DOCKER_TIMEOUT_SECS: u64 = 120;

/// Buffered log chunks per stream before the forwarder applies backpressure.
const LOG_BUFFER: usize = 256;

/// Label stamped on every container this runtime creates.
pub const MANAGED_LABEL: &str = "io.aira.managed";

pub struct DockerRuntime {
    docker: Docker,
    limits: ResourceLimits,
    network_mode: String,
}

impl DockerRuntime {
    pub fn new(docker: Docker, limits: ResourceLimits, network_mode: &str) -> Self {
        Self {
            docker,
            limits,
            network_mode: network_mode.to_string(),
        }
    }

    /// Connect using `docker_host` (`unix://` socket or `tcp://`/`http://`
    /// endpoint), or the local defaults when unset.
    pub fn connect(config: &RuntimeConfig) -> Result<Self> {
        let limits = ResourceLimits::from_config(config)?;
        let docker = match config.docker_host.as_deref() {
            None | Some("") => Docker::connect_with_local_defaults()?,
            Some(host) if host.starts_with("unix://") => {
                Docker::connect_with_socket(host, DOCKER_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?
            }
            Some(host) => {
                let host = host.replacen("tcp://", "http://", 1);
                Docker::connect_with_http(&host, DOCKER_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?
            }
        };
        Ok(Self::new(docker, limits, &config.network_mode))
    }

    pub async fn ping(&self) -> Result<()> {
        self.docker.ping().await?;
        Ok(())
    }

    fn host_config(&self, opts: &CreateOptions) -> HostConfig {
        build_host_config(opts, &self.limits, &self.network_mode)
    }
}

pub fn container_name(session_id: &str) -> String {
    format!("aira-{session_id}")
}

/// Host-side settings: the repo volume bind, resource limits, networking.
/// Non-positive limits are left unset, which Docker treats as unlimited.
pub fn build_host_config(
    opts: &CreateOptions,
    limits: &ResourceLimits,
    default_network: &str,
) -> HostConfig {
    let network = opts
        .network_mode
        .clone()
        .unwrap_or_else(|| default_network.to_string());

    HostConfig {
        binds: Some(vec![opts.volume_bind()]),
        memory: (limits.memory_bytes > 0).then_some(limits.memory_bytes),
        cpu_quota: (limits.cpu_quota > 0).then_some(limits.cpu_quota),
        cpu_period: (limits.cpu_quota > 0).then_some(CPU_PERIOD),
        network_mode: Some(network),
        ..Default::default()
    }
}

fn log_bytes(output: LogOutput) -> Vec<u8> {
    match output {
        LogOutput::StdOut { message }
        | LogOutput::StdErr { message }
        | LogOutput::StdIn { message }
        | LogOutput::Console { message } => message.to_vec(),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_volume(&self, name: &str) -> Result<()> {
        let options = CreateVolumeOptions {
            name: name.to_string(),
            labels: HashMap::from([(MANAGED_LABEL.to_string(), "true".to_string())]),
            ..Default::default()
        };
        self.docker.create_volume(options).await?;
        debug!(volume = name, "volume ready");
        Ok(())
    }

    async fn create(&self, opts: &CreateOptions) -> Result<String> {
        let labels = HashMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            ("io.aira.session".to_string(), opts.session_id.clone()),
        ]);

        let config = Config {
            image: Some(opts.image.clone()),
            cmd: Some(opts.cmd.clone()),
            entrypoint: opts.entrypoint.clone(),
            env: Some(opts.env_pairs()),
            working_dir: (!opts.work_dir.is_empty()).then(|| opts.work_dir.clone()),
            labels: Some(labels),
            open_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(self.host_config(opts)),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: container_name(&opts.session_id),
            platform: None,
        };

        let response = self.docker.create_container(Some(options), config).await?;
        for warning in &response.warnings {
            warn!(container_id = %response.id, "docker: {}", warning);
        }
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<()> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // Already stopped.
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }

    async fn stream_logs(&self, id: &str) -> Result<LogStream> {
        let (tx, rx) = mpsc::channel(LOG_BUFFER);
        let docker = self.docker.clone();
        let id = id.to_string();

        tokio::spawn(async move {
            let options = LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            };
            let mut stream = docker.logs(&id, Some(options));
            while let Some(item) = stream.next().await {
                match item {
                    Ok(output) => {
                        if tx.send(log_bytes(output)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(container_id = %id, "log stream ended with error: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn wait(&self, id: &str) -> Result<i64> {
        let mut stream = self.docker.wait_container(
            id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code.
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(RuntimeError::Wait {
                id: id.to_string(),
                reason: e.to_string(),
            }),
            None => Err(RuntimeError::Wait {
                id: id.to_string(),
                reason: "wait stream ended without a status".to_string(),
            }),
        }
    }

    async fn exec_stdin(&self, id: &str, cmd: &[String], stdin: &[u8]) -> Result<()> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(cmd.to_vec()),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        match self.docker.start_exec(&exec.id, None).await? {
            StartExecResults::Attached {
                mut output,
                mut input,
            } => {
                input.write_all(stdin).await?;
                input.shutdown().await?;
                drop(input);
                while let Some(item) = output.next().await {
                    if let Err(e) = item {
                        warn!(container_id = %id, "exec output error: {}", e);
                        break;
                    }
                }
            }
            StartExecResults::Detached => {
                warn!(container_id = %id, "exec started detached; stdin not delivered");
            }
        }
        Ok(())
    }
}
