//! Docker implementation of the sandbox, over bollard.

use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StatsOptions, WaitContainerOptions,
};
use bollard::models::{HostConfig, Mount, MountTypeEnum, ResourcesUlimits};
use bollard::Docker;
use drop_bomb::DropBomb;
use names::{Generator, Name};
use tokio_stream::StreamExt;
use tracing::{debug, trace, warn};

use super::model::{BindMount, CappedBuffer, Limits, RunOutcome, SandboxProfile};
use super::{Sandbox, SandboxError};

/// Cap on captured container stdout/stderr. Stage harness output is small;
/// anything beyond this is noise.
const LOG_CAPTURE_LIMIT: usize = 128 * 1024;

pub struct DockerSandbox {
    docker: Docker,
    worker_name: String,
}

impl DockerSandbox {
    /// Connects to the engine over its unix socket. Does not verify
    /// reachability; call [`DockerSandbox::ping`] for that.
    pub fn connect(socket: &Path, worker_name: &str) -> Result<DockerSandbox, SandboxError> {
        let docker = Docker::connect_with_unix(
            &socket.to_string_lossy(),
            120,
            bollard::API_DEFAULT_VERSION,
        )?;
        Ok(DockerSandbox {
            docker,
            worker_name: worker_name.to_string(),
        })
    }

    pub async fn ping(&self) -> Result<(), SandboxError> {
        self.docker.ping().await?;
        Ok(())
    }

    /// Checks that `image` exists locally. The worker never pulls or builds
    /// images; provisioning them is a deployment concern.
    pub async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        self.docker
            .inspect_image(image)
            .await
            .map_err(|_| SandboxError::MissingImage(image.to_string()))?;
        Ok(())
    }

    fn container_name(&self, tag: Option<&str>) -> String {
        let suffix = Generator::with_naming(Name::Numbered)
            .next()
            .unwrap_or_else(|| "run".into());
        match tag {
            Some(tag) => format!("{}-{}-{}", self.worker_name, tag, suffix),
            None => format!("{}-{}", self.worker_name, suffix),
        }
    }

    /// Rejects mounts whose host path resolves outside the containment root.
    async fn assert_mounts(&self, profile: &SandboxProfile) -> Result<(), SandboxError> {
        let root = match &profile.containment_root {
            Some(root) => tokio::fs::canonicalize(root).await?,
            None => return Ok(()),
        };
        for mount in &profile.mounts {
            let shown = mount.host_path.display().to_string();
            if !mount.host_path.is_absolute() {
                return Err(SandboxError::MountEscape(shown));
            }
            let real = tokio::fs::canonicalize(&mount.host_path)
                .await
                .map_err(|_| SandboxError::MountEscape(shown.clone()))?;
            if !real.starts_with(&root) {
                return Err(SandboxError::MountEscape(shown));
            }
        }
        Ok(())
    }

    async fn drive(&self, id: &str, profile: &SandboxProfile) -> Result<RunOutcome, SandboxError> {
        let started = Instant::now();
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;

        let mut timed_out = false;
        let mut exit_code: i64 = -1;
        let mut wait = self.docker.wait_container(
            id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );
        match tokio::time::timeout(profile.wall_timeout, wait.next()).await {
            Err(_) => {
                timed_out = true;
                debug!(container = id, "wall-clock timeout, killing container");
                let _ = self
                    .docker
                    .kill_container(id, Some(KillContainerOptions { signal: "SIGKILL" }))
                    .await;
                // collect the exit after the kill lands
                let _ = self
                    .docker
                    .wait_container(
                        id,
                        Some(WaitContainerOptions {
                            condition: "not-running",
                        }),
                    )
                    .next()
                    .await;
            }
            Ok(Some(Ok(resp))) => exit_code = resp.status_code,
            Ok(Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. }))) => {
                exit_code = code
            }
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(None) => return Err(SandboxError::Wait("wait stream closed early".into())),
        }
        let wall_time = started.elapsed().as_secs_f64();

        let (stdout, stderr) = self.collect_logs(id).await;
        let (peak_memory, cpu_time) = self.collect_stats(id).await;

        let mut oom_killed = false;
        match self.docker.inspect_container(id, None).await {
            Ok(inspect) => {
                if let Some(state) = inspect.state {
                    oom_killed = state.oom_killed.unwrap_or(false);
                    if exit_code < 0 {
                        exit_code = state.exit_code.unwrap_or(exit_code);
                    }
                }
            }
            Err(e) => warn!(container = id, "cannot inspect container: {}", e),
        }

        Ok(RunOutcome {
            exit_code,
            stdout,
            stderr,
            peak_memory,
            cpu_time,
            wall_time,
            timed_out,
            oom_killed,
        })
    }

    async fn collect_logs(&self, id: &str) -> (String, String) {
        let mut stdout = CappedBuffer::new(LOG_CAPTURE_LIMIT);
        let mut stderr = CappedBuffer::new(LOG_CAPTURE_LIMIT);
        let mut logs = self.docker.logs::<String>(
            id,
            Some(LogsOptions {
                stdout: true,
                stderr: true,
                follow: false,
                ..Default::default()
            }),
        );
        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) => stdout.append(&message),
                Ok(LogOutput::StdErr { message }) => stderr.append(&message),
                Ok(_) => {}
                Err(e) => {
                    warn!(container = id, "log stream error: {}", e);
                    break;
                }
            }
        }
        (stdout.into_string(), stderr.into_string())
    }

    async fn collect_stats(&self, id: &str) -> (Option<u64>, Option<f64>) {
        let mut stats = self.docker.stats(
            id,
            Some(StatsOptions {
                stream: false,
                one_shot: false,
            }),
        );
        match stats.next().await {
            Some(Ok(stats)) => {
                let peak = stats.memory_stats.max_usage;
                let cpu = stats.cpu_stats.cpu_usage.total_usage;
                let cpu = (cpu > 0).then(|| cpu as f64 / 1e9);
                (peak, cpu)
            }
            Some(Err(e)) => {
                trace!(container = id, "stats unavailable: {}", e);
                (None, None)
            }
            None => (None, None),
        }
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    async fn run(&self, profile: &SandboxProfile) -> Result<RunOutcome, SandboxError> {
        self.assert_mounts(profile).await?;
        let name = self.container_name(profile.tag.as_deref());
        trace!(container = %name, image = %profile.image, "creating container");
        let guard = ContainerGuard::create(&self.docker, &name, build_config(profile)).await?;
        let outcome = self.drive(guard.id(), profile).await;
        guard.teardown().await;
        outcome
    }
}

fn build_config(profile: &SandboxProfile) -> Config<String> {
    Config {
        image: Some(profile.image.clone()),
        cmd: profile.command.clone(),
        env: Some(
            profile
                .env
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect(),
        ),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        network_disabled: Some(true),
        host_config: Some(host_config(&profile.limits, &profile.mounts)),
        ..Default::default()
    }
}

fn host_config(limits: &Limits, mounts: &[BindMount]) -> HostConfig {
    let mut ulimits = vec![
        ResourcesUlimits {
            name: Some("fsize".into()),
            soft: Some(limits.file_size_limit as i64),
            hard: Some(limits.file_size_limit as i64),
        },
        ResourcesUlimits {
            name: Some("nofile".into()),
            soft: Some(limits.open_files_limit as i64),
            hard: Some(limits.open_files_limit as i64),
        },
    ];
    if let Some(stack) = limits.stack_size_limit {
        ulimits.push(ResourcesUlimits {
            name: Some("stack".into()),
            soft: Some(stack as i64),
            hard: Some(stack as i64),
        });
    }
    HostConfig {
        mounts: Some(mounts.iter().map(to_engine_mount).collect()),
        memory: Some(limits.memory_limit as i64),
        // same value: no swap on top of the memory cap
        memory_swap: Some(limits.memory_limit as i64),
        pids_limit: Some(limits.pids_limit),
        ulimits: Some(ulimits),
        security_opt: Some(vec!["no-new-privileges".into()]),
        ..Default::default()
    }
}

fn to_engine_mount(bind: &BindMount) -> Mount {
    Mount {
        target: Some(bind.container_path.clone()),
        source: Some(bind.host_path.display().to_string()),
        typ: Some(MountTypeEnum::BIND),
        read_only: Some(bind.read_only),
        ..Default::default()
    }
}

/// A created container that must be explicitly torn down; removal happens
/// on every path out of [`DockerSandbox::run`].
struct ContainerGuard {
    docker: Docker,
    id: String,
    bomb: DropBomb,
}

impl ContainerGuard {
    async fn create(
        docker: &Docker,
        name: &str,
        config: Config<String>,
    ) -> Result<ContainerGuard, SandboxError> {
        let res = docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.to_string(),
                    platform: None,
                }),
                config,
            )
            .await?;
        Ok(ContainerGuard {
            docker: docker.clone(),
            id: res.id,
            bomb: DropBomb::new("`ContainerGuard::teardown()` must be called before dropping!"),
        })
    }

    fn id(&self) -> &str {
        &self.id
    }

    async fn teardown(mut self) {
        self.bomb.defuse();
        if let Err(e) = self
            .docker
            .remove_container(
                &self.id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            warn!(container = %self.id, "cannot remove container: {}", e);
        }
    }
}
