/// Docker-based execution engine
///
/// **Docker Execution Rules:**
/// 1. Pulls the language image if not present
/// 2. Every compile and every run is its own container:
///    - Network disabled
///    - CPU/memory/pid limits from the language table
///    - Program directory bind-mounted (read-only for runs)
/// 3. stdin is staged as a file and redirected into the program
/// 4. Hard timeout via tokio; the container is force-removed on drop,
///    which kills whatever is still running in it

use crate::engine::{
    append_capped, fresh_dir, CompileFailure, Compiled, ExecutionEngine, Program, RunOutput,
    SandboxError, MAX_OUTPUT_BYTES,
};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use caseforge_common::LanguageSpec;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const CODE_MOUNT: &str = "/code";
const INPUT_MOUNT: &str = "/input";
const PIDS_LIMIT: i64 = 64;

/// Container cleanup guard - force-removes the container on drop so it is
/// cleaned up even when the run is cancelled or times out
struct ContainerGuard {
    docker: Docker,
    container_id: String,
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let docker = self.docker.clone();
        let container_id = std::mem::take(&mut self.container_id);
        tokio::spawn(async move {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(e) = docker.remove_container(&container_id, Some(options)).await {
                warn!(container_id = %container_id, error = %e, "Failed to clean up container");
            }
        });
    }
}

struct Mount<'a> {
    host: &'a Path,
    target: &'a str,
    read_only: bool,
}

impl Mount<'_> {
    fn bind(&self) -> String {
        let mode = if self.read_only { "ro" } else { "rw" };
        format!("{}:{}:{}", self.host.display(), self.target, mode)
    }
}

pub struct DockerEngine {
    docker: Docker,
    scratch_root: Option<PathBuf>,
}

impl DockerEngine {
    /// Scratch directories must live on a path the docker daemon can bind
    /// mount; `scratch_root` overrides the system temp dir for that.
    pub fn connect(scratch_root: Option<PathBuf>) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Infrastructure(format!("failed to connect to Docker daemon: {}", e)))?;
        Ok(Self {
            docker,
            scratch_root,
        })
    }

    fn image_for(spec: &LanguageSpec) -> Result<&str, SandboxError> {
        spec.image.as_deref().ok_or_else(|| {
            SandboxError::Infrastructure(format!("no docker image configured for {}", spec.name))
        })
    }

    /// Pull the image if it is not cached locally
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = %image, "Image cache hit");
            return Ok(());
        }

        warn!(image = %image, "Image cache miss, pulling");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            progress.map_err(|e| {
                SandboxError::Infrastructure(format!("failed to pull {}: {}", image, e))
            })?;
        }
        info!(image = %image, "Image pulled");
        Ok(())
    }

    /// Run `argv` in a fresh container and collect its output
    async fn run_container(
        &self,
        spec: &LanguageSpec,
        argv: Vec<String>,
        mounts: &[Mount<'_>],
        timeout: Duration,
    ) -> Result<RunOutput, SandboxError> {
        let image = Self::image_for(spec)?;
        self.ensure_image(image).await?;

        let infra = |what: &str, e: bollard::errors::Error| {
            SandboxError::Infrastructure(format!("{}: {}", what, e))
        };

        let config = Config {
            image: Some(image.to_string()),
            cmd: Some(argv),
            entrypoint: Some(vec![]),
            working_dir: Some(CODE_MOUNT.to_string()),
            network_disabled: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(HostConfig {
                binds: Some(mounts.iter().map(Mount::bind).collect()),
                tmpfs: Some(HashMap::from([("/tmp".to_string(), "size=64m".to_string())])),
                memory: Some(i64::from(spec.memory_limit_mb) * 1024 * 1024),
                nano_cpus: Some((f64::from(spec.cpu_limit) * 1_000_000_000.0) as i64),
                pids_limit: Some(PIDS_LIMIT),
                network_mode: Some("none".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let name = format!("caseforge-{}", uuid::Uuid::new_v4());
        let container = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| infra("failed to create container", e))?;

        // Set up cleanup immediately after creation
        let _guard = ContainerGuard {
            docker: self.docker.clone(),
            container_id: container.id.clone(),
        };

        let start = Instant::now();
        self.docker
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| infra("failed to start container", e))?;

        let collect = async {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();

            let mut logs = self.docker.logs(
                &container.id,
                Some(LogsOptions::<String> {
                    stdout: true,
                    stderr: true,
                    follow: true,
                    ..Default::default()
                }),
            );
            while let Some(chunk) = logs.next().await {
                let within_limit = match chunk {
                    Ok(LogOutput::StdOut { message }) => append_capped(&mut stdout, &message),
                    Ok(LogOutput::StdErr { message }) => append_capped(&mut stderr, &message),
                    Ok(_) => true,
                    Err(e) => return Err(infra("failed to read container logs", e)),
                };
                // The guard force-removes the still running container
                if !within_limit {
                    return Ok((stdout, stderr, None, true));
                }
            }

            let mut wait = self.docker.wait_container(
                &container.id,
                Some(WaitContainerOptions {
                    condition: "not-running",
                }),
            );
            let exit_code = match wait.next().await {
                Some(Ok(response)) => Some(response.status_code),
                // Non-zero exits are reported as errors by the wait endpoint
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                    Some(code)
                }
                Some(Err(e)) => return Err(infra("failed to wait for container", e)),
                None => None,
            };
            Ok((stdout, stderr, exit_code, false))
        };

        match tokio::time::timeout(timeout, collect).await {
            Ok(Ok((stdout, stderr, exit_code, output_limit_exceeded))) => {
                if output_limit_exceeded {
                    warn!(limit = MAX_OUTPUT_BYTES, "Container exceeded output limit");
                }
                Ok(RunOutput {
                    stdout: String::from_utf8_lossy(&stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&stderr).into_owned(),
                    exit_code: exit_code.map(|c| c as i32),
                    duration_ms: start.elapsed().as_millis() as u64,
                    timed_out: false,
                    output_limit_exceeded,
                })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(RunOutput::timed_out_after(start.elapsed().as_millis() as u64)),
        }
    }
}

#[async_trait]
impl ExecutionEngine for DockerEngine {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn compile(
        &self,
        spec: &LanguageSpec,
        code: &str,
        timeout: Duration,
    ) -> Result<Compiled, SandboxError> {
        let workdir = fresh_dir(self.scratch_root.as_deref())?;
        tokio::fs::write(workdir.path().join(&spec.source_file), code)
            .await
            .map_err(|e| SandboxError::Infrastructure(format!("failed to write source: {}", e)))?;

        if let Some(compile) = spec.compile.clone().filter(|c| !c.is_empty()) {
            let mounts = [Mount {
                host: workdir.path(),
                target: CODE_MOUNT,
                read_only: false,
            }];
            let output = self.run_container(spec, compile, &mounts, timeout).await?;
            if !output.succeeded() {
                let message = if output.timed_out {
                    format!("compilation timed out after {}ms", timeout.as_millis())
                } else {
                    format!("{}{}", output.stderr, output.stdout)
                };
                return Ok(Compiled::Failed(CompileFailure {
                    message,
                    timed_out: output.timed_out,
                }));
            }
        }

        Ok(Compiled::Ready(Program::new(spec.clone(), workdir)))
    }

    async fn run(
        &self,
        program: &Program,
        stdin: &str,
        timeout: Duration,
    ) -> Result<RunOutput, SandboxError> {
        let input_dir = fresh_dir(self.scratch_root.as_deref())?;
        tokio::fs::write(input_dir.path().join("stdin.txt"), stdin)
            .await
            .map_err(|e| SandboxError::Infrastructure(format!("failed to stage input: {}", e)))?;

        let mut argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("exec \"$@\" < {}/stdin.txt", INPUT_MOUNT),
            "sh".to_string(),
        ];
        argv.extend(program.spec.run.iter().cloned());

        let mounts = [
            Mount {
                host: program.workdir(),
                target: CODE_MOUNT,
                read_only: true,
            },
            Mount {
                host: input_dir.path(),
                target: INPUT_MOUNT,
                read_only: true,
            },
        ];
        self.run_container(&program.spec, argv, &mounts, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_modes() {
        let path = PathBuf::from("/tmp/caseforge-x");
        let ro = Mount {
            host: &path,
            target: CODE_MOUNT,
            read_only: true,
        };
        assert_eq!(ro.bind(), "/tmp/caseforge-x:/code:ro");
        let rw = Mount {
            read_only: false,
            ..ro
        };
        assert_eq!(rw.bind(), "/tmp/caseforge-x:/code:rw");
    }

    #[test]
    fn test_image_required() {
        let spec = LanguageSpec::interpreted("sh", "main.sh", &["sh", "main.sh"]);
        assert!(DockerEngine::image_for(&spec).is_err());
        let spec = spec.with_image("alpine:3");
        assert_eq!(DockerEngine::image_for(&spec).unwrap(), "alpine:3");
    }

    #[tokio::test]
    #[ignore] // Requires a Docker daemon
    async fn test_docker_run_and_timeout() {
        let engine = DockerEngine::connect(None).unwrap();
        let spec = LanguageSpec::interpreted("sh", "main.sh", &["sh", "main.sh"]).with_image("alpine:3");

        let Compiled::Ready(program) = engine
            .compile(&spec, "read a b\necho $((a + b))\n", Duration::from_secs(30))
            .await
            .unwrap()
        else {
            panic!("compile failed");
        };
        let output = engine.run(&program, "1 2\n", Duration::from_secs(30)).await.unwrap();
        assert_eq!(output.stdout, "3\n");
        assert_eq!(output.exit_code, Some(0));

        let Compiled::Ready(sleeper) = engine
            .compile(&spec, "sleep 10\n", Duration::from_secs(30))
            .await
            .unwrap()
        else {
            panic!("compile failed");
        };
        let output = engine.run(&sleeper, "", Duration::from_secs(2)).await.unwrap();
        assert!(output.timed_out);
    }
}
