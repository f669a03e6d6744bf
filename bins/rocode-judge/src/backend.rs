//! Execution backends.
//!
//! A backend knows HOW to run one composed program against one test input
//! under resource limits. It does not know scoring rules, queue shapes, or
//! persistence - it returns a raw [`ExecutionOutcome`] for the runner to
//! judge.
//!
//! Three implementations sit behind one seam, selected at construction time:
//! a bare interpreter process, a Docker container, and a clearly-marked
//! simulation for hosts with neither. Nothing the untrusted program does may
//! crash or hang the caller; only infrastructure faults surface as errors.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use rocode_common::config::JudgeConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Safety limits applied before anything reaches a sandbox.
const MAX_PROGRAM_BYTES: usize = 1024 * 1024; // 1MB
const MAX_TEST_INPUT_BYTES: usize = 10 * 1024 * 1024; // 10MB

/// Accumulated stdout past this ceiling forcibly terminates the run. The
/// breach is flagged, never silently truncated.
const MAX_OUTPUT_BYTES: usize = 1024 * 1024; // 1MB

const TIME_LIMIT_ERROR: &str = "Time limit exceeded";
const OUTPUT_LIMIT_ERROR: &str = "Output limit exceeded";
const MEMORY_LIMIT_ERROR: &str = "Memory limit exceeded";
const GENERIC_RUNTIME_ERROR: &str = "Runtime error";

/// Raw result of one sandboxed run. Consumed by the test runner.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    pub output: String,
    pub error: Option<String>,
    pub runtime_ms: u64,
    /// Best effort; zero when the backend cannot measure memory.
    pub memory_kb: u64,
    pub timed_out: bool,
    pub memory_exceeded: bool,
    /// True only for the simulation backend. Simulated output is
    /// non-authoritative and is marked as such in the output itself.
    pub simulated: bool,
}

/// The capability seam between the judge and the sandbox mechanism.
///
/// Exhaustively matched at the single dispatch point; a new backend is a
/// compile-time-checked addition.
pub enum ExecutionBackend {
    Process(ProcessBackend),
    Docker(DockerBackend),
    Simulate(SimulateBackend),
    #[cfg(test)]
    Fixed(FixedBackend),
}

impl ExecutionBackend {
    /// Pick the backend for this host. Absence of the interpreter is a
    /// configuration problem worth a loud warning, not a startup crash:
    /// the judge degrades to simulation rather than refusing to boot.
    pub fn from_config(config: &JudgeConfig) -> Result<Self> {
        if config.use_docker {
            let backend = DockerBackend::new(config.sandbox_image.clone())?;
            info!(image = %config.sandbox_image, "Using Docker sandbox backend");
            return Ok(ExecutionBackend::Docker(backend));
        }

        match resolve_luau(config.luau_binary.as_deref()) {
            Some(binary) => {
                info!(binary = %binary.display(), "Using Luau process backend");
                Ok(ExecutionBackend::Process(ProcessBackend::new(
                    binary,
                    config.sandbox_dir.clone(),
                )))
            }
            None => {
                warn!(
                    "Luau interpreter not found on this host - falling back to \
                     simulated execution. Results will be non-authoritative."
                );
                Ok(ExecutionBackend::Simulate(SimulateBackend))
            }
        }
    }

    /// Run one composed program against one test input.
    ///
    /// User-code faults and resource violations come back inside the
    /// outcome; an `Err` always means the platform itself failed (spawn
    /// error, Docker daemon unreachable, filesystem trouble).
    pub async fn execute(
        &self,
        program: &str,
        input: &str,
        time_limit_ms: u64,
        memory_limit_mb: u64,
    ) -> Result<ExecutionOutcome> {
        if program.len() > MAX_PROGRAM_BYTES {
            bail!("Program exceeds maximum size of {} bytes", MAX_PROGRAM_BYTES);
        }
        if input.len() > MAX_TEST_INPUT_BYTES {
            bail!(
                "Test input exceeds maximum size of {} bytes",
                MAX_TEST_INPUT_BYTES
            );
        }

        match self {
            ExecutionBackend::Process(backend) => {
                backend.execute(program, input, time_limit_ms).await
            }
            ExecutionBackend::Docker(backend) => {
                backend
                    .execute(program, input, time_limit_ms, memory_limit_mb)
                    .await
            }
            ExecutionBackend::Simulate(backend) => Ok(backend.execute(program)),
            #[cfg(test)]
            ExecutionBackend::Fixed(backend) => backend.execute(),
        }
    }
}

/// Locate the Luau interpreter: explicit override, then the usual install
/// locations, then a PATH walk.
pub fn resolve_luau(override_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = override_path {
        return path.exists().then(|| path.to_path_buf());
    }

    let mut candidates = Vec::new();
    if let Some(home) = std::env::var_os("HOME") {
        candidates.push(PathBuf::from(home).join("bin").join("luau"));
    }
    candidates.push(PathBuf::from("/usr/local/bin/luau"));
    candidates.push(PathBuf::from("/opt/homebrew/bin/luau"));

    for candidate in candidates {
        if candidate.exists() {
            return Some(candidate);
        }
    }

    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join("luau"))
        .find(|candidate| candidate.exists())
}

/// Removes the per-run scratch directory on every exit path, including
/// panics and timeouts.
struct WorkDirGuard {
    path: PathBuf,
}

impl Drop for WorkDirGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to clean sandbox dir");
        }
    }
}

/// Bare-interpreter backend: one OS process per test run.
///
/// Isolation here is process-level only (fresh process, piped stdio, no
/// inherited Lua search paths); hard memory enforcement needs the Docker
/// backend. `memory_kb` is therefore reported as zero on this path.
pub struct ProcessBackend {
    binary: PathBuf,
    sandbox_dir: PathBuf,
}

impl ProcessBackend {
    pub fn new(binary: PathBuf, sandbox_dir: PathBuf) -> Self {
        ProcessBackend {
            binary,
            sandbox_dir,
        }
    }

    async fn execute(
        &self,
        program: &str,
        input: &str,
        time_limit_ms: u64,
    ) -> Result<ExecutionOutcome> {
        let work_dir = self.sandbox_dir.join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&work_dir)
            .await
            .context("Failed to create sandbox work dir")?;
        let _guard = WorkDirGuard {
            path: work_dir.clone(),
        };

        let code_file = work_dir.join("solution.luau");
        tokio::fs::write(&code_file, program)
            .await
            .context("Failed to write generated source")?;

        let start = Instant::now();

        let mut child = Command::new(&self.binary)
            .arg(&code_file)
            .current_dir(&work_dir)
            .env("LUA_PATH", "")
            .env("LUA_CPATH", "")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| {
                format!("Failed to launch interpreter {}", self.binary.display())
            })?;

        // Feed the test input and close stdin so reads see EOF.
        if let Some(mut stdin) = child.stdin.take() {
            // A program that never reads sees this fail with a broken pipe;
            // that is the program's business, not ours.
            let _ = stdin.write_all(input.as_bytes()).await;
            let _ = stdin.shutdown().await;
        }

        let mut stdout_pipe = child.stdout.take().context("Child stdout not captured")?;
        let mut stderr_pipe = child.stderr.take().context("Child stderr not captured")?;

        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr_pipe.read_to_end(&mut buf).await;
            buf
        });

        // Stream stdout with the ceiling applied as we go, then wait for
        // exit - all under the wall-clock deadline.
        let bounded_run = async {
            let mut stdout_buf = Vec::new();
            let mut chunk = [0u8; 8192];
            let flooded = loop {
                match stdout_pipe.read(&mut chunk).await {
                    Ok(0) => break false,
                    Ok(n) => {
                        stdout_buf.extend_from_slice(&chunk[..n]);
                        if stdout_buf.len() > MAX_OUTPUT_BYTES {
                            break true;
                        }
                    }
                    Err(e) => return Err(anyhow::Error::from(e)),
                }
            };

            if flooded {
                return Ok((stdout_buf, true, None));
            }

            let status = child.wait().await.context("Failed waiting for child")?;
            Ok((stdout_buf, false, Some(status)))
        };

        let deadline = Duration::from_millis(time_limit_ms);
        let run_result = tokio::time::timeout(deadline, bounded_run).await;

        let mut outcome = ExecutionOutcome::default();

        let (stdout_buf, status) = match run_result {
            Ok(Ok((buf, flooded, status))) => {
                if flooded {
                    // Output ceiling breach is a resource violation.
                    child.kill().await.ok();
                    outcome.memory_exceeded = true;
                    outcome.error = Some(OUTPUT_LIMIT_ERROR.to_string());
                }
                (buf, status)
            }
            Ok(Err(e)) => {
                child.kill().await.ok();
                return Err(e.context("Failed reading child output"));
            }
            Err(_) => {
                // Deadline hit before exit.
                child.kill().await.ok();
                outcome.timed_out = true;
                outcome.error = Some(TIME_LIMIT_ERROR.to_string());
                (Vec::new(), None)
            }
        };

        outcome.runtime_ms = start.elapsed().as_millis() as u64;
        outcome.output = String::from_utf8_lossy(&stdout_buf).into_owned();

        let stderr_buf = stderr_task.await.unwrap_or_default();

        if outcome.error.is_none() {
            if let Some(status) = status {
                if !status.success() {
                    let stderr = String::from_utf8_lossy(&stderr_buf);
                    let stderr = sanitize_paths(stderr.trim(), &code_file);
                    outcome.error = if stderr.is_empty() {
                        Some(GENERIC_RUNTIME_ERROR.to_string())
                    } else {
                        Some(stderr)
                    };
                }
            }
        }

        debug!(
            runtime_ms = outcome.runtime_ms,
            timed_out = outcome.timed_out,
            memory_exceeded = outcome.memory_exceeded,
            has_error = outcome.error.is_some(),
            "Process execution finished"
        );

        Ok(outcome)
    }
}

/// Host temp paths leak into interpreter error messages; rewrite them to the
/// name the user knows their file by.
fn sanitize_paths(error: &str, code_file: &Path) -> String {
    error.replace(&code_file.display().to_string(), "solution.luau")
}

/// Container cleanup guard - guarantees container removal on drop, even if
/// execution panics or the worker task is cancelled.
struct ContainerGuard<'a> {
    docker: &'a Docker,
    container_id: String,
}

impl Drop for ContainerGuard<'_> {
    fn drop(&mut self) {
        // Cannot be async in Drop; spawn the best-effort removal.
        let container_id = self.container_id.clone();
        let docker = self.docker.clone();

        tokio::spawn(async move {
            let remove_options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };

            if let Err(e) = docker.remove_container(&container_id, Some(remove_options)).await {
                warn!(container_id = %container_id, error = %e, "Failed to clean up container");
            }
        });
    }
}

/// Container-per-test backend with hard resource isolation:
/// no network, read-only rootfs with a small tmpfs, hard memory ceiling,
/// half a CPU, and a pids cap against fork bombs.
pub struct DockerBackend {
    docker: Docker,
    image: String,
}

impl DockerBackend {
    pub fn new(image: String) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;
        Ok(DockerBackend { docker, image })
    }

    /// Pull the sandbox image if it is not present locally.
    async fn ensure_image(&self) -> Result<()> {
        if self.docker.inspect_image(&self.image).await.is_ok() {
            debug!(image = %self.image, "Sandbox image present");
            return Ok(());
        }

        warn!(image = %self.image, "Sandbox image missing, pulling");

        let options = Some(CreateImageOptions {
            from_image: self.image.as_str(),
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.context("Failed to pull sandbox image")?;
        }

        info!(image = %self.image, "Sandbox image pulled");
        Ok(())
    }

    async fn execute(
        &self,
        program: &str,
        input: &str,
        time_limit_ms: u64,
        memory_limit_mb: u64,
    ) -> Result<ExecutionOutcome> {
        self.ensure_image().await?;

        let container_name = format!("rocode-judge-{}", Uuid::new_v4());

        // Source and input travel base64-encoded through the environment;
        // the rootfs is read-only apart from the tmpfs scratch space.
        let env = vec![
            format!("SOURCE_B64={}", general_purpose::STANDARD.encode(program)),
            format!("INPUT_B64={}", general_purpose::STANDARD.encode(input)),
        ];
        let run_script = "printf '%s' \"$SOURCE_B64\" | base64 -d > /tmp/solution.luau && \
                          printf '%s' \"$INPUT_B64\" | base64 -d | luau /tmp/solution.luau";

        let mut tmpfs = HashMap::new();
        tmpfs.insert("/tmp".to_string(), "rw,size=16m".to_string());

        let config = Config {
            image: Some(self.image.clone()),
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                run_script.to_string(),
            ]),
            env: Some(env),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(true),
            host_config: Some(bollard::models::HostConfig {
                memory: Some((memory_limit_mb as i64) * 1024 * 1024),
                memory_swap: Some(-1),
                nano_cpus: Some(500_000_000), // 0.5 CPU
                pids_limit: Some(50),
                readonly_rootfs: Some(true),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                tmpfs: Some(tmpfs),
                ..Default::default()
            }),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .context("Failed to create sandbox container")?;

        let container_id = container.id.clone();
        let _guard = ContainerGuard {
            docker: &self.docker,
            container_id: container_id.clone(),
        };

        let start = Instant::now();

        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start sandbox container")?;

        let mut outcome = ExecutionOutcome::default();

        let run = async {
            let mut stdout = Vec::new();
            let mut stderr = String::new();

            let logs_options = Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                follow: true,
                ..Default::default()
            });

            let mut logs = self.docker.logs(&container_id, logs_options);
            let mut flooded = false;

            while let Some(chunk) = logs.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) => {
                        stdout.extend_from_slice(&message);
                        if stdout.len() > MAX_OUTPUT_BYTES {
                            flooded = true;
                            break;
                        }
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    Err(e) => {
                        warn!(error = %e, "Error reading container logs");
                        break;
                    }
                    _ => {}
                }
            }

            if flooded {
                return (stdout, stderr, None, true);
            }

            let wait_options = WaitContainerOptions {
                condition: "not-running",
            };
            let mut wait_stream = self.docker.wait_container(&container_id, Some(wait_options));
            let exit_code = match wait_stream.next().await {
                Some(Ok(response)) => Some(response.status_code),
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                    // Nonzero exits surface through the error variant.
                    Some(code)
                }
                _ => None,
            };

            (stdout, stderr, exit_code, false)
        };

        let deadline = Duration::from_millis(time_limit_ms);
        let (stdout, stderr, exit_code) = match tokio::time::timeout(deadline, run).await {
            Ok((stdout, stderr, exit_code, flooded)) => {
                if flooded {
                    self.kill(&container_id).await;
                    outcome.memory_exceeded = true;
                    outcome.error = Some(OUTPUT_LIMIT_ERROR.to_string());
                }
                (stdout, stderr, exit_code)
            }
            Err(_) => {
                self.kill(&container_id).await;
                outcome.timed_out = true;
                outcome.error = Some(TIME_LIMIT_ERROR.to_string());
                (Vec::new(), String::new(), None)
            }
        };

        outcome.runtime_ms = start.elapsed().as_millis() as u64;
        outcome.output = String::from_utf8_lossy(&stdout).into_owned();

        if outcome.error.is_none() {
            match exit_code {
                Some(0) => {}
                // 137 = SIGKILL, the kernel OOM-killing the cgroup.
                Some(137) => {
                    outcome.memory_exceeded = true;
                    outcome.error = Some(MEMORY_LIMIT_ERROR.to_string());
                    // The cgroup ceiling is the closest measurement we have.
                    outcome.memory_kb = memory_limit_mb * 1024;
                }
                Some(_) => {
                    let stderr = stderr.trim();
                    outcome.error = if stderr.is_empty() {
                        Some(GENERIC_RUNTIME_ERROR.to_string())
                    } else {
                        Some(stderr.to_string())
                    };
                }
                None => {
                    outcome.error = Some(GENERIC_RUNTIME_ERROR.to_string());
                }
            }
        }

        debug!(
            runtime_ms = outcome.runtime_ms,
            timed_out = outcome.timed_out,
            memory_exceeded = outcome.memory_exceeded,
            "Container execution finished"
        );

        Ok(outcome)
    }

    async fn kill(&self, container_id: &str) {
        if let Err(e) = self
            .docker
            .kill_container(container_id, None::<KillContainerOptions<String>>)
            .await
        {
            warn!(container_id = %container_id, error = %e, "Failed to kill container");
        }
    }
}

/// Last-resort backend for hosts with no interpreter and no Docker.
///
/// Synthesizes output from literal `print("...")` calls so local development
/// of the surrounding plumbing still works. Every result is flagged and its
/// text marked non-authoritative.
pub struct SimulateBackend;

impl SimulateBackend {
    fn execute(&self, program: &str) -> ExecutionOutcome {
        let start = Instant::now();

        let lines = extract_print_literals(program);
        let output = if lines.is_empty() {
            "(luau unavailable - simulated output)".to_string()
        } else {
            lines.join("\n")
        };

        ExecutionOutcome {
            output,
            runtime_ms: start.elapsed().as_millis() as u64,
            simulated: true,
            ..Default::default()
        }
    }
}

/// Pull the string literal out of each `print("...")` / `print('...')` call.
fn extract_print_literals(source: &str) -> Vec<String> {
    let mut found = Vec::new();
    let bytes = source.as_bytes();
    let mut search_from = 0;

    while let Some(offset) = source[search_from..].find("print(") {
        let open = search_from + offset + "print(".len();
        search_from = open;

        let quote = match bytes.get(open) {
            Some(&q @ (b'"' | b'\'')) => q,
            _ => continue,
        };

        let body_start = open + 1;
        if let Some(rel_end) = source[body_start..].find(quote as char) {
            let body_end = body_start + rel_end;
            if bytes.get(body_end + 1) == Some(&b')') {
                found.push(source[body_start..body_end].to_string());
                search_from = body_end + 2;
            }
        }
    }

    found
}

/// Test double: hands out pre-scripted outcomes in order.
#[cfg(test)]
pub struct FixedBackend {
    outcomes: std::sync::Mutex<std::collections::VecDeque<ExecutionOutcome>>,
}

#[cfg(test)]
impl FixedBackend {
    pub fn new(outcomes: Vec<ExecutionOutcome>) -> ExecutionBackend {
        ExecutionBackend::Fixed(FixedBackend {
            outcomes: std::sync::Mutex::new(outcomes.into()),
        })
    }

    fn execute(&self) -> Result<ExecutionOutcome> {
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .context("FixedBackend ran out of scripted outcomes")
    }
}
