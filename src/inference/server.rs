//! Owned inference server process.
//!
//! Each agent may run its own `llama-server` child. The child is spawned
//! with `kill_on_drop`, so dropping the owning client tears it down.

use std::process::Stdio;
use std::time::Duration;

use reqwest::Client as HttpClient;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use super::config::LaunchConfig;
use super::errors::InferenceError;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Delay between `/health` polls while the model loads.
const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Timeout for a single `/health` request.
const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout for the child to exit after being killed.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

// ─── ServerProcess ───────────────────────────────────────────────────────────

/// A running inference server child process.
pub struct ServerProcess {
    child: Child,
    /// Forwards the child's stderr into tracing.
    stderr_task: Option<JoinHandle<()>>,
}

impl ServerProcess {
    /// Spawn the server binary configured in `launch`, listening on the
    /// host and port of `base_url`.
    pub fn spawn(launch: &LaunchConfig, base_url: &str) -> Result<Self, InferenceError> {
        let args = build_args(launch, base_url)?;

        let mut cmd = Command::new(&launch.binary);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| InferenceError::ProcessError {
            reason: format!("failed to spawn '{}': {e}", launch.binary),
        })?;

        tracing::info!(
            binary = %launch.binary,
            model = %launch.model_path,
            pid = ?child.id(),
            base_url = %base_url,
            "spawned inference server"
        );

        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "llama_agent::server_log", "{line}");
                }
            })
        });

        Ok(Self { child, stderr_task })
    }

    /// OS process id, while the child is running.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Check if the server process is still running.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Kill the server and wait for it to exit.
    pub async fn shutdown(&mut self) {
        let pid = self.child.id();
        let _ = self.child.start_kill();
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => tracing::info!(pid = ?pid, %status, "inference server stopped"),
            Ok(Err(e)) => tracing::warn!(pid = ?pid, error = %e, "failed to reap inference server"),
            Err(_) => tracing::warn!(pid = ?pid, "inference server did not exit in time"),
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

/// Build the server command line from the launch config and target URL.
pub fn build_args(launch: &LaunchConfig, base_url: &str) -> Result<Vec<String>, InferenceError> {
    let url = reqwest::Url::parse(base_url).map_err(|e| InferenceError::ConfigError {
        reason: format!("invalid base_url '{base_url}': {e}"),
    })?;
    let host = url.host_str().ok_or_else(|| InferenceError::ConfigError {
        reason: format!("base_url '{base_url}' has no host"),
    })?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| InferenceError::ConfigError {
            reason: format!("base_url '{base_url}' has no port"),
        })?;

    let mut args = vec![
        "--model".to_string(),
        launch.model_path.clone(),
        "--host".to_string(),
        host.to_string(),
        "--port".to_string(),
        port.to_string(),
        "--ctx-size".to_string(),
        launch.context_size.to_string(),
    ];
    if let Some(layers) = launch.gpu_layers {
        args.push("--n-gpu-layers".to_string());
        args.push(layers.to_string());
    }
    if let Some(threads) = launch.threads {
        args.push("--threads".to_string());
        args.push(threads.to_string());
    }
    args.extend(launch.extra_args.iter().cloned());

    Ok(args)
}

/// Poll `GET {base_url}/health` until the server answers 2xx.
///
/// Fails early if `process` exits while loading, and with `Timeout` once
/// `timeout` elapses.
pub async fn wait_until_healthy(
    http: &HttpClient,
    base_url: &str,
    mut process: Option<&mut ServerProcess>,
    timeout: Duration,
) -> Result<(), InferenceError> {
    let url = format!("{}/health", base_url.trim_end_matches('/'));
    let deadline = Instant::now() + timeout;
    let mut attempts: u32 = 0;

    loop {
        if let Some(ref mut child) = process {
            if !child.is_alive() {
                return Err(InferenceError::ProcessError {
                    reason: "inference server exited during startup".into(),
                });
            }
        }

        attempts += 1;
        match http.get(&url).timeout(HEALTH_REQUEST_TIMEOUT).send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(url = %url, attempts, "inference server healthy");
                return Ok(());
            }
            Ok(resp) => {
                tracing::debug!(url = %url, status = resp.status().as_u16(), "server not ready");
            }
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "server not reachable yet");
            }
        }

        if Instant::now() + HEALTH_POLL_INTERVAL > deadline {
            return Err(InferenceError::Timeout {
                duration_secs: timeout.as_secs(),
            });
        }
        sleep(HEALTH_POLL_INTERVAL).await;
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_args_minimal() {
        let launch = LaunchConfig::new("/models/tiny.gguf");
        let args = build_args(&launch, "http://127.0.0.1:8690").unwrap();
        assert_eq!(
            args,
            vec![
                "--model",
                "/models/tiny.gguf",
                "--host",
                "127.0.0.1",
                "--port",
                "8690",
                "--ctx-size",
                "4096"
            ]
        );
    }

    #[test]
    fn test_build_args_optional_flags() {
        let mut launch = LaunchConfig::new("m.gguf");
        launch.gpu_layers = Some(99);
        launch.threads = Some(8);
        launch.extra_args = vec!["--flash-attn".into()];
        let args = build_args(&launch, "http://localhost/").unwrap();

        let port_idx = args.iter().position(|a| a == "--port").unwrap();
        assert_eq!(args[port_idx + 1], "80", "known default port for http");
        assert!(args.windows(2).any(|w| w[0] == "--n-gpu-layers" && w[1] == "99"));
        assert!(args.windows(2).any(|w| w[0] == "--threads" && w[1] == "8"));
        assert_eq!(args.last().map(String::as_str), Some("--flash-attn"));
    }

    #[test]
    fn test_build_args_invalid_url() {
        let launch = LaunchConfig::new("m.gguf");
        assert!(matches!(
            build_args(&launch, "not a url"),
            Err(InferenceError::ConfigError { .. })
        ));
    }

    #[tokio::test]
    async fn test_spawn_missing_binary() {
        let mut launch = LaunchConfig::new("m.gguf");
        launch.binary = "/nonexistent/llama-server-for-tests".into();
        let result = ServerProcess::spawn(&launch, "http://127.0.0.1:8690");
        assert!(matches!(result, Err(InferenceError::ProcessError { .. })));
    }

    #[tokio::test]
    async fn test_wait_until_healthy_times_out() {
        // Reserve a free port, then release it so nothing is listening there.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let http = HttpClient::new();
        let result = wait_until_healthy(
            &http,
            &format!("http://{addr}"),
            None,
            Duration::from_millis(300),
        )
        .await;
        assert!(matches!(result, Err(InferenceError::Timeout { .. })));
    }
}
