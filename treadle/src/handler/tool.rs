//! Deterministic shell execution: runs `sh -c <command>` in
//! its own process group so a timeout kills the whole descendant tree.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use super::Handler;
use crate::cancel::CancelToken;
use crate::context::Context;
use crate::graph::{Graph, Node};
use crate::interfaces::ArtifactStore;
use crate::outcome::Outcome;
use crate::retry::HandlerError;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
/// Above this many bytes, stdout is truncated in `notes` and stored whole as an artifact.
const STDOUT_INLINE_LIMIT: usize = 10 * 1024;

/// Output of one shell invocation, shared by `tool` and `verify`.
pub(super) struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

/// Spawns `sh -c command` in its own process group (unix) so a timeout's kill
/// tears down every descendant, not just the shell. Env is the parent's plus
/// every `env_*`-derived overlay key; working directory must already exist.
pub(super) async fn run_shell(
    command: &str,
    working_dir: Option<&str>,
    env_overlay: &HashMap<String, String>,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<ShellOutput, HandlerError> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    for (k, v) in env_overlay {
        cmd.env(k, v);
    }
    if let Some(dir) = working_dir {
        if !Path::new(dir).is_dir() {
            return Err(HandlerError::new(format!("working_dir does not exist: {dir}")));
        }
        cmd.current_dir(dir);
    }

    #[cfg(unix)]
    unsafe {
        use std::os::unix::process::CommandExt;
        cmd.pre_exec(|| {
            nix::unistd::setpgid(nix::unistd::Pid::from_raw(0), nix::unistd::Pid::from_raw(0))
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
        });
    }

    let mut child = cmd.spawn().map_err(|e| HandlerError::new(format!("failed to spawn: {e}")))?;
    let pid = child.id();

    let mut stdout = child.stdout.take().expect("stdout piped");
    let mut stderr = child.stderr.take().expect("stderr piped");
    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();

    let wait_and_read = async {
        let read_stdout = stdout.read_to_end(&mut stdout_buf);
        let read_stderr = stderr.read_to_end(&mut stderr_buf);
        let (status, _, _) = tokio::join!(child.wait(), read_stdout, read_stderr);
        status
    };

    tokio::select! {
        status = wait_and_read => {
            let status = status.map_err(|e| HandlerError::new(format!("wait failed: {e}")))?;
            Ok(ShellOutput {
                stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
                stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
                exit_code: status.code().unwrap_or(-1),
                timed_out: false,
            })
        }
        _ = tokio::time::sleep(timeout) => {
            kill_process_group(pid);
            let _ = child.wait().await;
            Ok(ShellOutput {
                stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
                stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
                exit_code: -1,
                timed_out: true,
            })
        }
        _ = cancel.cancelled() => {
            kill_process_group(pid);
            let _ = child.wait().await;
            Err(HandlerError::new("cancelled"))
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        let _ = nix::sys::signal::killpg(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGKILL,
        );
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

/// Collects every `env_*`-prefixed node attribute into an overlay map, keyed
/// by the attribute name with the `env_` prefix stripped.
pub(super) fn env_overlay_from_node(node: &Node) -> HashMap<String, String> {
    node.attrs
        .iter()
        .filter_map(|(k, v)| k.strip_prefix("env_").map(|name| (name.to_string(), v.clone())))
        .collect()
}

pub(super) fn resolve_timeout(node: &Node, default_secs: u64) -> Duration {
    let secs: u64 = node.attr_parsed("timeout", default_secs);
    if secs == 0 {
        Duration::from_secs(default_secs)
    } else {
        Duration::from_secs(secs)
    }
}

/// Runs a shell command (`command` attr, fallback `prompt`) and surfaces its
/// result as context/notes/artifacts. Non-zero exit is always a failure.
pub struct ToolHandler;

#[async_trait]
impl Handler for ToolHandler {
    fn type_name(&self) -> &'static str {
        "tool"
    }

    async fn execute(
        &self,
        cancel: CancelToken,
        _graph: &Graph,
        node: &Node,
        context: &Context,
        artifacts: &dyn ArtifactStore,
    ) -> Result<Outcome, HandlerError> {
        let command = node
            .attr("command")
            .or_else(|| node.attr("prompt"))
            .ok_or_else(|| HandlerError::new("tool node has neither command nor prompt"))?;
        let timeout = resolve_timeout(node, DEFAULT_TIMEOUT_SECS);
        let env_overlay = env_overlay_from_node(node);
        let working_dir = node.attr("working_dir");

        let result = run_shell(command, working_dir, &env_overlay, timeout, &cancel).await?;

        let mut outcome = if result.timed_out {
            Outcome::fail(format!("command timed out after {:?}", timeout))
        } else if result.exit_code == 0 {
            Outcome::success()
        } else {
            Outcome::fail(format!("command exited with code {}", result.exit_code))
        };

        outcome = outcome
            .with_context_update("tool.stderr", result.stderr.clone())
            .with_context_update("tool.exit_code", result.exit_code);

        if result.stdout.len() <= STDOUT_INLINE_LIMIT {
            outcome = outcome.with_notes(result.stdout.clone());
            outcome = outcome.with_context_update("tool.stdout", result.stdout);
        } else {
            let artifact_id = format!("{}.stdout", node.id);
            artifacts
                .store(&artifact_id, "text", result.stdout.as_bytes().to_vec())
                .await
                .map_err(|e| HandlerError::new(format!("failed to store stdout artifact: {e}")))?;
            outcome = outcome.with_notes(format!("stdout truncated; stored as artifact {artifact_id}"));
            outcome = outcome.with_context_update("tool.stdout", "[truncated; see artifact]".to_string());
        }

        context.apply_updates(outcome.context_updates.clone());
        Ok(outcome)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
