//! Producer-side commands executed on behalf of relay clients.
//!
//! The relay answers `get-layers`, `render-composition` and `cancel-render`
//! by running host scripts (by default through `osascript`). Children are
//! spawned with `kill_on_drop`, so stopping a [`ScriptRunner`] kills every
//! script still running.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ScriptsConfig;
use crate::error::{BridgeError, Result};

const SCRIPT_PLACEHOLDER: &str = "{script}";

/// Executes producer commands. Errors are sent back to the requester as
/// `{"error": <message>}`.
#[async_trait]
pub trait HostCommands: Send + Sync {
    /// Raw reply text for `get-layers`, forwarded to the requester as-is.
    async fn get_layers(&self, comp_name: Option<&str>) -> Result<String>;

    /// Run a render. `Ok` carries the progress output.
    async fn render(&self, request: &Value) -> Result<String>;

    async fn cancel_render(&self) -> Result<()>;

    /// Kill everything still running. Called once when the relay stops.
    async fn shutdown(&self) {}
}

// ---------------------------------------------------------------------------
// ScriptRunner
// ---------------------------------------------------------------------------

/// Runs one configured script per command.
pub struct ScriptRunner {
    config: ScriptsConfig,
    stop: watch::Sender<bool>,
    active: AtomicUsize,
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Captured result of a finished script.
struct ScriptOutput {
    success: bool,
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

impl ScriptRunner {
    pub fn new(config: ScriptsConfig) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            config,
            stop,
            active: AtomicUsize::new(0),
        }
    }

    /// Scripts currently running.
    pub fn active_processes(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn script(&self, path: Option<&PathBuf>, command: &str) -> Result<PathBuf> {
        path.cloned()
            .ok_or_else(|| BridgeError::Config(format!("no {command} script configured")))
    }

    fn command_args(&self, script: &Path) -> Vec<String> {
        let script = script.to_string_lossy();
        let mut substituted = false;
        let mut args: Vec<String> = self
            .config
            .args
            .iter()
            .map(|arg| {
                if arg.contains(SCRIPT_PLACEHOLDER) {
                    substituted = true;
                    arg.replace(SCRIPT_PLACEHOLDER, &script)
                } else {
                    arg.clone()
                }
            })
            .collect();
        if !substituted {
            args.push(script.into_owned());
        }
        args
    }

    async fn run(&self, script: &Path, extra_env: &[(&str, String)]) -> Result<ScriptOutput> {
        let mut stop = self.stop.subscribe();
        if *stop.borrow() {
            return Err(BridgeError::Protocol("script runner is shut down".into()));
        }

        let args = self.command_args(script);
        debug!(program = %self.config.program, args = ?args, "spawning script");
        let child = Command::new(&self.config.program)
            .args(&args)
            .envs(extra_env.iter().map(|(k, v)| (*k, v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        self.active.fetch_add(1, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);

        tokio::select! {
            output = child.wait_with_output() => {
                let output = output?;
                Ok(ScriptOutput {
                    success: output.status.success(),
                    code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                })
            }
            _ = stop.changed() => {
                warn!(script = %script.display(), "script killed by shutdown");
                Err(BridgeError::Protocol("script killed by shutdown".into()))
            }
        }
    }
}

#[async_trait]
impl HostCommands for ScriptRunner {
    async fn get_layers(&self, comp_name: Option<&str>) -> Result<String> {
        let script = self.script(self.config.get_layers.as_ref(), "get-layers")?;
        let env = [("CONECTIFY_COMP_NAME", comp_name.unwrap_or("current").to_string())];
        let out = self.run(&script, &env).await?;
        if !out.success {
            return Err(BridgeError::Protocol(format!("AE Script Error: {}", out.stderr)));
        }
        Ok(out.stdout)
    }

    async fn render(&self, request: &Value) -> Result<String> {
        let script = self.script(self.config.render.as_ref(), "render")?;
        let env = [("CONECTIFY_RENDER_REQUEST", request.to_string())];
        let out = self.run(&script, &env).await?;
        if !out.success {
            let detail = if out.stderr.is_empty() {
                format!("Render process exited with code {}", out.code.unwrap_or(-1))
            } else {
                format!("Render Error: {}", out.stderr)
            };
            return Err(BridgeError::Protocol(detail));
        }
        info!(script = %script.display(), "render finished");
        Ok(out.stdout.trim().to_string())
    }

    async fn cancel_render(&self) -> Result<()> {
        let script = self.script(self.config.cancel.as_ref(), "cancel-render")?;
        let out = self.run(&script, &[]).await?;
        if !out.success {
            warn!(stderr = %out.stderr, "cancel script failed");
        }
        Ok(())
    }

    async fn shutdown(&self) {
        let running = self.active_processes();
        if running > 0 {
            info!(running, "killing running scripts");
        }
        self.stop.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn sh_runner(dir: &Path, get_layers: &str, render: &str) -> ScriptRunner {
        let layers = dir.join("layers.sh");
        std::fs::write(&layers, get_layers).unwrap();
        let render_path = dir.join("render.sh");
        std::fs::write(&render_path, render).unwrap();
        ScriptRunner::new(ScriptsConfig {
            program: "sh".into(),
            args: vec![],
            get_layers: Some(layers),
            render: Some(render_path),
            cancel: None,
        })
    }

    #[test]
    fn test_placeholder_is_substituted() {
        let runner = ScriptRunner::new(ScriptsConfig {
            program: "osascript".into(),
            args: vec!["-e".into(), "do script \"#include {script}\"".into()],
            get_layers: None,
            render: None,
            cancel: None,
        });
        let args = runner.command_args(Path::new("/s/ae-script.jsx"));
        assert_eq!(args, vec!["-e", "do script \"#include /s/ae-script.jsx\""]);
    }

    #[test]
    fn test_script_path_appended_without_placeholder() {
        let runner = ScriptRunner::new(ScriptsConfig {
            program: "sh".into(),
            args: vec!["-e".into()],
            get_layers: None,
            render: None,
            cancel: None,
        });
        assert_eq!(runner.command_args(Path::new("/x.sh")), vec!["-e", "/x.sh"]);
    }

    #[tokio::test]
    async fn test_get_layers_returns_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let runner = sh_runner(
            dir.path(),
            "echo \"{\\\"layers\\\":[{\\\"name\\\":\\\"$CONECTIFY_COMP_NAME\\\"}]}\"",
            "exit 0",
        );
        let out = runner.get_layers(Some("Main")).await.unwrap();
        let v: Value = serde_json::from_str(out.trim()).unwrap();
        assert_eq!(v["layers"][0]["name"], "Main");
        assert_eq!(runner.active_processes(), 0);
    }

    #[tokio::test]
    async fn test_failed_script_is_protocol_error_with_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let runner = sh_runner(dir.path(), "echo nope >&2; exit 2", "exit 3");
        match runner.get_layers(None).await.unwrap_err() {
            BridgeError::Protocol(msg) => assert_eq!(msg, "AE Script Error: nope"),
            other => panic!("unexpected {other:?}"),
        }
        match runner.render(&Value::Null).await.unwrap_err() {
            BridgeError::Protocol(msg) => assert_eq!(msg, "Render process exited with code 3"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_script_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = sh_runner(dir.path(), "exit 0", "exit 0");
        assert_eq!(runner.cancel_render().await.unwrap_err().kind(), "config");
    }

    #[tokio::test]
    async fn test_shutdown_kills_running_script() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(sh_runner(dir.path(), "exit 0", "sleep 30"));
        let task = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.render(&Value::Null).await })
        };
        for _ in 0..100 {
            if runner.active_processes() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        runner.shutdown().await;
        let result = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(result.is_err());
        assert_eq!(runner.active_processes(), 0);
    }
}
