//! External program consumer
//!
//! Spawns a program once and writes each event to its stdin as one JSON
//! line. With `pass_config` the line is `{"event": ..., "config": ...}`.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::core::FlowEvent;

use super::EventConsumer;

/// How long `close` waits for the program to exit after stdin is closed
const EXIT_GRACE: Duration = Duration::from_secs(5);

pub struct CommandConsumer {
    program: String,
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
}

impl CommandConsumer {
    /// Spawn `argv[0]` with the remaining arguments
    pub fn spawn(argv: &[String]) -> anyhow::Result<Self> {
        let Some((program, args)) = argv.split_first() else {
            bail!("plugin command is empty");
        };

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", program))?;

        let stdin = child.stdin.take().context("Plugin stdin not captured")?;
        info!(program = %program, pid = ?child.id(), "plugin started");

        Ok(Self {
            program: program.clone(),
            child: Mutex::new(child),
            stdin: Mutex::new(Some(stdin)),
        })
    }
}

#[async_trait]
impl EventConsumer for CommandConsumer {
    fn name(&self) -> &str {
        "command"
    }

    async fn handle(&self, event: &FlowEvent, config: Option<&Config>) -> anyhow::Result<()> {
        let mut line = match config {
            Some(config) => serde_json::to_vec(&serde_json::json!({
                "event": event,
                "config": config,
            }))?,
            None => serde_json::to_vec(event)?,
        };
        line.push(b'\n');

        let mut stdin = self.stdin.lock().await;
        let Some(pipe) = stdin.as_mut() else {
            bail!("plugin {} already closed", self.program);
        };
        pipe.write_all(&line)
            .await
            .with_context(|| format!("Failed to write to plugin {}", self.program))?;
        pipe.flush().await?;
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        // EOF on stdin tells the program to finish
        drop(self.stdin.lock().await.take());

        let mut child = self.child.lock().await;
        match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
            Ok(status) => {
                let status = status?;
                if !status.success() {
                    warn!(program = %self.program, %status, "plugin exited with failure");
                }
            }
            Err(_) => {
                warn!(program = %self.program, "plugin did not exit, killing it");
                child.kill().await?;
            }
        }
        Ok(())
    }
}
