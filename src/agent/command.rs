use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use super::stream::{ContentBlock, StreamEvent, tool_summary};
use super::{AgentCall, AgentExecutor, AgentOutput, AgentUsage};
use crate::config::PorterConfig;
use crate::errors::AgentError;

/// Runs an external agent CLI once per call.
///
/// Instructions go to stdin. Stdout is read line by line as `stream-json`;
/// lines that are not JSON are kept verbatim, so plain-text agents work too.
/// The combined output is written to
/// `<log_dir>/<run_id>/<unit>-<phase>-<attempt>.log`, which is the call's
/// artifact.
pub struct CommandAgent {
    command: String,
    args: Vec<String>,
    resume_flag: String,
    working_dir: PathBuf,
    log_dir: PathBuf,
}

/// What was collected from one agent process.
#[derive(Debug, Default)]
struct CollectedOutput {
    text: String,
    final_result: Option<String>,
    is_error: bool,
    session_id: Option<String>,
    usage: AgentUsage,
}

impl CommandAgent {
    pub fn new(
        command: impl Into<String>,
        args: Vec<String>,
        resume_flag: impl Into<String>,
        working_dir: PathBuf,
        log_dir: PathBuf,
    ) -> Self {
        Self {
            command: command.into(),
            args,
            resume_flag: resume_flag.into(),
            working_dir,
            log_dir,
        }
    }

    pub fn from_config(config: &PorterConfig) -> Self {
        Self::new(
            config.agent_cmd(),
            config.toml.agent.args.clone(),
            config.toml.agent.resume_flag.clone(),
            config.workdir.clone(),
            config.log_dir(),
        )
    }

    fn output_path(&self, call: &AgentCall) -> PathBuf {
        self.log_dir.join(&call.run_id).join(format!(
            "{}-{}-{}.log",
            file_safe(&call.unit_id),
            call.phase,
            call.attempt
        ))
    }

    fn build_command(&self, call: &AgentCall) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        if let Some(token) = &call.continuation_token
            && !self.resume_flag.is_empty()
        {
            cmd.arg(&self.resume_flag).arg(token);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(&self.working_dir)
            .kill_on_drop(true);
        cmd
    }
}

fn file_safe(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn absorb_line(line: &str, out: &mut CollectedOutput) {
    match serde_json::from_str::<StreamEvent>(line) {
        Ok(StreamEvent::Assistant {
            message,
            session_id,
        }) => {
            if !session_id.is_empty() {
                out.session_id = Some(session_id);
            }
            for block in message.content {
                match block {
                    ContentBlock::Text { text } => {
                        out.text.push_str(&text);
                        out.text.push('\n');
                    }
                    ContentBlock::ToolUse { name, input } => {
                        debug!(tool = %tool_summary(&name, &input), "agent tool use");
                    }
                    ContentBlock::Other => {}
                }
            }
        }
        Ok(StreamEvent::Result {
            subtype,
            result,
            is_error,
            session_id,
            total_cost_usd,
            num_turns,
            duration_ms,
            usage,
        }) => {
            debug!(%subtype, is_error, "agent result");
            out.final_result = result;
            out.is_error = is_error;
            if session_id.is_some() {
                out.session_id = session_id;
            }
            out.usage.cost_usd = total_cost_usd.unwrap_or(0.0);
            out.usage.turns = num_turns.unwrap_or(0);
            out.usage.duration_ms = duration_ms.unwrap_or(0);
            if let Some(usage) = usage {
                out.usage.input_tokens = usage.total_input();
                out.usage.output_tokens = usage.output_tokens;
            }
        }
        Ok(StreamEvent::System { session_id, .. }) | Ok(StreamEvent::User { session_id }) => {
            if session_id.is_some() {
                out.session_id = session_id;
            }
        }
        Err(_) => {
            out.text.push_str(line);
            out.text.push('\n');
        }
    }
}

async fn write_output(path: &Path, content: &str) -> Result<(), AgentError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, content).await?;
    Ok(())
}

#[async_trait]
impl AgentExecutor for CommandAgent {
    async fn invoke(&self, call: &AgentCall) -> Result<AgentOutput, AgentError> {
        let start = Instant::now();
        let output_path = self.output_path(call);

        let mut child = self
            .build_command(call)
            .spawn()
            .map_err(|source| AgentError::SpawnFailed {
                command: self.command.clone(),
                source,
            })?;
        debug!(pid = child.id().unwrap_or(0), command = %self.command, "agent spawned");

        if let Some(mut stdin) = child.stdin.take() {
            // An agent that exits without reading stdin closes the pipe; the
            // exit status decides the outcome.
            if let Err(e) = stdin.write_all(call.instructions.as_bytes()).await {
                debug!(error = %e, "agent closed stdin early");
            }
            let _ = stdin.shutdown().await;
        }

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let mut collected = CollectedOutput::default();
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                if !line.trim().is_empty() {
                    absorb_line(&line, &mut collected);
                }
            }
        }

        let status = child.wait().await?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        let mut content = collected.final_result.clone().unwrap_or_else(|| collected.text.clone());
        if !stderr.trim().is_empty() {
            content.push_str("\n--- stderr ---\n");
            content.push_str(&stderr);
        }
        write_output(&output_path, &content).await?;

        if !status.success() {
            let exit_code = status.code().unwrap_or(-1);
            warn!(exit_code, unit = %call.unit_id, phase = %call.phase, "agent exited with failure");
            return Err(AgentError::NonZeroExit { exit_code });
        }
        if collected.is_error {
            return Err(AgentError::Reported(
                collected
                    .final_result
                    .unwrap_or_else(|| "agent reported an error without details".to_string()),
            ));
        }

        let mut usage = collected.usage;
        if usage.duration_ms == 0 {
            usage.duration_ms = start.elapsed().as_millis() as u64;
        }

        Ok(AgentOutput {
            artifacts: vec![output_path],
            continuation_token: collected.session_id,
            usage,
        })
    }
}
