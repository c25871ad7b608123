use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;

use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;
use tracing::{debug, info};

/// A single external process invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Variables stripped from the inherited environment.
    pub env_remove: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Wrap `script` in the platform shell.
    pub fn shell(script: impl Into<String>) -> Self {
        let script = script.into();
        if cfg!(windows) {
            Self::new("cmd").args(["/C".to_string(), script])
        } else {
            Self::new("sh").args(["-c".to_string(), script])
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn envs(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn env_remove(mut self, names: &[String]) -> Self {
        self.env_remove.extend(names.iter().cloned());
        self
    }

    /// The script text for shell-wrapped commands, the joined argv otherwise.
    pub fn display(&self) -> String {
        match self.args.as_slice() {
            [flag, script] if flag == "-c" || flag == "/C" => script.clone(),
            args => {
                let mut parts = vec![self.program.clone()];
                parts.extend(args.iter().cloned());
                parts.join(" ")
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Stderr when present, stdout otherwise.
    pub fn error_text(&self) -> &str {
        if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        }
    }
}

pub trait CommandRunner: Send + Sync {
    /// Spawn the command and wait for it. An `Err` means the process could
    /// not be started; a non-zero exit is reported through the output.
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Like `run`, but a non-zero exit becomes an error.
    fn run_checked(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let output = self.run(spec)?;
        if !output.success {
            bail!(
                "Command '{}' exited with status {}: {}",
                spec.display(),
                output.exit_code,
                output.error_text()
            );
        }
        Ok(output)
    }
}

/// Runs commands for real. Output is relayed to the log line by line while
/// the process runs and is also returned in full.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let mut command = Command::new(&spec.program);
        command.args(&spec.args);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }
        for name in &spec.env_remove {
            command.env_remove(name);
        }
        command
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(command = %spec.display(), "Spawning process");
        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'", spec.program))?;

        let stderr = child.stderr.take();
        let stderr_relay =
            thread::spawn(move || stderr.map(|pipe| relay(pipe, "stderr")).unwrap_or_default());
        let stdout = child
            .stdout
            .take()
            .map(|pipe| relay(pipe, "stdout"))
            .unwrap_or_default();
        let stderr = stderr_relay
            .join()
            .map_err(|_| anyhow!("stderr relay for '{}' panicked", spec.program))?;

        let status = child
            .wait()
            .with_context(|| format!("Failed to wait for '{}'", spec.program))?;

        Ok(CommandOutput {
            success: status.success(),
            exit_code: status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }
}

fn relay(pipe: impl Read, stream: &'static str) -> String {
    let mut reader = BufReader::new(pipe);
    let mut collected = String::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let text = line.trim_end();
                if !text.is_empty() {
                    info!(stream, "{text}");
                }
                collected.push_str(&line);
            }
        }
    }
    collected
}
