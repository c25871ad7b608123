use std::io::{self, BufRead, BufReader, Read, Write};
use std::sync::Mutex;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use clap::ValueEnum;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Proceed,
    Abort,
}

#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub stage: String,
    pub message: String,
    /// `None` waits until an answer arrives.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalDecision {
    pub decision: Decision,
    pub reason: String,
}

impl ApprovalDecision {
    pub fn proceed(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Proceed,
            reason: reason.into(),
        }
    }

    pub fn abort(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Abort,
            reason: reason.into(),
        }
    }
}

/// Source of human decisions for approval gates.
pub trait ApprovalChannel: Send + Sync {
    fn decide(&self, request: &ApprovalRequest) -> Result<ApprovalDecision>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ApprovalMode {
    /// Ask on the terminal.
    Prompt,
    /// Approve every gate without asking.
    Approve,
    /// Reject every gate without asking.
    Reject,
}

impl ApprovalMode {
    pub fn channel(self) -> Box<dyn ApprovalChannel> {
        match self {
            ApprovalMode::Prompt => Box::new(PromptApproval::stdin()),
            ApprovalMode::Approve => Box::new(FixedApproval(Decision::Proceed)),
            ApprovalMode::Reject => Box::new(FixedApproval(Decision::Abort)),
        }
    }
}

/// Answers every gate the same way; used for unattended runs.
#[derive(Debug, Clone, Copy)]
pub struct FixedApproval(pub Decision);

impl ApprovalChannel for FixedApproval {
    fn decide(&self, request: &ApprovalRequest) -> Result<ApprovalDecision> {
        let decision = match self.0 {
            Decision::Proceed => ApprovalDecision::proceed("approved by --approval flag"),
            Decision::Abort => ApprovalDecision::abort("rejected by --approval flag"),
        };
        info!(stage = %request.stage, decision = ?decision.decision, "Approval decided non-interactively");
        Ok(decision)
    }
}

/// Reads answers line by line. Input is consumed on a helper thread so a
/// gate can give up after its timeout. Anything typed before a gate opens is
/// discarded, so only answers given to a visible prompt count.
pub struct PromptApproval {
    lines: Mutex<Receiver<String>>,
    output: Mutex<Box<dyn Write + Send>>,
}

impl PromptApproval {
    pub fn stdin() -> Self {
        Self::from_reader(io::stdin())
    }

    pub fn from_reader<R: Read + Send + 'static>(reader: R) -> Self {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            for line in BufReader::new(reader).lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        Self::from_channel(rx)
    }

    pub fn from_channel(lines: Receiver<String>) -> Self {
        Self {
            lines: Mutex::new(lines),
            output: Mutex::new(Box::new(io::stderr())),
        }
    }

    /// Write prompts somewhere other than stderr.
    pub fn with_output(mut self, output: impl Write + Send + 'static) -> Self {
        self.output = Mutex::new(Box::new(output));
        self
    }

    fn prompt(&self, request: &ApprovalRequest) {
        let Ok(mut output) = self.output.lock() else {
            return;
        };
        let _ = write!(
            output,
            "[{}] {} [yes/no]: ",
            request.stage, request.message
        );
        let _ = output.flush();
    }
}

impl ApprovalChannel for PromptApproval {
    fn decide(&self, request: &ApprovalRequest) -> Result<ApprovalDecision> {
        let lines = self
            .lines
            .lock()
            .map_err(|_| anyhow!("approval input lock poisoned"))?;
        let stale = lines.try_iter().count();
        if stale > 0 {
            warn!(
                stage = %request.stage,
                discarded = stale,
                "Ignoring input typed before the approval prompt"
            );
        }
        let deadline = request.timeout.map(|timeout| Instant::now() + timeout);

        loop {
            self.prompt(request);
            let line = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    lines.recv_timeout(remaining)
                }
                None => lines.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };

            match line {
                Ok(answer) => match parse_answer(&answer) {
                    Some(Decision::Proceed) => {
                        return Ok(ApprovalDecision::proceed("approved by operator"));
                    }
                    Some(Decision::Abort) => {
                        return Ok(ApprovalDecision::abort("rejected by operator"));
                    }
                    None => warn!(answer = %answer.trim(), "Unrecognised answer; expected yes or no"),
                },
                Err(RecvTimeoutError::Timeout) => {
                    let waited = request.timeout.unwrap_or_default().as_secs();
                    return Ok(ApprovalDecision::abort(format!(
                        "no decision within {waited}s; rejecting by default"
                    )));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Ok(ApprovalDecision::abort(
                        "approval input closed before a decision",
                    ));
                }
            }
        }
    }
}

pub fn parse_answer(answer: &str) -> Option<Decision> {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" | "approve" | "proceed" => Some(Decision::Proceed),
        "n" | "no" | "reject" | "abort" => Some(Decision::Abort),
        _ => None,
    }
}
