//! Console-backed confirmation channel and terminal.

use crate::config::ConfirmationConfig;
use ag_executor::{
    ApprovalChoice, ApprovalPrompt, CommandOutput, ConfirmationChannel, ExecutorError, ShellRunner,
    TerminalRunner,
};
use ag_policy::PolicyManager;
use async_trait::async_trait;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;

/// Asks on stdout and reads answers from stdin. No answer within the current mode's
/// timeout counts as a decline, as does end of input.
pub struct ConsoleConfirmation {
    policy: Arc<PolicyManager>,
    timeouts: ConfirmationConfig,
    input: Mutex<Lines<BufReader<Stdin>>>,
}

impl ConsoleConfirmation {
    pub fn new(policy: Arc<PolicyManager>, timeouts: ConfirmationConfig) -> Self {
        Self {
            policy,
            timeouts,
            input: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
        }
    }
}

#[async_trait]
impl ConfirmationChannel for ConsoleConfirmation {
    async fn present_approval(
        &self,
        prompt: &ApprovalPrompt,
    ) -> ag_executor::Result<ApprovalChoice> {
        let timeout = self.timeouts.timeout_for(self.policy.mode());
        print_flush(&render_prompt(prompt))?;

        let mut input = self.input.lock().await;
        let answer = tokio::time::timeout(timeout, async {
            loop {
                let Some(line) = input.next_line().await? else {
                    return Ok::<_, std::io::Error>(ApprovalChoice::Decline);
                };
                match parse_choice(&line) {
                    Some(choice) => return Ok(choice),
                    None => print_flush("answer [a]pprove, [d]ecline or [v]iew details: ")?,
                }
            }
        })
        .await;

        match answer {
            Ok(choice) => Ok(choice?),
            Err(_) => {
                tracing::warn!(
                    capability_id = %prompt.capability_id,
                    timeout_secs = timeout.as_secs(),
                    "approval prompt timed out, declining"
                );
                println!("\nno answer within {}s, declined", timeout.as_secs());
                Ok(ApprovalChoice::Decline)
            }
        }
    }
}

pub fn parse_choice(raw: &str) -> Option<ApprovalChoice> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "a" | "approve" | "y" | "yes" => Some(ApprovalChoice::Approve),
        "d" | "decline" | "n" | "no" => Some(ApprovalChoice::Decline),
        "v" | "view" | "details" => Some(ApprovalChoice::ViewDetails),
        _ => None,
    }
}

pub fn render_prompt(prompt: &ApprovalPrompt) -> String {
    let mut out = format!(
        "\napproval required [{} risk] {} ({})\n  {}\n",
        prompt.risk, prompt.kind, prompt.operation_type, prompt.description
    );
    if let Some(details) = &prompt.details {
        for line in details.lines() {
            out.push_str("    ");
            out.push_str(line);
            out.push('\n');
        }
    }
    out.push_str("[a]pprove / [d]ecline / [v]iew details: ");
    out
}

fn print_flush(text: &str) -> std::io::Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(text.as_bytes())?;
    stdout.flush()
}

/// Prints surfaced commands for the human and runs captured ones through the shell.
pub struct ConsoleTerminal {
    shell: ShellRunner,
}

impl ConsoleTerminal {
    pub fn new(shell: ShellRunner) -> Self {
        Self { shell }
    }
}

#[async_trait]
impl TerminalRunner for ConsoleTerminal {
    async fn surface(&self, command: &str, working_directory: &Path) -> ag_executor::Result<()> {
        let cwd = self.shell.root_dir().join(working_directory);
        print_flush(&format!(
            "run this command manually (in {}):\n  $ {command}\n",
            cwd.display()
        ))
        .map_err(ExecutorError::from)
    }

    async fn run_captured(
        &self,
        command: &str,
        working_directory: &Path,
    ) -> ag_executor::Result<CommandOutput> {
        self.shell.run_captured(command, working_directory).await
    }
}
