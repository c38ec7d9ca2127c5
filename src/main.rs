//! Terminal chat against a local llama.cpp server.
//!
//! Usage: `llama-agent [path/to/agent.yaml]`
//!
//! Type a message and press enter. Ctrl-C interrupts a reply in progress
//! and exits at the prompt. `/reset` clears the conversation, `/quit` (or
//! end of input) exits.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use llama_agent::agent_core::{Agent, AgentError, AgentEvent, AgentStatus};
use llama_agent::config;
use llama_agent::inference::{CompletionResult, LlamaClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_arg = std::env::args_os().nth(1).map(PathBuf::from);

    // Loaded before logging starts so the `logging:` section applies.
    let config = config::load_or_default(config_arg.as_deref())?;
    let log_path =
        llama_agent::init_tracing(&config.logging).context("failed to initialize logging")?;
    tracing::info!(
        endpoint = %config.server.endpoint(),
        template = ?config.agent.template,
        "configuration loaded"
    );

    eprintln!("logging to {}", log_path.display());
    eprintln!("connecting to {} ...", config.server.endpoint());

    let client = Arc::new(
        LlamaClient::launch(config.server.clone(), config.sampling.clone())
            .await
            .context("failed to start inference client")?,
    );

    let agent = Arc::new(Agent::with_event_capacity(
        Uuid::new_v4().to_string(),
        "",
        config.agent.system_prompt(),
        Arc::clone(&client),
        config.agent.event_capacity,
    ));
    let template = config.agent.template;

    agent.warmup().await?;
    match agent.warmup_error() {
        Some(e) => eprintln!("warmup failed ({e}); the first reply will be slow"),
        None => eprintln!("ready ({})", agent.status()),
    }

    let quit = CancellationToken::new();
    let ctrl_c = tokio::spawn(watch_ctrl_c(Arc::clone(&agent), quit.clone()));

    let result = chat(&agent, &template, &quit).await;
    ctrl_c.abort();
    client.shutdown().await;
    result?;

    if quit.is_cancelled() {
        // The abandoned stdin read sits on a blocking thread that would keep
        // the runtime from shutting down.
        std::process::exit(0);
    }
    Ok(())
}

/// What a Ctrl-C press does in a given agent status.
#[derive(Debug, PartialEq, Eq)]
enum CtrlC {
    Interrupt,
    Quit,
}

fn ctrl_c_action(status: AgentStatus) -> CtrlC {
    if status.is_processing() {
        CtrlC::Interrupt
    } else {
        CtrlC::Quit
    }
}

/// Owns SIGINT for the whole session. Once tokio installs its handler the
/// default exit no longer happens, so quitting at the prompt goes through
/// `quit`.
async fn watch_ctrl_c(agent: Arc<Agent>, quit: CancellationToken) {
    loop {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot listen for Ctrl-C");
            return;
        }
        match ctrl_c_action(agent.status()) {
            CtrlC::Interrupt => agent.interrupt().await,
            CtrlC::Quit => {
                quit.cancel();
                return;
            }
        }
    }
}

async fn chat(
    agent: &Agent,
    template: &llama_agent::TemplateFormat,
    quit: &CancellationToken,
) -> anyhow::Result<()> {
    let mut events = agent.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut history: Vec<String> = Vec::new();

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let next = tokio::select! {
            biased;
            _ = quit.cancelled() => None,
            line = lines.next_line() => line?,
        };
        let Some(line) = next else {
            println!();
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" => break,
            "/reset" => {
                history.clear();
                println!("(conversation cleared)");
                continue;
            }
            _ => {}
        }

        history.push(line.to_string());
        let mut echo = Echo::default();

        let outcome = {
            let cycle = agent.listen_think_respond("user", &history, template);
            tokio::pin!(cycle);
            loop {
                tokio::select! {
                    outcome = &mut cycle => break outcome,
                    event = events.recv() => match event {
                        Ok(event) => echo.apply(&event),
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::debug!(skipped, "terminal fell behind agent events");
                        }
                        Err(RecvError::Closed) => {}
                    },
                }
            }
        };
        drain(&mut events, &mut echo);
        println!();

        match outcome {
            Ok(result) => {
                print_metadata(&result);
                history.push(result.text);
            }
            Err(AgentError::Interrupted { partial }) => {
                println!("(interrupted)");
                history.push(partial);
            }
            Err(e) => {
                eprintln!("error: {e}");
                // Drop the unanswered message so turns keep alternating.
                history.pop();
            }
        }
    }

    Ok(())
}

fn drain(events: &mut broadcast::Receiver<AgentEvent>, echo: &mut Echo) {
    loop {
        match events.try_recv() {
            Ok(event) => echo.apply(&event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
}

/// Prints the growth of the pending message.
#[derive(Default)]
struct Echo {
    shown: String,
}

impl Echo {
    fn apply(&mut self, event: &AgentEvent) {
        let AgentEvent::PendingMessage { text } = event else {
            return;
        };
        if text.is_empty() {
            self.shown.clear();
        } else if let Some(grown) = text.strip_prefix(self.shown.as_str()) {
            print!("{grown}");
            let _ = std::io::stdout().flush();
            self.shown.clone_from(text);
        }
        // Otherwise it is the trimmed final text, already on screen.
    }
}

fn print_metadata(result: &CompletionResult) {
    let mut parts = Vec::new();
    if let Some(secs) = result.response_start_seconds {
        parts.push(format!("first token {secs:.2}s"));
    }
    if let Some(tps) = result.predicted_per_second {
        parts.push(format!("{tps:.1} tok/s"));
    }
    if let Some(n) = result.tokens_predicted {
        parts.push(format!("{n} tokens"));
    }
    if !parts.is_empty() {
        println!("[{}]", parts.join(", "));
    }
}
