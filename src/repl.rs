//! Terminal session: reads questions from stdin and streams answers to stdout.
//!
//! ```text
//! > why is the sky blue?
//! > /image shot.png what does this error mean?
//! > /model Gemini 2.5 Pro
//! > /stats
//! > /reset
//! > /quit
//! ```
//!
//! Ctrl-C cancels the answer being streamed; at the prompt it exits.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::conversation::{ImageAttachment, QueryOrchestrator, QueryOutcome};
use crate::inference::{ResponseSink, Settings};
use crate::keys::{KeyPool, UsageSelector, UsageStatistics};

// ─── Commands ────────────────────────────────────────────────────────────────

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Empty,
    Ask(String),
    Image { path: PathBuf, question: String },
    Model(Option<String>),
    Stats,
    Reset,
    Quit,
    Help,
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Command::Empty;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Command::Ask(line.to_string());
        };

        let (name, args) = match rest.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (rest, ""),
        };

        match name.to_ascii_lowercase().as_str() {
            "quit" | "exit" => Command::Quit,
            "reset" | "clear" => Command::Reset,
            "stats" => Command::Stats,
            "help" => Command::Help,
            "model" => Command::Model((!args.is_empty()).then(|| args.to_string())),
            "image" => match args.split_once(char::is_whitespace) {
                Some((path, question)) if !question.trim().is_empty() => Command::Image {
                    path: PathBuf::from(path),
                    question: question.trim().to_string(),
                },
                _ => Command::Unknown("usage: /image <path> <question>".to_string()),
            },
            other => Command::Unknown(format!("unknown command: /{other}")),
        }
    }
}

const HELP: &str = "\
commands:
  <question>                 ask about anything
  /image <path> <question>   ask about an image (png, jpg, gif, webp)
  /model [name]              list models or switch to one
  /stats                     per-key usage counts
  /reset                     start a new conversation
  /quit                      exit";

// ─── Stdout Sink ─────────────────────────────────────────────────────────────

/// Prints only the text appended since the previous update.
#[derive(Default)]
pub struct StdoutSink {
    printed: Mutex<usize>,
}

impl StdoutSink {
    /// The part of `text` not yet printed.
    fn take_suffix<'t>(&self, text: &'t str) -> &'t str {
        let mut printed = self.printed.lock().unwrap_or_else(|e| e.into_inner());
        let suffix = text.get(*printed..).unwrap_or_default();
        *printed = text.len();
        suffix
    }
}

impl ResponseSink for StdoutSink {
    fn on_response_start(&self) {
        *self.printed.lock().unwrap_or_else(|e| e.into_inner()) = 0;
    }

    fn on_response_updated(&self, text: &str, is_complete: bool) {
        let suffix = self.take_suffix(text);
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(suffix.as_bytes());
        if is_complete {
            let _ = out.write_all(b"\n");
        }
        let _ = out.flush();
    }

    fn on_error(&self, message: &str) {
        eprintln!("\nerror: {message}");
    }
}

// ─── Session ─────────────────────────────────────────────────────────────────

/// Render per-key usage counts, marking the key under the rotation cursor.
pub fn format_stats(pool: &KeyPool) -> String {
    let rows = match pool.usage_statistics(&UsageSelector::All) {
        Ok(UsageStatistics::All(rows)) => rows,
        _ => Vec::new(),
    };
    if rows.is_empty() {
        return "no API keys loaded".to_string();
    }
    let current = pool.current_key_name();
    rows.iter()
        .map(|(name, count)| {
            let marker = if Some(name.as_str()) == current { "*" } else { " " };
            format!("{marker} {name}: {count}")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn prompt() {
    let mut out = std::io::stdout().lock();
    let _ = out.write_all(b"> ");
    let _ = out.flush();
}

/// Run the read-query-print loop until `/quit`, end of input or Ctrl-C at
/// the prompt.
pub async fn run(
    orchestrator: Arc<QueryOrchestrator>,
    mut settings: Settings,
    settings_path: PathBuf,
) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();

    // Ctrl-C cancels the streaming answer, or exits when nothing is running.
    let signal_orchestrator = orchestrator.clone();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if !signal_orchestrator.cancel() {
                signal_shutdown.cancel();
                break;
            }
        }
    });

    println!(
        "Gemini Overlay {} ({}). Type /help for commands.",
        env!("CARGO_PKG_VERSION"),
        orchestrator.model().display_name
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        prompt();
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line.context("failed to read stdin")?,
        };
        let Some(line) = line else { break };

        match Command::parse(&line) {
            Command::Empty => {}
            Command::Quit => break,
            Command::Help => println!("{HELP}"),
            Command::Unknown(message) => eprintln!("{message}"),
            Command::Reset => {
                orchestrator.clear_conversation();
                println!("(new conversation)");
            }
            Command::Stats => {
                let stats = {
                    let pool = orchestrator.pool().lock().unwrap_or_else(|e| e.into_inner());
                    format_stats(&pool)
                };
                println!("{stats}");
            }
            Command::Model(None) => {
                let current = orchestrator.model();
                for model in &settings.available_models {
                    let marker = if *model == current { "*" } else { " " };
                    println!("{marker} {}", model.display_name);
                }
            }
            Command::Model(Some(name)) => {
                switch_model(&orchestrator, &mut settings, &settings_path, &name);
            }
            Command::Ask(question) => {
                let outcome = orchestrator.query_text(&question, &StdoutSink::default()).await;
                report(&outcome);
            }
            Command::Image { path, question } => match ImageAttachment::from_file(&path) {
                Ok(image) => {
                    let outcome = orchestrator
                        .query_with_image(image, &question, &StdoutSink::default())
                        .await;
                    report(&outcome);
                }
                Err(e) => eprintln!("error: {e}"),
            },
        }
    }

    orchestrator.cancel();
    tracing::info!("session ended");
    Ok(())
}

fn switch_model(
    orchestrator: &QueryOrchestrator,
    settings: &mut Settings,
    settings_path: &Path,
    name: &str,
) {
    match settings.set_selected_model(name) {
        Ok(model) => {
            println!("(model: {})", model.display_name);
            orchestrator.set_model(model);
            if let Err(e) = settings.save(settings_path) {
                tracing::warn!(error = %e, "failed to persist model selection");
            }
        }
        Err(e) => eprintln!("error: {e}"),
    }
}

fn report(outcome: &QueryOutcome) {
    if let QueryOutcome::Cancelled = outcome {
        println!("\n(cancelled)");
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
