//! Command-line entry points.

use crate::config::Config;
use crate::exchange::{Exchange, GenerationRequest, GenerationState, GenerationStatus};
use crate::generation::{GenerationParams, Message, Progress};
use crate::hook::{IntentEvent, IntentHook};
use crate::simulate::{ScriptStep, ScriptedExecutor, SimulatedBudget};
use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::io::{self, BufRead, Write};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Generation exchange for co-writing stories with an AI text generator
#[derive(Parser, Debug)]
#[command(name = "storyloom", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose logging to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the exchange against a scripted model and a simulated budget
    Simulate(SimulateArgs),
    /// View configuration
    Config(ConfigArgs),
}

#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show config file path
    Path,
    /// Print the effective configuration
    Show,
}

#[derive(Parser, Debug)]
pub struct SimulateArgs {
    /// Number of generation tasks to submit
    #[arg(short = 'n', long, default_value_t = 3)]
    pub tasks: usize,

    /// Failure message injected into the first task (repeatable)
    #[arg(long = "fail", value_name = "MESSAGE")]
    pub failures: Vec<String>,

    /// Output volume the budget allows at start
    #[arg(long, default_value_t = 100)]
    pub allowed: u64,

    /// Output volume requested per task
    #[arg(long, default_value_t = 40)]
    pub max_tokens: u32,

    /// Smallest output volume a task accepts
    #[arg(long)]
    pub min_tokens: Option<u32>,

    /// Seconds until the budget refills
    #[arg(long, default_value_t = 3)]
    pub cooldown_secs: u64,

    /// Simulated model latency per call
    #[arg(long, default_value_t = 300)]
    pub latency_ms: u64,

    /// Override the configured retry limit
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Continue budget waits without asking
    #[arg(long)]
    pub auto_confirm: bool,

    /// Output format
    #[arg(short = 'o', long, default_value = "text", value_enum)]
    pub output_format: OutputFormat,
}

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    StreamJson,
}

/// JSON output structure for stream-json mode
#[derive(Serialize)]
#[serde(tag = "type")]
enum JsonEvent<'a> {
    #[serde(rename = "state")]
    State { state: &'a GenerationState },
    #[serde(rename = "text_delta")]
    TextDelta { task: usize, text: &'a str },
    #[serde(rename = "done")]
    Done { task: usize, response: &'a str },
    #[serde(rename = "error")]
    Error { task: usize, message: String },
}

fn emit_json(event: &JsonEvent<'_>) {
    match serde_json::to_string(event) {
        Ok(json) => println!("{json}"),
        Err(e) => tracing::warn!("Failed to encode event: {e}"),
    }
}

/// Initialize tracing the same way for every subcommand.
///
/// `STORYLOOM_LOG` sends debug logs to a file, `--verbose` to stderr;
/// otherwise `RUST_LOG` is honored.
pub fn init_tracing(verbose: bool, config: &Config) {
    if std::env::var("STORYLOOM_LOG").is_ok() {
        use std::fs::File;
        use tracing_subscriber::prelude::*;
        let path = config.log_file();
        match File::create(&path) {
            Ok(file) => {
                let file_layer = tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false);
                let filter = tracing_subscriber::EnvFilter::new("storyloom=debug");
                let _ = tracing_subscriber::registry()
                    .with(file_layer.with_filter(filter))
                    .try_init();
            }
            Err(err) => {
                eprintln!("Failed to create log file {}: {err}", path.display());
            }
        }
    } else if verbose {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(std::io::stderr)
            .try_init();
    } else if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .try_init();
    }
}

pub fn config_command(args: &ConfigArgs) -> Result<ExitCode> {
    match args.action {
        Some(ConfigAction::Path) => {
            println!("{}", Config::path().display());
        }
        Some(ConfigAction::Show) | None => {
            let config = Config::load()?;
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }
    Ok(ExitCode::SUCCESS)
}

const STORY_BEATS: [&str; 4] = [
    "The lighthouse keeper counted the ships that never came.",
    "Salt crusted the ledger where the last entry ended mid-sentence.",
    "A lantern answered from the reef, though no boat was there.",
    "By morning the tide had written a name across the sand.",
];

fn story_beat(i: usize) -> String {
    STORY_BEATS[i % STORY_BEATS.len()].to_string()
}

/// Run the simulation, returning the process exit code.
pub async fn simulate(args: SimulateArgs, config: Config) -> ExitCode {
    match simulate_inner(args, config).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(1)
        }
    }
}

async fn simulate_inner(args: SimulateArgs, config: Config) -> Result<ExitCode> {
    if args.tasks == 0 {
        anyhow::bail!("Nothing to simulate: --tasks must be at least 1");
    }

    // Refill must cover one request, otherwise the budget wait never ends.
    let capacity = u64::from(args.max_tokens).max(args.allowed).max(1);
    let budget = Arc::new(
        SimulatedBudget::new(args.allowed, Duration::from_secs(args.cooldown_secs))
            .with_capacity(capacity),
    );

    let mut script: Vec<ScriptStep> = args
        .failures
        .iter()
        .cloned()
        .map(ScriptStep::Fail)
        .collect();
    script.push(ScriptStep::Succeed(story_beat(0)));
    script.extend((1..args.tasks).map(|i| ScriptStep::Succeed(story_beat(i))));

    let executor = Arc::new(
        ScriptedExecutor::new(story_beat(0))
            .with_script(script)
            .with_latency(Duration::from_millis(args.latency_ms))
            .with_budget(budget.clone()),
    );

    let hook = IntentHook::new();
    let exchange = Exchange::new(executor, budget, &hook, config.exchange);
    let format = args.output_format;

    let prompt_hook = hook.clone();
    let auto_confirm = args.auto_confirm;
    let subscription = exchange.subscribe(move |state| {
        match format {
            OutputFormat::Text => print_state(state),
            OutputFormat::StreamJson => emit_json(&JsonEvent::State { state }),
        }
        if state.status == GenerationStatus::WaitingForUser && auto_confirm {
            prompt_hook.fire(&IntentEvent::human().with_source("auto-confirm"));
        }
    });

    if !args.auto_confirm {
        let stdin_hook = hook.clone();
        // Each line on stdin counts as the user pressing Continue. A plain
        // thread, so a pending read never holds up runtime shutdown.
        std::thread::spawn(move || {
            for line in io::stdin().lock().lines() {
                if line.is_err() {
                    break;
                }
                stdin_hook.fire(&IntentEvent::human().with_source("stdin"));
            }
        });
    }

    let mut params = GenerationParams::default().with_max_tokens(args.max_tokens);
    if let Some(min) = args.min_tokens {
        params = params.with_min_tokens(min);
    }
    if let Some(max_retries) = args.max_retries {
        params = params.with_max_retries(max_retries);
    }

    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<(usize, String)>();
    let mut pending = Vec::with_capacity(args.tasks);
    for i in 0..args.tasks {
        let (tx, mut rx) = mpsc::unbounded_channel::<Progress>();
        let forward = progress_tx.clone();
        tokio::spawn(async move {
            while let Some(progress) = rx.recv().await {
                for choice in progress.choices {
                    let _ = forward.send((i, choice.text));
                }
            }
        });
        let request = GenerationRequest::new(
            vec![
                Message::system("You are a co-author continuing a short story."),
                Message::user(format!("Write beat {} of the story.", i + 1)),
            ],
            params.clone(),
        )
        .with_progress(tx);
        pending.push(exchange.submit(request));
    }
    drop(progress_tx);

    let printer = tokio::spawn(async move {
        while let Some((task, text)) = progress_rx.recv().await {
            match format {
                OutputFormat::Text => {
                    print!("{text}");
                    let _ = io::stdout().flush();
                }
                OutputFormat::StreamJson => emit_json(&JsonEvent::TextDelta { task, text: &text }),
            }
        }
    });

    let results = futures::future::join_all(pending).await;
    let _ = printer.await;
    subscription.unsubscribe();

    let mut failed = 0;
    for (task, result) in results.iter().enumerate() {
        match (result, format) {
            (Ok(response), OutputFormat::Text) => {
                println!("\n[task {}] done: {}", task + 1, response.text());
            }
            (Ok(response), OutputFormat::StreamJson) => emit_json(&JsonEvent::Done {
                task,
                response: response.text(),
            }),
            (Err(e), OutputFormat::Text) => {
                failed += 1;
                eprintln!("[task {}] error: {e}", task + 1);
            }
            (Err(e), OutputFormat::StreamJson) => {
                failed += 1;
                emit_json(&JsonEvent::Error {
                    task,
                    message: e.to_string(),
                });
            }
        }
    }

    Ok(if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn print_state(state: &GenerationState) {
    let mut line = format!(
        "[{}] queue={}",
        state.status.as_str(),
        state.queue_length
    );
    match state.status {
        GenerationStatus::WaitingForUser => {
            let secs = state.budget_wait_time.map_or(0, |d| d.as_secs());
            line.push_str(&format!(
                " budget exhausted, ~{secs}s until refill; press Enter to continue"
            ));
        }
        GenerationStatus::WaitingForBudget => {
            let secs = state.budget_time_remaining.map_or(0, |d| d.as_secs());
            line.push_str(&format!(" cooldown {secs}s"));
        }
        GenerationStatus::Failed => {
            if let Some(error) = &state.error {
                line.push_str(&format!(" error: {error}"));
            }
        }
        _ => {}
    }
    eprintln!("{line}");
}
