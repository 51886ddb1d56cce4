//! Run chat turns with token-budgeted memory from the command line.
//!
//! History is stored as one JSON file per session under `--data-dir`, and
//! the session ledger is persisted to `<data-dir>/ledger.json` between runs.
//! The API key is read from `OPENROUTER_KEY` (chat provider) or
//! `OPENAI_API_KEY` (responses provider).
//!
//! # Examples
//!
//! ```sh
//! # One turn, compacting once the session passes 4000 tokens
//! cinch-memory --max-history-tokens 4000 --notify \
//!   chat --session cli:me --message "Remind me what we planned" --trace
//!
//! # Stateful provider with native compaction
//! cinch-memory --provider responses --state-mode previous_response_id \
//!   compact --session cli:me
//!
//! # Inspect a session
//! cinch-memory status --session cli:me
//! ```

use cinch_memory::compaction::{CompactionRequest, HistoryCompactor, StateMode};
use cinch_memory::config::{MemoryConfig, ProviderKind};
use cinch_memory::history::{FileHistoryStore, HistoryStore};
use cinch_memory::ledger::{LedgerSnapshot, SessionLedger};
use cinch_memory::turn::{TurnInput, TurnRunner};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Token-budgeted conversation memory.
#[derive(Parser)]
#[command(name = "cinch-memory")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    // ── Storage ────────────────────────────────────────────────
    /// Directory holding history files and ledger.json
    #[arg(long, global = true, default_value = ".cinch-memory")]
    data_dir: PathBuf,

    /// JSON config file; flags below override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    // ── Provider ───────────────────────────────────────────────
    /// Generation backend: chat or responses
    #[arg(long, global = true)]
    provider: Option<ProviderKind>,

    /// Model identifier
    #[arg(long, global = true)]
    model: Option<String>,

    // ── Memory budget ──────────────────────────────────────────
    /// Compact a session once its cumulative tokens reach this ceiling
    #[arg(long, global = true)]
    max_history_tokens: Option<u64>,

    /// Keep at most this many stored turns
    #[arg(long, global = true)]
    max_history_messages: Option<usize>,

    /// full_messages or previous_response_id
    #[arg(long, global = true)]
    state_mode: Option<StateMode>,

    /// Report compaction progress
    #[arg(long, global = true)]
    notify: bool,

    /// Directory with compact.md, policies/ and channels/ prompt files
    #[arg(long, global = true)]
    prompts_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run one chat turn and print the answer
    Chat {
        #[arg(long)]
        session: String,
        #[arg(long)]
        message: String,
        /// Channel name for channel-specific prompts
        #[arg(long)]
        channel: Option<String>,
        /// Also print compaction updates and the token trace
        #[arg(long)]
        trace: bool,
    },
    /// Compact a session if it is over budget
    Compact {
        #[arg(long)]
        session: String,
    },
    /// Print a session's stored turns and counters
    Status {
        #[arg(long)]
        session: String,
    },
}

impl Cli {
    fn resolve_config(&self) -> Result<MemoryConfig, String> {
        let mut config = match &self.config {
            Some(path) => MemoryConfig::load(path)?,
            None => MemoryConfig::default(),
        };
        if let Some(provider) = self.provider {
            config.provider = provider;
        }
        if let Some(model) = &self.model {
            config.model = Some(model.clone());
        }
        if let Some(tokens) = self.max_history_tokens {
            config.max_history_tokens = Some(tokens);
        }
        if let Some(messages) = self.max_history_messages {
            config.max_history_messages = Some(messages);
        }
        if let Some(mode) = self.state_mode {
            config.state_mode = mode;
        }
        if self.notify {
            config.notify_compaction_updates = true;
        }
        if let Some(dir) = &self.prompts_dir {
            config.prompts_dir = Some(dir.clone());
        }
        Ok(config)
    }
}

// ── Ledger persistence ─────────────────────────────────────────────

fn ledger_path(data_dir: &Path) -> PathBuf {
    data_dir.join("ledger.json")
}

fn load_ledger(path: &Path) -> Result<SessionLedger, String> {
    let ledger = SessionLedger::new();
    if !path.exists() {
        return Ok(ledger);
    }
    let json = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read ledger {}: {e}", path.display()))?;
    let snapshot: LedgerSnapshot = serde_json::from_str(&json)
        .map_err(|e| format!("Failed to parse ledger {}: {e}", path.display()))?;
    ledger.restore(snapshot);
    Ok(ledger)
}

/// Atomic write: serialize to a temp file, then rename into place.
fn save_ledger(path: &Path, ledger: &SessionLedger) -> Result<(), String> {
    let tmp_path = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(&ledger.snapshot())
        .map_err(|e| format!("Failed to serialize ledger: {e}"))?;
    std::fs::write(&tmp_path, json).map_err(|e| format!("Failed to write temp ledger: {e}"))?;
    std::fs::rename(&tmp_path, path).map_err(|e| format!("Failed to rename ledger: {e}"))?;
    Ok(())
}

fn api_key(config: &MemoryConfig) -> Result<String, String> {
    let var = config.api_key_env();
    std::env::var(var).map_err(|_| format!("{var} environment variable is not set"))
}

// ── Commands ───────────────────────────────────────────────────────

async fn run(cli: Cli) -> Result<(), String> {
    let config = cli.resolve_config()?;
    let history = Arc::new(FileHistoryStore::new(cli.data_dir.join("history"))?);
    let ledger_file = ledger_path(&cli.data_dir);
    let ledger = Arc::new(load_ledger(&ledger_file)?);

    match cli.command {
        Command::Status { session } => {
            let turns = history.fetch(&session).await?;
            let status = json!({
                "session": session,
                "turns": turns.len(),
                "total_tokens": ledger.current_tokens(&session),
                "has_previous_response_id": ledger.has_previous_response_id(&session),
                "usage": ledger.latest_usage_trace(&session),
            });
            print_json(&status)?;
            return Ok(());
        }
        Command::Compact { session } => {
            let compactor = build_compactor(&config, history, Arc::clone(&ledger))?;
            let prefix = if config.prompt_cache_enabled {
                session.clone()
            } else {
                format!("{session}:runtime")
            };
            let system_prompt = compactor
                .prompts()
                .compose_system_prompt(&config.system_prompt, None);
            let request = CompactionRequest::new(&session, &prefix, &system_prompt)
                .with_notify(config.notify_compaction_updates)
                .with_state_mode(config.state_mode);
            let outcome = compactor.compact_if_needed(request).await;
            print_json(&outcome)?;
        }
        Command::Chat {
            session,
            message,
            channel,
            trace,
        } => {
            let compactor = build_compactor(&config, history, Arc::clone(&ledger))?;
            let runner = TurnRunner::new(compactor, config.build_turn_config());
            let input = TurnInput {
                channel: channel.as_deref(),
                owner_id: None,
            };
            let report = runner.run_turn_with(&session, &message, input).await?;
            // Saved before any output.
            save_ledger(&ledger_file, &ledger)?;
            if trace {
                print_json(&report)?;
            } else {
                println!("{}", report.answer);
            }
            return Ok(());
        }
    }

    save_ledger(&ledger_file, &ledger)
}

fn build_compactor(
    config: &MemoryConfig,
    history: Arc<FileHistoryStore>,
    ledger: Arc<SessionLedger>,
) -> Result<HistoryCompactor, String> {
    let client = config.build_client(&api_key(config)?)?;
    Ok(
        HistoryCompactor::new(history, client, ledger, config.build_compaction_config())
            .with_prompt_composer(Arc::new(config.build_prompt_composer())),
    )
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), String> {
    let json =
        serde_json::to_string_pretty(value).map_err(|e| format!("Failed to serialize output: {e}"))?;
    println!("{json}");
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
