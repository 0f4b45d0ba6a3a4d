//! Command-line surface: argument parsing, logging setup, and the
//! interactive command loop.
//!
//! Shaped after `swedishembedded-sven`'s `Cli`/`Commands` split — a flat set
//! of global flags plus an optional subcommand, with `clap::Parser`
//! doc-comments doubling as `--help` text. Unlike that binary this crate has
//! no TUI half to dispatch to: when no subcommand is given the process
//! drops into a line-oriented REPL against a [`Commander`], which is this
//! binary's "interactive run (default)" mode.

use std::io::Write as _;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::commander::{Commander, CommanderError};

/// Zoea Nova: a swarm runtime orchestrating autonomous LLM-driven myses
/// over a shared game tool server.
#[derive(Parser, Debug)]
#[command(name = "zoea-nova", version, about)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "ZOEA_CONFIG", default_value = "zoea.toml")]
    pub config: PathBuf,

    /// Increase logging verbosity; repeat for more (-v info, -vv debug).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Debug mode: force debug-level logging and reset the log file.
    #[arg(long)]
    pub debug: bool,

    /// Write logs to this file in addition to stderr.
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Offline run: replace the upstream tool server with a stub that
    /// answers a fixed set of read-only tools with canned data.
    #[arg(long)]
    pub offline: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// One-shot subcommands. Each connects to the store/swarm described by
/// `--config`, performs a single operation, and exits — an alternative to
/// the interactive REPL for scripting.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the interactive command loop (same as passing no subcommand).
    Run,
    /// Create a new mysis.
    Create {
        name: String,
        #[arg(long)]
        provider: String,
        #[arg(long)]
        model: String,
        #[arg(long, default_value_t = 0.7)]
        temperature: f32,
        #[arg(long)]
        system_prompt: Option<String>,
    },
    /// Start an existing mysis's turn loop.
    Start { id: Uuid },
    /// Stop a running mysis.
    Stop { id: Uuid },
    /// Delete a mysis and its persisted state.
    Delete { id: Uuid },
    /// List every mysis and its current state.
    List,
    /// Queue a direct message for a mysis.
    Send { id: Uuid, message: String },
    /// Broadcast a message to every running mysis.
    Broadcast { message: String },
    /// Search broadcast history for a substring.
    Search {
        query: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show how many shared game accounts are claimed versus free.
    Accounts,
}

/// Initialize `env_logger` per the CLI's verbosity flags. `-v` raises the
/// default level to `info`, `-vv` (or more) to `debug`; `--debug` forces
/// `debug` regardless of `-v` and truncates `log_file` if one is given, so
/// each debug run starts from an empty file instead of appending.
pub fn init_logging(verbose: u8, debug: bool, log_file: Option<&PathBuf>) {
    let level = if debug || verbose >= 2 {
        "debug"
    } else if verbose == 1 {
        "info"
    } else {
        "warn"
    };

    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", level);
    }

    if let Some(path) = log_file {
        if debug {
            if let Err(err) = std::fs::File::create(path) {
                eprintln!("warning: could not reset log file {:?}: {}", path, err);
            }
        }
        let target = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()
            .map(|file| Box::new(file) as Box<dyn std::io::Write + Send>);
        if let Some(target) = target {
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
                .target(env_logger::Target::Pipe(target))
                .init();
            return;
        }
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

/// Execute a single one-shot [`Commands`] variant against `commander`.
/// Returns the text to print to stdout on success.
pub async fn run_command(commander: &Commander, command: Commands) -> Result<String, CommanderError> {
    match command {
        Commands::Run => Ok(String::new()),
        Commands::Create {
            name,
            provider,
            model,
            temperature,
            system_prompt,
        } => {
            let id = commander
                .create_mysis(name, provider, model, temperature, system_prompt)
                .await?;
            Ok(format!("created mysis {}", id))
        }
        Commands::Start { id } => {
            commander.start_mysis(id).await?;
            Ok(format!("started {}", id))
        }
        Commands::Stop { id } => {
            commander.stop_mysis(id).await?;
            Ok(format!("stopped {}", id))
        }
        Commands::Delete { id } => {
            commander.delete_mysis(id).await?;
            Ok(format!("deleted {}", id))
        }
        Commands::List => {
            let records = commander.list_myses().await?;
            if records.is_empty() {
                return Ok("no myses".to_string());
            }
            Ok(records
                .iter()
                .map(|r| format!("{}  {:<20}  {}  {}", r.id, r.name, r.state.as_str(), r.provider_name))
                .collect::<Vec<_>>()
                .join("\n"))
        }
        Commands::Send { id, message } => {
            commander.send_message_async(id, message).await?;
            Ok(format!("queued message for {}", id))
        }
        Commands::Broadcast { message } => {
            let record = commander.broadcast(message).await?;
            Ok(format!("broadcast {} sent", record.id))
        }
        Commands::Search { query, limit } => {
            let hits = commander.search_broadcasts(query, limit).await?;
            if hits.is_empty() {
                return Ok("no matches".to_string());
            }
            Ok(hits
                .iter()
                .map(|b| format!("{}  {}  {}", b.id, b.sender_id, b.content))
                .collect::<Vec<_>>()
                .join("\n"))
        }
        Commands::Accounts => {
            let counts = commander.account_status().await?;
            Ok(format!(
                "in use: {}, free: {}",
                counts.get(&true).copied().unwrap_or(0),
                counts.get(&false).copied().unwrap_or(0)
            ))
        }
    }
}

/// Parse one REPL line into a [`Commands`], reusing the subcommand grammar
/// clap already defines for one-shot invocation.
fn parse_repl_line(line: &str) -> Result<Option<Commands>, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if matches!(trimmed, "quit" | "exit") {
        return Ok(None);
    }
    let mut argv = vec!["zoea-nova"];
    argv.extend(trimmed.split_whitespace());
    match Cli::try_parse_from(argv) {
        Ok(cli) => Ok(cli.command),
        Err(err) => Err(err.to_string()),
    }
}

/// The default interactive loop: read a line from stdin, dispatch it as a
/// [`Commands`] against `commander`, print the result, repeat until `quit`
/// or EOF.
pub async fn interactive_loop(commander: &Commander) {
    println!("zoea-nova interactive mode. Type `help` for commands, `quit` to exit.");
    let stdin = std::io::stdin();
    loop {
        print!("> ");
        if std::io::stdout().flush().is_err() {
            break;
        }
        let mut line = String::new();
        if stdin.read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if matches!(trimmed, "quit" | "exit") {
            break;
        }
        if trimmed == "help" {
            println!("{}", Commands::augment_subcommands(clap::Command::new("zoea-nova")).render_help());
            continue;
        }
        match parse_repl_line(trimmed) {
            Ok(None) => continue,
            Ok(Some(command)) => match run_command(commander, command).await {
                Ok(output) => println!("{}", output),
                Err(err) => eprintln!("error: {}", err),
            },
            Err(message) => eprintln!("{}", message),
        }
    }
}
