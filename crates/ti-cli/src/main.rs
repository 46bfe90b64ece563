//! CLI entry point for topic-inspector.
//!
//! This binary manages saved message filters and replays message files
//! through a consumption session, printing session events as JSON lines.
//!
//! # Usage
//!
//! ```bash
//! topic-inspect [OPTIONS] <COMMAND>
//!
//! # Save a filter
//! topic-inspect filters add --name errors --expr 'value.level == "error"'
//!
//! # Check a filter against a message file
//! topic-inspect filters test --filter 1 --messages orders.json
//!
//! # Read a topic to the end, at most 50 matches
//! topic-inspect tail --messages orders.json --topic orders --filter 1 --limit 50
//!
//! # Newest messages first, 20 at most
//! topic-inspect tail --messages orders.json --topic orders --backward --limit 20
//!
//! # Keep polling until Ctrl-C
//! topic-inspect tail --messages orders.json --topic orders --live --expr 'offset > 100'
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

use std::io::{BufReader, Write};
use std::num::NonZeroUsize;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, Subcommand};
use ti_core::{
    Config, ConsumptionMode, FieldConstraint, FilterDefinition, FilterId, HistoricalBound,
    Message, MessageField, PredicateSource, TopicRef,
};
use ti_filter::{CompiledFilter, JsonFilePersistence, SharedFilterStore};
use ti_session::{CursorGuard, MemorySource, SessionEvent, SessionOrchestrator};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// CLI ARGUMENT TYPES
// =============================================================================

/// Inspect topic messages through saved and ad-hoc filters.
#[derive(Parser)]
#[command(name = "topic-inspect", version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Command to execute.
    #[command(subcommand)]
    command: Commands,

    /// Path to a JSON configuration file.
    #[arg(short, long, global = true, env = "TI_CONFIG")]
    config: Option<Utf8PathBuf>,

    /// Path to the saved-filter file (overrides `store.path`).
    #[arg(long, global = true, env = "TI_STORE_PATH")]
    store: Option<Utf8PathBuf>,

    /// Enable verbose logging (debug level).
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
}

/// Available subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Manage saved filters.
    Filters {
        #[command(subcommand)]
        command: FilterCommands,
    },

    /// Replay a message file through a consumption session.
    Tail(TailArgs),
}

/// Saved-filter subcommands.
#[derive(Subcommand)]
enum FilterCommands {
    /// List saved filters.
    List {
        /// Print the filters as a JSON array.
        #[arg(long)]
        json: bool,
    },

    /// Save a new filter.
    Add(DefinitionArgs),

    /// Replace a saved filter.
    Edit {
        /// Id of the filter to replace.
        id: u64,

        #[command(flatten)]
        definition: DefinitionArgs,
    },

    /// Delete a saved filter.
    Remove {
        /// Id of the filter to delete.
        id: u64,
    },

    /// Print the messages of a file that a filter matches.
    Test {
        /// JSON array of messages.
        #[arg(short, long)]
        messages: Utf8PathBuf,

        #[command(flatten)]
        filter: FilterChoice,
    },
}

/// A filter definition given on the command line.
#[derive(Args)]
struct DefinitionArgs {
    /// Display name.
    #[arg(short, long, default_value = "")]
    name: String,

    /// Filter expression.
    #[arg(short, long, conflicts_with_all = ["equals", "contains"])]
    expr: Option<String>,

    /// Field equals text; FIELD is `key`, `value`, or `header.NAME`.
    #[arg(long, value_name = "FIELD=TEXT", value_parser = parse_field_text)]
    equals: Vec<(MessageField, String)>,

    /// Field contains text; FIELD is `key`, `value`, or `header.NAME`.
    #[arg(long, value_name = "FIELD=TEXT", value_parser = parse_field_text)]
    contains: Vec<(MessageField, String)>,
}

/// Which filter a command applies: a saved one, an expression, or none.
#[derive(Args)]
struct FilterChoice {
    /// Id of a saved filter.
    #[arg(short, long, conflicts_with = "expr")]
    filter: Option<u64>,

    /// Ad-hoc filter expression.
    #[arg(short, long)]
    expr: Option<String>,
}

/// Arguments of the `tail` command.
#[derive(Args)]
struct TailArgs {
    /// JSON array of messages to serve as the topic's log.
    #[arg(short, long)]
    messages: Utf8PathBuf,

    /// Topic name.
    #[arg(short, long)]
    topic: String,

    /// Partition to read; repeat for several. Reads all when omitted.
    #[arg(short, long = "partition")]
    partitions: Vec<i32>,

    #[command(flatten)]
    filter: FilterChoice,

    /// Keep polling for new messages until interrupted.
    #[arg(long, conflicts_with_all = ["until_offset", "until_timestamp", "limit", "no_limit"])]
    live: bool,

    /// Read newest first. `--until-offset` and `--until-timestamp` then name
    /// the newest message shown.
    #[arg(long, conflicts_with = "live")]
    backward: bool,

    /// Stop after this many matching messages.
    #[arg(long)]
    limit: Option<NonZeroUsize>,

    /// Read to the bound without a match limit.
    #[arg(long, conflicts_with = "limit")]
    no_limit: bool,

    /// Skip messages with a lower offset.
    #[arg(long)]
    from_offset: Option<i64>,

    /// Stop after this offset.
    #[arg(long, conflicts_with = "until_timestamp")]
    until_offset: Option<i64>,

    /// Stop after this timestamp (milliseconds since the Unix epoch).
    #[arg(long)]
    until_timestamp: Option<i64>,
}

impl DefinitionArgs {
    fn into_definition(self) -> color_eyre::Result<FilterDefinition> {
        let source = if let Some(code) = self.expr {
            PredicateSource::expression(code)
        } else {
            let constraints: Vec<FieldConstraint> = self
                .equals
                .into_iter()
                .map(|(field, text)| FieldConstraint::equals(field, text))
                .chain(
                    self.contains
                        .into_iter()
                        .map(|(field, text)| FieldConstraint::contains(field, text)),
                )
                .collect();
            if constraints.is_empty() {
                return Err(color_eyre::eyre::eyre!(
                    "Give --expr or at least one --equals/--contains constraint"
                ));
            }
            PredicateSource::structural(constraints)
        };
        Ok(FilterDefinition::new(self.name, source))
    }
}

impl TailArgs {
    fn mode(&self) -> ConsumptionMode {
        if self.live {
            return ConsumptionMode::Live;
        }
        let bound = if let Some(offset) = self.until_offset {
            HistoricalBound::Offset(offset)
        } else if let Some(timestamp) = self.until_timestamp {
            HistoricalBound::Timestamp(timestamp)
        } else {
            HistoricalBound::SourceEnd
        };
        if self.backward {
            ConsumptionMode::Backward(bound)
        } else {
            ConsumptionMode::Historical(bound)
        }
    }
}

impl FilterChoice {
    fn resolve(&self, store: &SharedFilterStore) -> color_eyre::Result<Option<FilterDefinition>> {
        if let Some(raw) = self.filter {
            let saved = store
                .get(FilterId::new(raw))
                .ok_or_else(|| color_eyre::eyre::eyre!("No saved filter with id {raw}"))?;
            return Ok(Some(saved.definition));
        }
        Ok(self
            .expr
            .as_ref()
            .map(|code| FilterDefinition::new("", PredicateSource::expression(code.as_str()))))
    }
}

/// Parses `FIELD=TEXT` where FIELD is `key`, `value`, or `header.NAME`.
fn parse_field_text(raw: &str) -> Result<(MessageField, String), String> {
    let (field, text) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected FIELD=TEXT, got `{raw}`"))?;
    let field = match field.trim() {
        "key" => MessageField::Key,
        "value" => MessageField::Value,
        other => match other.strip_prefix("header.") {
            Some(name) if !name.is_empty() => MessageField::Header(name.to_owned()),
            _ => return Err(format!("unknown field `{other}`")),
        },
    };
    Ok((field, text.to_owned()))
}

// =============================================================================
// INITIALIZATION FUNCTIONS
// =============================================================================

/// Initializes the tracing subscriber for logging.
///
/// Respects the `RUST_LOG` environment variable if set. Otherwise, uses
/// `debug` level if `--verbose` is set, or `info` level by default. Logs go
/// to stderr so stdout carries only command output.
fn init_tracing(verbose: bool, no_color: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose { "debug" } else { "info" };
        EnvFilter::new(format!("{level},mio=warn"))
    });

    // Check if colors should be disabled (flag or NO_COLOR env var)
    let use_ansi = !no_color && std::env::var("NO_COLOR").is_err();

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .with_ansi(use_ansi)
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .init();
}

/// Builds a [`Config`] from the configuration file and CLI overrides.
///
/// # Errors
///
/// Returns an error if the configuration file is missing or invalid.
fn build_config(cli: &Cli) -> color_eyre::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .map_err(|e| color_eyre::eyre::eyre!("Failed to load {}: {}", path, e))?,
        None => Config::default(),
    };
    if let Some(store) = &cli.store {
        config.store.path.clone_from(store);
    }
    Ok(config)
}

/// Opens the saved-filter store at the configured path.
fn open_store(config: &Config) -> color_eyre::Result<SharedFilterStore> {
    let persistence = JsonFilePersistence::new(config.store.path.clone());
    SharedFilterStore::open(persistence).map_err(|e| {
        color_eyre::eyre::eyre!("Failed to open filter store {}: {}", config.store.path, e)
    })
}

/// Reads a JSON array of messages.
fn load_messages(path: &Utf8Path) -> color_eyre::Result<Vec<Message>> {
    let file = std::fs::File::open(path)
        .map_err(|e| color_eyre::eyre::eyre!("Failed to open {}: {}", path, e))?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|e| color_eyre::eyre::eyre!("Failed to parse messages in {}: {}", path, e))
}

// =============================================================================
// COMMAND IMPLEMENTATIONS
// =============================================================================

/// Runs a `filters` subcommand.
///
/// # Errors
///
/// Returns an error if the store cannot be opened or the mutation fails.
fn run_filters(config: &Config, command: FilterCommands) -> color_eyre::Result<()> {
    let store = open_store(config)?;
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();

    match command {
        FilterCommands::List { json } => {
            let filters = store.list();
            if json {
                serde_json::to_writer_pretty(&mut handle, &filters)?;
                writeln!(handle)?;
            } else if filters.is_empty() {
                writeln!(handle, "No saved filters.")?;
            } else {
                for saved in &filters {
                    writeln!(
                        handle,
                        "{:>4}  {:<24}  {}",
                        saved.id,
                        saved.definition.display_name(),
                        saved.definition.source
                    )?;
                }
            }
        }
        FilterCommands::Add(args) => {
            let definition = args.into_definition()?;
            CompiledFilter::compile(&definition)?;
            let id = store.add(definition)?;
            info!(filter = %id, "Filter saved");
            writeln!(handle, "{id}")?;
        }
        FilterCommands::Edit { id, definition } => {
            let definition = definition.into_definition()?;
            CompiledFilter::compile(&definition)?;
            store.edit(FilterId::new(id), definition)?;
            info!(filter = id, "Filter updated");
        }
        FilterCommands::Remove { id } => {
            let removed = store.remove(FilterId::new(id))?;
            info!(filter = id, name = %removed.definition.display_name(), "Filter removed");
        }
        FilterCommands::Test { messages, filter } => {
            let definition = filter.resolve(&store)?;
            let compiled = CompiledFilter::compile_optional(definition.as_ref())?;
            let messages = load_messages(&messages)?;
            let total = messages.len();

            let batch = compiled.apply(messages, config.session.parallel_threshold);
            for message in &batch.messages {
                serde_json::to_writer(&mut handle, message)?;
                writeln!(handle)?;
            }
            info!(
                filter = %compiled.label(),
                matched = batch.messages.len(),
                total,
                errors = batch.evaluation_errors,
                "Filter tested"
            );
        }
    }

    Ok(())
}

/// Replays a message file through a consumption session.
///
/// Prints every admitted [`SessionEvent`] as one JSON line. Returns when a
/// historical read completes, the session fails, or on Ctrl-C / SIGTERM.
///
/// # Errors
///
/// Returns an error if the inputs cannot be loaded, the filter does not
/// compile, or the session fails.
async fn run_tail(mut config: Config, args: TailArgs) -> color_eyre::Result<()> {
    let store = open_store(&config)?;

    let mut messages = load_messages(&args.messages)?;
    if let Some(from) = args.from_offset {
        messages.retain(|message| message.offset >= from);
    }

    let source = Arc::new(MemorySource::new(config.session.batch_size));
    source.create_topic(&args.topic);
    source.append(&args.topic, messages);

    if let Some(limit) = args.limit {
        config.session.max_messages = Some(limit.get());
    } else if args.no_limit {
        config.session.max_messages = None;
    }

    let mode = args.mode();

    let (tx, mut rx) = mpsc::unbounded_channel::<SessionEvent>();
    let mut orchestrator = SessionOrchestrator::new(source, store, Arc::new(tx), config.session);
    if let Some(raw) = args.filter.filter {
        orchestrator.activate_saved(FilterId::new(raw))?;
    } else if let Some(code) = args.filter.expr {
        let definition = FilterDefinition::new("", PredicateSource::expression(code));
        orchestrator.activate_transient(definition)?;
    }

    let topic = TopicRef::new(args.topic).with_partitions(args.partitions);
    info!(topic = %topic, ?mode, "Starting session");
    orchestrator.enter_topic(topic, mode)?;

    let mut guard = CursorGuard::new();
    let signal = shutdown_signal();
    tokio::pin!(signal);

    let outcome = loop {
        tokio::select! {
            result = &mut signal => {
                result?;
                break Ok(());
            }
            event = rx.recv() => {
                let Some(event) = event else { break Ok(()) };
                if !guard.admit(&event) {
                    continue;
                }
                print_event(&event)?;
                match event {
                    SessionEvent::Done { .. } => break Ok(()),
                    SessionEvent::Failed { error, .. } => {
                        break Err(color_eyre::eyre::eyre!("Session failed: {}", error));
                    }
                    _ => {}
                }
            }
        }
    };

    if let Some(stats) = orchestrator.stats() {
        info!(
            consumed = stats.messages_consumed,
            emitted = stats.messages_emitted,
            filter_errors = stats.filter_apply_errors,
            "Session finished"
        );
    }
    if let Err(e) = orchestrator.shutdown().await {
        warn!(error = %e, "Session task did not shut down cleanly");
    }
    outcome
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() -> color_eyre::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received Ctrl-C, stopping session");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, stopping session");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl-C, stopping session");
    }

    Ok(())
}

// =============================================================================
// OUTPUT HELPERS
// =============================================================================

/// Writes one event as a JSON line to stdout.
fn print_event(event: &SessionEvent) -> color_eyre::Result<()> {
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    serde_json::to_writer(&mut handle, event)?;
    writeln!(handle)?;
    handle.flush()?;
    Ok(())
}

// =============================================================================
// MAIN ENTRY POINT
// =============================================================================

/// Application entry point.
#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    // 1. Install color-eyre FIRST (before any potential panics)
    color_eyre::install()?;

    // 2. Parse CLI arguments
    let cli = Cli::parse();

    // 3. Initialize tracing (handles --no-color for log output)
    init_tracing(cli.verbose, cli.no_color);

    // 4. Load configuration
    let config = build_config(&cli)?;

    // 5. Route to appropriate command
    match cli.command {
        Commands::Filters { command } => run_filters(&config, command),
        Commands::Tail(args) => run_tail(config, args).await,
    }
}
