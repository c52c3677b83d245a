//! CLI entry point for `msgstore`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{CommandFactory, Parser, Subcommand};
use humansize::{format_size, BINARY};
use indicatif::{ProgressBar, ProgressStyle};

use msgstore::account::{Account, AccountStats};
use msgstore::config::{self, Config};
use msgstore::model::field::{CacheField, IndexField};
use msgstore::parser::message::Message;
use msgstore::store::Layout;

#[derive(Parser)]
#[command(name = "msgstore", version, about = "Inspect and maintain a message store")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Store directory (defaults to the configured data directory)
    #[arg(short, long, global = true, env = "MSGSTORE_DIR", value_name = "DIR")]
    store: Option<PathBuf>,

    /// Body layout for a new store
    #[arg(long, global = true, value_enum)]
    layout: Option<Layout>,

    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an empty store
    Init,
    /// Store message files (.eml)
    Add {
        files: Vec<PathBuf>,
        /// Label recorded in the index record
        #[arg(short, long, default_value = "")]
        label: String,
        /// Keep only the index record, not the body
        #[arg(long)]
        index_only: bool,
    },
    /// List stored messages
    List {
        #[arg(long)]
        json: bool,
    },
    /// Print one message
    Show {
        id: u64,
        /// Print the raw bytes instead of a rendered view
        #[arg(long)]
        raw: bool,
    },
    /// Change the label of a message
    Label { id: u64, label: String },
    /// Delete messages
    Delete { ids: Vec<u64> },
    /// Drop message bodies, keeping their index records
    Demote { ids: Vec<u64> },
    /// Rewrite storage without gaps
    Compact,
    /// Rebuild all index records from the stored messages
    Check {
        /// Drop messages that cannot be re-indexed instead of aborting
        #[arg(long)]
        ignore_errors: bool,
    },
    /// Recover message files no longer referenced by the folder
    Salvage,
    /// Return unused trailing storage to the filesystem
    FreeUnused,
    /// Show storage statistics
    Stats {
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration
    Config {
        /// Write it to the config file
        #[arg(long)]
        save: bool,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate a man page
    Manpage,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = config::load_config();

    // Configure logging: stderr + optional log file
    let log_level = match cli.verbose {
        0 => config.general.log_level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    setup_logging(log_level, &config);

    let dir = cli
        .store
        .clone()
        .unwrap_or_else(|| config::data_dir(&config));
    let layout = cli.layout.unwrap_or(config.storage.layout);

    match cli.command {
        Commands::Completions { shell } => cmd_completions(shell),
        Commands::Manpage => cmd_manpage(),
        Commands::Config { save } => cmd_config(&config, save),
        Commands::Init => cmd_init(&dir, layout, &config),
        command => {
            let mut account = open_account(&dir, layout, &config)?;
            match command {
                Commands::Add {
                    files,
                    label,
                    index_only,
                } => cmd_add(&mut account, &files, &label, index_only),
                Commands::List { json } => cmd_list(&mut account, json),
                Commands::Show { id, raw } => cmd_show(&account, id, raw),
                Commands::Label { id, label } => {
                    account.set_label(id, &label)?;
                    account.flush()?;
                    Ok(())
                }
                Commands::Delete { ids } => {
                    for id in ids {
                        account.delete_message(id)?;
                    }
                    account.flush()?;
                    Ok(())
                }
                Commands::Demote { ids } => {
                    for id in ids {
                        account.demote_message(id)?;
                    }
                    account.flush()?;
                    Ok(())
                }
                Commands::Compact => cmd_compact(&mut account),
                Commands::Check { ignore_errors } => cmd_check(&mut account, ignore_errors),
                Commands::Salvage => cmd_salvage(&mut account),
                Commands::FreeUnused => {
                    account.free_unused()?;
                    account.flush()?;
                    Ok(())
                }
                Commands::Stats { json } => cmd_stats(&account, json),
                Commands::Init
                | Commands::Config { .. }
                | Commands::Completions { .. }
                | Commands::Manpage => Ok(()),
            }
        }
    }
}

/// Set up tracing with stderr output and optional file logging.
fn setup_logging(level: &str, config: &Config) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    // Try to set up file logging
    let log_dir = config::cache_dir(config);
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = tracing_appender::rolling::never(&log_dir, "msgstore.log");
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
    }
}

fn open_account(dir: &Path, layout: Layout, config: &Config) -> anyhow::Result<Account> {
    if !dir.exists() {
        anyhow::bail!(
            "No store at {} (run `msgstore init` first)",
            dir.display()
        );
    }
    Ok(Account::open(dir, layout, config)?)
}

fn progress_bar(len: usize, verb: &str) -> anyhow::Result<ProgressBar> {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "{{spinner:.green}} {verb} [{{bar:40.cyan/blue}}] {{pos}}/{{len}}"
            ))?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

/// Generate shell completions and print to stdout.
fn cmd_completions(shell: clap_complete::Shell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "msgstore", &mut std::io::stdout());
    Ok(())
}

/// Generate a man page and print to stdout.
fn cmd_manpage() -> anyhow::Result<()> {
    let cmd = Cli::command();
    let man = clap_mangen::Man::new(cmd);
    let mut buf = Vec::new();
    man.render(&mut buf)?;
    std::io::stdout().write_all(&buf)?;
    Ok(())
}

fn cmd_config(config: &Config, save: bool) -> anyhow::Result<()> {
    if save {
        config::save_config(config)?;
    }
    if let Some(path) = config::config_file_path() {
        println!("# {}", path.display());
    }
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

fn cmd_init(dir: &Path, layout: Layout, config: &Config) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)?;
    let mut account = Account::open(dir, layout, config)?;
    account.flush()?;
    println!(
        "  Initialized {} store at {}",
        account.layout(),
        dir.display()
    );
    Ok(())
}

fn cmd_add(
    account: &mut Account,
    files: &[PathBuf],
    label: &str,
    index_only: bool,
) -> anyhow::Result<()> {
    let pb = progress_bar(files.len(), "Storing")?;
    let start = Instant::now();
    let mut bytes = 0u64;
    for path in files {
        let message = Message::from_file(path)?;
        bytes += message.len() as u64;
        let id = account.store_message(&message, label, index_only)?;
        pb.println(format!("  #{id:<6} {}", path.display()));
        pb.inc(1);
    }
    pb.finish_and_clear();
    account.flush()?;
    println!(
        "  Stored {} message(s), {} in {:.2?}",
        files.len(),
        format_size(bytes, BINARY),
        start.elapsed()
    );
    Ok(())
}

fn cmd_list(account: &mut Account, json: bool) -> anyhow::Result<()> {
    let handles = account.messages().to_vec();
    let mut rows = Vec::with_capacity(handles.len());
    for handle in &handles {
        rows.push(serde_json::json!({
            "id": handle.id,
            "flags": handle.flags,
            "size": handle.location.length,
            "has_body": handle.location.has_body(),
            "from": account.get_data(handle.id, CacheField::From)?,
            "subject": account.get_data(handle.id, CacheField::Subject)?,
            "label": account.get_index(handle.id, IndexField::Label)?,
        }));
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!(
        "  {:<6} {:>10}  {:<24} {:<12} Subject",
        "ID", "Size", "From", "Label"
    );
    for (handle, row) in handles.iter().zip(&rows) {
        let size = if row["has_body"].as_bool().unwrap_or(false) {
            format_size(row["size"].as_u64().unwrap_or(0), BINARY)
        } else {
            "-".to_string()
        };
        println!(
            "  {:<6} {:>10}  {:<24} {:<12} {}",
            handle.id,
            size,
            truncate(row["from"].as_str().unwrap_or_default(), 24),
            truncate(row["label"].as_str().unwrap_or_default(), 12),
            row["subject"].as_str().unwrap_or_default()
        );
    }
    Ok(())
}

fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(width.saturating_sub(1)).collect();
        out.push('…');
        out
    }
}

fn cmd_show(account: &Account, id: u64, raw: bool) -> anyhow::Result<()> {
    let message = account.load_message(id)?;
    if raw {
        std::io::stdout().write_all(message.as_bytes())?;
        return Ok(());
    }
    println!("  {:<10} {}", "From:", account.get_data(id, CacheField::From)?);
    println!("  {:<10} {}", "To:", account.get_data(id, CacheField::To)?);
    println!(
        "  {:<10} {}",
        "Subject:",
        account.get_data(id, CacheField::Subject)?
    );
    println!();
    match message.body_text() {
        Some(text) => println!("{text}"),
        None => println!("{}", String::from_utf8_lossy(message.body())),
    }
    Ok(())
}

fn cmd_compact(account: &mut Account) -> anyhow::Result<()> {
    let before = account.stats()?;
    let pb = progress_bar(account.messages().len(), "Compacting")?;
    let report = |done: usize, total: usize| {
        pb.set_length(total as u64);
        pb.set_position(done as u64);
        true
    };
    account.compact(Some(&report))?;
    pb.finish_and_clear();
    let after = account.stats()?;
    println!(
        "  Compacted {} message(s): {} → {}",
        after.messages,
        format_size(before.store.body_bytes + before.store.index_bytes, BINARY),
        format_size(after.store.body_bytes + after.store.index_bytes, BINARY)
    );
    Ok(())
}

fn cmd_check(account: &mut Account, ignore_errors: bool) -> anyhow::Result<()> {
    let pb = progress_bar(account.messages().len(), "Checking")?;
    let report = |done: usize, total: usize| {
        pb.set_length(total as u64);
        pb.set_position(done as u64);
        true
    };
    let summary = account.check(ignore_errors, Some(&report))?;
    pb.finish_and_clear();
    println!("  Rebuilt {} index record(s)", summary.rebuilt);
    if !summary.removed.is_empty() {
        println!(
            "  Removed {} unreadable message(s): {:?}",
            summary.removed.len(),
            summary.removed
        );
    }
    Ok(())
}

fn cmd_salvage(account: &mut Account) -> anyhow::Result<()> {
    let pb = progress_bar(0, "Salvaging")?;
    let report = |done: usize, total: usize| {
        pb.set_length(total as u64);
        pb.set_position(done as u64);
        true
    };
    let ids = account.salvage(Some(&report))?;
    pb.finish_and_clear();
    println!("  Recovered {} message(s)", ids.len());
    Ok(())
}

fn cmd_stats(account: &Account, json: bool) -> anyhow::Result<()> {
    let stats = account.stats()?;
    if json {
        let value = serde_json::json!({
            "store": account.dir().to_string_lossy(),
            "stats": stats,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        print_stats_table(account.dir(), &stats);
    }
    Ok(())
}

fn print_stats_table(dir: &Path, stats: &AccountStats) {
    println!();
    println!("  {:<20} {}", "Store:", dir.display());
    println!("  {:<20} {}", "Layout:", stats.store.layout);
    println!("  {:<20} {}", "Messages:", stats.messages);
    println!("  {:<20} {}", "Index only:", stats.index_only);
    if let Some(files) = stats.store.message_files {
        println!("  {:<20} {}", "Message files:", files);
    }
    println!(
        "  {:<20} {}",
        "Body storage:",
        format_size(stats.store.body_bytes, BINARY)
    );
    println!(
        "  {:<20} {}",
        "Index storage:",
        format_size(stats.store.index_bytes, BINARY)
    );
    println!();
}
