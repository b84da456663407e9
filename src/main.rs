//! filekit - batch file toolbox.
//!
//! Usage:
//!   fk search [PATH] -n '*.log'        Find entries by name, size or date
//!   fk grep PATTERN [PATH...]          Search file contents
//!   fk quick QUERY [PATH]              Ranked name search
//!   fk index [PATH]                    Write a flat index file
//!   fk copy SRC... --to DIR            Copy into a directory
//!   fk move SRC... --to DIR            Move into a directory
//!   fk delete PATH...                  Delete files and directories
//!   fk rename PATH... --prefix new_    Rename by rule (--dry-run to preview)

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{ArgGroup, Args, Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Context, Result, bail};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use filekit::{
    AppConfig, BatchOperationRequest, CaseMode, ChannelEvent, ConflictStrategy, FileEntry,
    FileService, OperationKind, OperationResult, RankedEntry, RenameCandidate, RenameRule,
    SearchHits, SearchQuery, SearchReport,
};

#[derive(Parser)]
#[command(
    name = "filekit",
    version,
    about = "Batch file toolbox",
    long_about = "filekit searches, greps, copies, moves, deletes and renames files in \
                  cancellable batches.\n\nSet FILEKIT_LOG=debug for detailed logs."
)]
struct Cli {
    /// Configuration file (TOML); missing keys keep their defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Do not print progress to stderr
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Find files and directories by name, extension, size or age
    Search {
        /// Directory to search
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Name pattern: wildcard, '*.{a,b}', substring or regex with --regex
        #[arg(short, long)]
        name: Option<String>,

        #[command(flatten)]
        filters: Filters,

        /// Smallest file size (e.g., "10KB")
        #[arg(long)]
        min_size: Option<String>,

        /// Largest file size (e.g., "1GB")
        #[arg(long)]
        max_size: Option<String>,

        /// Also report matching directories
        #[arg(short = 'D', long)]
        dirs: bool,
    },

    /// Search file contents
    Grep {
        /// Text or regular expression to look for
        pattern: String,

        /// A directory to walk, or explicit files
        #[arg(default_value = ".")]
        paths: Vec<PathBuf>,

        #[command(flatten)]
        filters: Filters,

        /// Lines of context around each hit
        #[arg(short = 'C', long)]
        context: Option<usize>,
    },

    /// Ranked search by name and relative path
    Quick {
        query: String,

        #[arg(default_value = ".")]
        path: PathBuf,

        /// Number of results
        #[arg(short = 'n', long, default_value = "20")]
        top: usize,

        /// Rank entries from the index file in PATH instead of walking it
        #[arg(short, long)]
        index: bool,
    },

    /// Write a flat index file for fast quick searches
    Index {
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Glob patterns to leave out
        #[arg(short = 'x', long)]
        exclude: Vec<String>,
    },

    /// Copy files and directories into a directory
    Copy(TransferArgs),

    /// Move files and directories into a directory
    Move(TransferArgs),

    /// Delete files and directories
    Delete {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Rename entries by rule
    Rename(RenameArgs),
}

#[derive(Args)]
struct Filters {
    /// Only these extensions (repeatable)
    #[arg(short, long = "ext")]
    extensions: Vec<String>,

    /// Glob patterns to skip (repeatable)
    #[arg(short = 'x', long)]
    exclude: Vec<String>,

    /// Treat patterns as regular expressions
    #[arg(short, long)]
    regex: bool,

    /// Match case exactly
    #[arg(short = 's', long)]
    case_sensitive: bool,

    /// Deepest directory level to enter
    #[arg(short, long)]
    depth: Option<usize>,

    /// Stop after this many results
    #[arg(short, long)]
    limit: Option<usize>,
}

#[derive(Args)]
struct TransferArgs {
    #[arg(required = true)]
    sources: Vec<PathBuf>,

    /// Destination directory
    #[arg(short, long)]
    to: PathBuf,

    /// What to do when a target exists: skip, overwrite, rename or ask
    #[arg(short = 'o', long, default_value = "skip")]
    on_conflict: ConflictStrategy,

    /// Recreate the sources' directory layout under the destination
    #[arg(short, long)]
    preserve_structure: bool,

    /// Items processed at once
    #[arg(short, long)]
    jobs: Option<usize>,
}

#[derive(Args)]
#[command(group(
    ArgGroup::new("rule")
        .required(true)
        .args(["replace", "regex", "prefix", "suffix", "template", "sequence", "case"])
))]
struct RenameArgs {
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Replace literal text (use with --with)
    #[arg(long, requires = "with")]
    replace: Option<String>,

    /// Replace a regular expression match (use with --with; $1 refers to groups)
    #[arg(long, requires = "with")]
    regex: Option<String>,

    /// Replacement for --replace or --regex
    #[arg(long)]
    with: Option<String>,

    #[arg(long)]
    prefix: Option<String>,

    /// Suffix, inserted before the extension
    #[arg(long)]
    suffix: Option<String>,

    /// Template with {name}, {ext}, {date}, {time} and {parent}
    #[arg(long)]
    template: Option<String>,

    /// Numbered names: BASE followed by a counter
    #[arg(long)]
    sequence: Option<String>,

    /// First counter value for --sequence
    #[arg(long, default_value = "1")]
    start: u64,

    /// Counter width for --sequence
    #[arg(long, default_value = "0")]
    padding: usize,

    /// Change letter case: upper, lower or title
    #[arg(long)]
    case: Option<CaseMode>,

    /// Match --replace and --regex regardless of case
    #[arg(short, long)]
    ignore_case: bool,

    /// Show the new names without renaming
    #[arg(short = 'n', long)]
    dry_run: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_logging();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AppConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => AppConfig::default(),
    };
    config.validate().context("Invalid configuration")?;

    let service = Arc::new(FileService::new(Arc::new(config)));
    let progress = (!cli.quiet).then(|| spawn_progress(&service));

    let outcome = run(&service, cli.command, cli.format).await;

    service.cleanup().await;
    if let Some(handle) = progress {
        handle.abort();
        eprint!("\r\x1b[2K");
    }
    outcome
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("FILEKIT_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Print a one-line progress indicator for every event.
fn spawn_progress(service: &FileService) -> tokio::task::JoinHandle<()> {
    let mut events = service.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ChannelEvent { channel, event }) => {
                    let current = event
                        .details
                        .get("currentFile")
                        .or_else(|| event.details.get("currentPath"))
                        .and_then(|v| v.as_str())
                        .map(|s| truncate(s, 50))
                        .unwrap_or_default();
                    eprint!(
                        "\r\x1b[2K[{channel}] {:>3}% {} {current}",
                        event.percentage,
                        event.status.as_deref().unwrap_or("")
                    );
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    })
}

async fn run(service: &FileService, command: Command, format: OutputFormat) -> Result<()> {
    match command {
        Command::Search {
            path,
            name,
            filters,
            min_size,
            max_size,
            dirs,
        } => {
            let mut builder = SearchQuery::builder(path);
            apply_filters(&mut builder, filters);
            builder.include_directories(dirs);
            if let Some(name) = name {
                builder.name_pattern(name);
            }
            if let Some(size) = min_size {
                builder.min_size(parse_size(&size)?);
            }
            if let Some(size) = max_size {
                builder.max_size(parse_size(&size)?);
            }
            let query = builder.build()?;
            let report = service.search(&query).await.context("Search failed")?;
            print_report(&report, format)
        }
        Command::Grep {
            pattern,
            paths,
            filters,
            context,
        } => {
            let report = if let [dir] = paths.as_slice() {
                if dir.is_dir() {
                    let mut builder = SearchQuery::builder(dir);
                    apply_filters(&mut builder, filters);
                    builder.content_pattern(pattern);
                    if let Some(lines) = context {
                        builder.context_lines(lines);
                    }
                    service.search(&builder.build()?).await
                } else {
                    service
                        .grep_files(&paths, &pattern, filters.case_sensitive, filters.regex)
                        .await
                }
            } else {
                service
                    .grep_files(&paths, &pattern, filters.case_sensitive, filters.regex)
                    .await
            };
            print_report(&report.context("Grep failed")?, format)
        }
        Command::Quick {
            query,
            path,
            top,
            index,
        } => {
            let ranked = if index {
                let index_path = path.join(filekit::INDEX_FILE_NAME);
                service.search_with_index(&index_path, &query, top).await
            } else {
                service.quick_search(&path, &query, top).await
            };
            print_ranked(&ranked.context("Quick search failed")?, format)
        }
        Command::Index { path, exclude } => {
            let (stats, index_path) = service
                .build_index(&path, &exclude)
                .await
                .context("Indexing failed")?;
            match format {
                OutputFormat::Text => println!(
                    "Indexed {} files and {} directories into {} ({})",
                    stats.file_count,
                    stats.directory_count,
                    index_path.display(),
                    format_size(stats.index_size)
                ),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
            }
            Ok(())
        }
        Command::Copy(args) => transfer(service, OperationKind::Copy, args, format).await,
        Command::Move(args) => transfer(service, OperationKind::Move, args, format).await,
        Command::Delete { paths } => {
            let request = BatchOperationRequest::builder(OperationKind::Delete, entries(&paths))
                .build()?;
            let result = service.batch_operate(&request).await?;
            print_result(&result, format)
        }
        Command::Rename(args) => rename(service, args, format).await,
    }
}

fn apply_filters(builder: &mut filekit::SearchQueryBuilder, filters: Filters) {
    builder
        .extensions(filters.extensions)
        .exclude_patterns(filters.exclude)
        .use_regex(filters.regex)
        .case_sensitive(filters.case_sensitive);
    if let Some(depth) = filters.depth {
        builder.max_depth(depth);
    }
    if let Some(limit) = filters.limit {
        builder.max_results(limit);
    }
}

fn entries(paths: &[PathBuf]) -> Vec<FileEntry> {
    paths
        .iter()
        .map(|p| FileEntry::new(p, p.is_dir()))
        .collect()
}

async fn transfer(
    service: &FileService,
    operation: OperationKind,
    args: TransferArgs,
    format: OutputFormat,
) -> Result<()> {
    let mut builder = BatchOperationRequest::builder(operation, entries(&args.sources));
    builder
        .target_path(args.to)
        .conflict_strategy(args.on_conflict)
        .preserve_structure(args.preserve_structure);
    if let Some(jobs) = args.jobs {
        builder.max_parallel(jobs);
    }
    let result = service.batch_operate(&builder.build()?).await?;
    print_result(&result, format)
}

fn rename_rule(args: &RenameArgs) -> Result<RenameRule> {
    let with = args.with.clone().unwrap_or_default();
    let rule = if let Some(search) = &args.replace {
        RenameRule::Replace {
            search: search.clone(),
            replace: with,
            use_regex: false,
            case_insensitive: args.ignore_case,
        }
    } else if let Some(pattern) = &args.regex {
        RenameRule::Regex {
            pattern: pattern.clone(),
            replacement: with,
            global: true,
            case_insensitive: args.ignore_case,
        }
    } else if let Some(prefix) = &args.prefix {
        RenameRule::Prefix {
            prefix: prefix.clone(),
        }
    } else if let Some(suffix) = &args.suffix {
        RenameRule::Suffix {
            suffix: suffix.clone(),
            before_extension: true,
        }
    } else if let Some(template) = &args.template {
        RenameRule::Template {
            template: template.clone(),
        }
    } else if let Some(base_name) = &args.sequence {
        RenameRule::Sequence {
            base_name: base_name.clone(),
            start: args.start,
            padding: args.padding,
            keep_extension: true,
        }
    } else if let Some(case) = args.case {
        RenameRule::Case {
            case,
            include_extension: false,
        }
    } else {
        bail!("No rename rule given");
    };
    Ok(rule)
}

async fn rename(service: &FileService, args: RenameArgs, format: OutputFormat) -> Result<()> {
    let rule = rename_rule(&args)?;
    let candidates: Vec<RenameCandidate> = args
        .paths
        .iter()
        .map(|p| RenameCandidate::new(p, p.is_dir()))
        .collect();

    if !args.dry_run {
        let result = service.rename_batch(&candidates, &rule).await?;
        return print_result(&result, format);
    }

    let preview = service.preview_rename(candidates, rule).await?;
    match format {
        OutputFormat::Text => {
            for entry in &preview {
                match &entry.error_message {
                    Some(message) => println!("  {} -> {}  ({message})", entry.name, entry.new_name),
                    None => println!("  {} -> {}", entry.name, entry.new_name),
                }
            }
            let problems = preview.iter().filter(|e| e.has_error).count();
            if problems > 0 {
                println!();
                println!("{problems} name(s) need attention");
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&preview)?),
    }
    Ok(())
}

fn print_report(report: &SearchReport, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    match &report.hits {
        SearchHits::Files(files) => {
            for entry in files {
                let marker = if entry.is_directory { "/" } else { "" };
                println!("{}{marker}", entry.full_path.display());
            }
        }
        SearchHits::Matches(matches) => {
            for found in matches {
                for line in &found.line_matches {
                    match &line.context {
                        Some(context) => {
                            println!("{}:{}:", found.file_path.display(), line.line);
                            for text in context {
                                println!("    {text}");
                            }
                        }
                        None => println!(
                            "{}:{}: {}",
                            found.file_path.display(),
                            line.line,
                            line.content.trim_end()
                        ),
                    }
                }
            }
        }
    }

    eprintln!();
    eprintln!(
        "{} result(s), {} entries visited{}{}",
        report.hits.len(),
        report.visited,
        if report.skipped_files > 0 {
            format!(", {} file(s) skipped", report.skipped_files)
        } else {
            String::new()
        },
        if report.cancelled { ", cancelled" } else { "" }
    );
    Ok(())
}

fn print_ranked(ranked: &[RankedEntry], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            for entry in ranked {
                let shown = entry.relative_path.as_deref().unwrap_or(&entry.path);
                println!("{:>4}  {}", entry.score, display_path(shown, entry.is_directory));
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(ranked)?),
    }
    Ok(())
}

fn print_result(result: &OperationResult, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            println!("{}", result.summary());
            for error in &result.errors {
                println!("  {error}");
            }
            if !result.conflicts.is_empty() {
                println!();
                println!("Undecided conflicts (re-run with --on-conflict):");
                for conflict in &result.conflicts {
                    println!("  {}", conflict.destination.display());
                }
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(result)?),
    }

    if result.failed > 0 {
        bail!("{} of {} item(s) failed", result.failed, result.processed());
    }
    Ok(())
}

fn display_path(path: &Path, is_directory: bool) -> String {
    if is_directory {
        format!("{}/", path.display())
    } else {
        path.display().to_string()
    }
}

/// Format size in human-readable form.
fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

/// Truncate a string to at most `max_len` characters, keeping the end.
fn truncate(s: &str, max_len: usize) -> String {
    let count = s.chars().count();
    if count <= max_len {
        s.to_string()
    } else {
        let tail: String = s.chars().skip(count - max_len + 1).collect();
        format!("…{tail}")
    }
}

/// Parse a size string (e.g., "1KB", "10MB", "1GB").
fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim().to_uppercase();
    let digits = s.trim_end_matches(|c: char| !c.is_ascii_digit() && c != '.');
    let unit = &s[digits.len()..];

    let multiplier: u64 = match unit {
        "" | "B" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        _ => bail!("Unknown size unit '{unit}'"),
    };
    let num: f64 = digits
        .parse()
        .with_context(|| format!("Invalid size '{s}'"))?;
    Ok((num * multiplier as f64) as u64)
}
