//! rekb CLI
//!
//! Command-line front end for the reverse-engineering knowledge base:
//! - `promote`: drain the candidate queues into the authoritative maps (evidence-gated)
//! - `validate`: audit the maps (and optionally the protocol message map/schema)

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use rekb_kb::{
    plan_promotion, validate_maps, AuditReport, AuditRequest, EntryType, KbLayout,
    PromotionConfig, PromotionSummary, ANALYST_ENV, DEFAULT_ANALYST, DEFAULT_DATA_CANDIDATES,
    DEFAULT_DATA_MAP, DEFAULT_NAME_CANDIDATES, DEFAULT_NAME_MAP, DEFAULT_REVIEW_QUEUE,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rekb")]
#[command(
    author,
    version,
    about = "rekb: evidence-gated knowledge base for reverse-engineering maps"
)]
struct Cli {
    /// Log filter (`RUST_LOG` syntax); `RUST_LOG` wins when set.
    #[arg(long, global = true, default_value = "warn")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Promote queued candidates into the authoritative maps.
    ///
    /// High-confidence candidates with resolvable evidence become `approved` map
    /// entries; everything else is appended to the review queue. Both candidate
    /// queues are emptied afterwards.
    Promote(PromoteArgs),

    /// Audit the authoritative maps without modifying anything.
    ///
    /// Exits with status 1 when any finding is reported.
    Validate(ValidateArgs),
}

#[derive(Args)]
struct MapArgs {
    /// Repository root; relative paths and evidence sources resolve against it.
    #[arg(long, default_value = ".")]
    repo_root: PathBuf,
    /// Authoritative name map
    #[arg(long, default_value = DEFAULT_NAME_MAP)]
    name_map: PathBuf,
    /// Authoritative data map
    #[arg(long, default_value = DEFAULT_DATA_MAP)]
    data_map: PathBuf,
}

#[derive(Args)]
struct PromoteArgs {
    #[command(flatten)]
    maps: MapArgs,
    /// Name-candidate queue (JSONL)
    #[arg(long, default_value = DEFAULT_NAME_CANDIDATES)]
    name_candidates: PathBuf,
    /// Data-candidate queue (JSONL)
    #[arg(long, default_value = DEFAULT_DATA_CANDIDATES)]
    data_candidates: PathBuf,
    /// Review queue (JSONL, append-only)
    #[arg(long, default_value = DEFAULT_REVIEW_QUEUE)]
    review_queue: PathBuf,
    /// Analyst recorded in provenance when a candidate does not name one
    #[arg(long, env = ANALYST_ENV, default_value = DEFAULT_ANALYST)]
    analyst: String,
}

#[derive(Args)]
struct ValidateArgs {
    #[command(flatten)]
    maps: MapArgs,
    /// Protocol message map (CSV)
    #[arg(long)]
    message_map: Option<PathBuf>,
    /// Derived protocol message schema (JSON)
    #[arg(long)]
    message_schema: Option<PathBuf>,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Promote(args) => cmd_promote(args),
        Commands::Validate(args) => cmd_validate(args),
    }
}

fn layout_for(maps: &MapArgs) -> KbLayout {
    let mut layout = KbLayout::under(&maps.repo_root);
    layout.name_map = layout.resolve(&maps.name_map);
    layout.data_map = layout.resolve(&maps.data_map);
    layout
}

fn cmd_promote(args: PromoteArgs) -> Result<ExitCode> {
    let mut layout = layout_for(&args.maps);
    layout.name_candidates = layout.resolve(&args.name_candidates);
    layout.data_candidates = layout.resolve(&args.data_candidates);
    layout.review_queue = layout.resolve(&args.review_queue);

    tracing::debug!(?layout, analyst = %args.analyst, "promote");
    let config = PromotionConfig::default().with_analyst(args.analyst);
    let plan = plan_promotion(&layout, &config).with_context(|| {
        format!(
            "promotion failed under {} (no files were modified)",
            layout.repo_root.display()
        )
    })?;
    let summary = plan.commit().with_context(|| {
        format!(
            "failed to write promotion results under {} (files may be partially updated)",
            layout.repo_root.display()
        )
    })?;

    print_summary(&summary);
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(ExitCode::SUCCESS)
}

fn print_summary(summary: &PromotionSummary) {
    for entry_type in EntryType::ALL {
        let result = summary.for_type(entry_type);
        eprintln!(
            "{} {entry_type}: promoted={} review_required={} rejected={}",
            "ok".green().bold(),
            result.promoted,
            result.review_required,
            result.rejected
        );
    }
    let deferred: usize = EntryType::ALL
        .iter()
        .map(|t| summary.for_type(*t).total() - summary.for_type(*t).promoted)
        .sum();
    if deferred > 0 {
        eprintln!(
            "{} {deferred} candidate(s) appended to the review queue",
            "info:".yellow().bold()
        );
    }
}

fn cmd_validate(args: ValidateArgs) -> Result<ExitCode> {
    let layout = layout_for(&args.maps);
    let mut request = AuditRequest::from_layout(&layout);
    if let Some(path) = &args.message_map {
        request = request.with_message_map(layout.resolve(path));
    }
    if let Some(path) = &args.message_schema {
        request = request.with_message_schema(layout.resolve(path));
    }

    tracing::debug!(?request, "validate");
    let report = validate_maps(&request)
        .with_context(|| format!("failed to audit maps under {}", layout.repo_root.display()))?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.has_errors() {
        print_findings(&report);
        return Ok(ExitCode::FAILURE);
    }
    eprintln!("{} no findings", "ok".green().bold());
    Ok(ExitCode::SUCCESS)
}

fn print_findings(report: &AuditReport) {
    for (label, errors) in [
        ("name_map", &report.name_map),
        ("data_map", &report.data_map),
        ("message_map", &report.message_map),
        ("message_schema", &report.message_schema),
    ] {
        if !errors.is_empty() {
            eprintln!("{} {label}: {} finding(s)", "fail".red().bold(), errors.len());
        }
    }
}
