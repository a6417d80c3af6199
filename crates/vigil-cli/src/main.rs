use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate, TimeZone};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use vigil_core::{CancellationToken, Label, NoLabels, ScanEvent, SubjectProfile, ThumbnailEmbedder};
use vigil_engine::{spawn_engine, Config, EngineHandle, HistoryWrite};
use vigil_ledger::HistoryRecord;

#[derive(Parser)]
#[command(name = "vigil", about = "Vigil identity matching and image analysis CLI")]
struct Cli {
    /// Path to a TOML config file (overrides VIGIL_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Identify the subject in an image against the enrolled gallery
    Identify {
        image: PathBuf,
        /// Print every scored and skipped candidate
        #[arg(short, long)]
        verbose: bool,
    },
    /// Analyze brightness, colors, category and quality of an image
    Analyze {
        image: PathBuf,
        /// Classifier label as TEXT=CONFIDENCE (repeatable)
        #[arg(short, long = "label", value_parser = parse_label)]
        labels: Vec<Label>,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Enroll a reference image with its subject profile
    Enroll {
        image: PathBuf,
        /// Gallery base name (file name without extension)
        #[arg(short, long)]
        base: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        department: Option<String>,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Manage enrolled subjects
    #[command(subcommand)]
    Gallery(GalleryCommand),
    /// Inspect and manage identification history
    #[command(subcommand)]
    History(HistoryCommand),
    /// Print the effective configuration
    Config,
}

#[derive(Subcommand)]
enum GalleryCommand {
    /// List enrolled subjects
    List,
    /// Remove a subject's image and profile
    Remove { base: String },
}

#[derive(Subcommand)]
enum HistoryCommand {
    /// List records, newest first
    List {
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Show one record in full
    Show { id: String },
    /// Search by name, base name, subject id or department
    Search { query: String },
    /// Records between two dates (YYYY-MM-DD or epoch millis, inclusive)
    Range { from: String, to: String },
    /// Records with similarity at or above a floor (0.0 - 1.0)
    Above { min: f64 },
    /// Delete one record
    Delete { id: String },
    /// Delete all records
    Clear,
    /// Aggregate statistics
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Identify { image, verbose } => identify(&config, image, verbose).await?,
        Commands::Analyze { image, labels, json } => {
            let engine = start_engine(&config)?;
            let labels = (!labels.is_empty()).then_some(labels);
            let result = engine
                .analyze(image, labels)
                .await
                .map_err(|e| anyhow::anyhow!(e.user_message()))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print!("{}", result.report());
            }
        }
        Commands::Enroll {
            image,
            base,
            name,
            id,
            department,
            email,
            phone,
            notes,
        } => {
            let profile = SubjectProfile {
                name,
                id,
                department,
                email,
                phone,
                notes,
                ..SubjectProfile::default()
            };
            let engine = start_engine(&config)?;
            let stored = engine
                .enroll(image, base.clone(), profile)
                .await
                .map_err(|e| anyhow::anyhow!(e.user_message()))?;
            println!("Enrolled {base} -> {}", stored.display());
        }
        Commands::Gallery(cmd) => gallery(&config, cmd)?,
        Commands::History(cmd) => history(&config, cmd)?,
        Commands::Config => print!("{}", toml::to_string_pretty(&config)?),
    }

    Ok(())
}

fn start_engine(config: &Config) -> Result<EngineHandle> {
    spawn_engine(config, Arc::new(ThumbnailEmbedder), Arc::new(NoLabels))
        .context("starting engine")
}

async fn identify(config: &Config, image: PathBuf, verbose: bool) -> Result<()> {
    let engine = start_engine(config)?;
    let cancel = CancellationToken::new();

    // Ctrl-C stops the scan between candidates.
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received; cancelling scan");
                cancel.cancel();
            }
        })
    };

    let (progress, printer) = if verbose {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let printer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    ScanEvent::Scored { id, similarity, .. } => println!("  {id:<24} {similarity:.4}"),
                    ScanEvent::Skipped { id, reason, .. } => println!("  {id:<24} skipped ({reason})"),
                }
            }
        });
        (Some(tx), Some(printer))
    } else {
        (None, None)
    };

    let outcome = engine.identify_with_progress(image, cancel, progress).await;
    watcher.abort();
    if let Some(printer) = printer {
        // The engine drops its sender once the scan ends, which ends the printer.
        let _ = printer.await;
    }
    let outcome = outcome.map_err(|e| anyhow::anyhow!(e.user_message()))?;

    println!("{}", outcome.outcome().message());
    if let Some(name) = outcome.subject_name() {
        let label = if outcome.result.matched { "Subject" } else { "Closest" };
        println!("{label}: {name}");
        println!("Similarity: {:.1}%", outcome.result.clamped_similarity() * 100.0);
    }
    if outcome.result.matched {
        if let Some(profile) = &outcome.profile {
            for (key, value) in profile.fields() {
                println!("  {}: {value}", humanize_key(&key));
            }
        }
    }
    match &outcome.history {
        HistoryWrite::Saved => {
            if let Some(record) = &outcome.record {
                println!("Recorded as {}", record.id);
            }
        }
        HistoryWrite::Skipped => {}
        HistoryWrite::Failed(reason) => eprintln!("warning: attempt was not recorded: {reason}"),
    }
    Ok(())
}

fn gallery(config: &Config, cmd: GalleryCommand) -> Result<()> {
    let gallery = config.gallery();
    match cmd {
        GalleryCommand::List => {
            let subjects = gallery.subjects()?;
            if subjects.is_empty() {
                println!("No subjects enrolled");
            }
            for subject in subjects {
                let name = subject
                    .profile
                    .as_ref()
                    .map(|p| p.display_name(&subject.base_name).to_string())
                    .unwrap_or_else(|| subject.base_name.clone());
                let flag = match (subject.image.is_some(), subject.profile_path.is_some()) {
                    (true, true) => "",
                    (true, false) => " [no profile]",
                    (false, _) => " [no image]",
                };
                println!("{:<24} {name}{flag}", subject.base_name);
            }
        }
        GalleryCommand::Remove { base } => {
            if gallery.remove(&base)? {
                println!("Removed {base}");
            } else {
                bail!("no subject named {base:?}");
            }
        }
    }
    Ok(())
}

fn history(config: &Config, cmd: HistoryCommand) -> Result<()> {
    let ledger = config.open_ledger()?;
    match cmd {
        HistoryCommand::List { limit } => {
            let records = ledger.list()?;
            let limit = limit.unwrap_or(records.len());
            print_records(records.iter().take(limit));
        }
        HistoryCommand::Show { id } => {
            let Some(record) = ledger.get(&id)? else {
                bail!("no history record {id:?}");
            };
            print_record_detail(&record);
        }
        HistoryCommand::Search { query } => print_records(&ledger.search(&query)?),
        HistoryCommand::Range { from, to } => {
            let start = parse_time(&from, false)?;
            let end = parse_time(&to, true)?;
            print_records(&ledger.by_date_range(start, end)?);
        }
        HistoryCommand::Above { min } => print_records(&ledger.by_similarity_floor(min)?),
        HistoryCommand::Delete { id } => {
            if ledger.delete(&id)? {
                println!("Deleted {id}");
            } else {
                bail!("no history record {id:?}");
            }
        }
        HistoryCommand::Clear => {
            ledger.clear()?;
            println!("History cleared");
        }
        HistoryCommand::Stats => {
            let stats = ledger.statistics()?;
            println!(
                "Total: {} | Avg similarity: {:.1}% | Max: {:.1}% | Min: {:.1}%",
                stats.count,
                stats.avg_similarity * 100.0,
                stats.max_similarity * 100.0,
                stats.min_similarity * 100.0
            );
        }
    }
    Ok(())
}

fn print_records<'a>(records: impl IntoIterator<Item = &'a HistoryRecord>) {
    let mut any = false;
    for r in records {
        any = true;
        println!(
            "{:<28} {:<20} {:<9} {:>6}  {}",
            r.id,
            r.formatted_date(),
            r.status,
            r.formatted_similarity(),
            r.display_name()
        );
    }
    if !any {
        println!("No history records");
    }
}

fn print_record_detail(r: &HistoryRecord) {
    println!("Record ID:  {}", r.id);
    println!("Status:     {}", r.status);
    println!("Similarity: {}", r.formatted_similarity());
    println!("When:       {} at {}", r.formatted_date(), r.formatted_time());
    println!("Captured:   {}", r.captured_image_ref);
    if let Some(matched) = &r.matched_image_ref {
        println!("Matched:    {matched}");
    }
    if !r.matched_base_name.is_empty() {
        println!("File name:  {}", r.matched_base_name);
    }
    for (key, value) in r.matched_data.fields() {
        println!("  {}: {value}", humanize_key(&key));
    }
}

/// `createdAt` -> `Created at`
fn humanize_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for (i, c) in key.chars().enumerate() {
        if i == 0 {
            out.extend(c.to_uppercase());
        } else if c.is_uppercase() {
            out.push(' ');
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

fn parse_label(raw: &str) -> Result<Label, String> {
    let (text, confidence) = match raw.split_once('=') {
        Some((text, conf)) => {
            let conf: f32 = conf
                .trim()
                .parse()
                .map_err(|_| format!("invalid confidence in {raw:?}"))?;
            (text.trim(), conf)
        }
        None => (raw.trim(), 1.0),
    };
    if text.is_empty() {
        return Err("label text is empty".into());
    }
    if !(0.0..=1.0).contains(&confidence) {
        return Err(format!("confidence {confidence} is outside [0, 1]"));
    }
    Ok(Label::new(text, confidence))
}

/// Epoch millis, or a local calendar date (start of day, or end of day when `end_of_day`).
fn parse_time(raw: &str, end_of_day: bool) -> Result<i64> {
    if let Ok(millis) = raw.parse::<i64>() {
        return Ok(millis);
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("expected YYYY-MM-DD or epoch millis, got {raw:?}"))?;
    let time = if end_of_day {
        date.and_hms_milli_opt(23, 59, 59, 999)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    let Some(naive) = time else {
        bail!("invalid time for {raw}");
    };
    let Some(local) = Local.from_local_datetime(&naive).earliest() else {
        bail!("{raw} does not exist in the local time zone");
    };
    Ok(local.timestamp_millis())
}
