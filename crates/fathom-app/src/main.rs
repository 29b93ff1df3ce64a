//! Fathom application binary - composition root.
//!
//! 1. Load configuration from TOML and apply env / CLI overrides
//! 2. Build the reconciliation engine
//! 3. Feed a recorded JSON-lines transcript through it, one push per line
//! 4. Print the reconciled turns, progress, and an optional export

mod cli;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc, Notify};

use fathom_core::config::FathomConfig;
use fathom_core::events::TurnEvent;
use fathom_core::types::{Message, StreamStatus};
use fathom_core::wire::parse_update_line;
use fathom_stream::{
    AnswerExport, ProgressView, ReconciliationEngine, StreamUpdate, SubmissionGate, TurnView,
};

use cli::{CliArgs, ExportFormat};

/// Counters reported after a replay.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
struct ReplayStats {
    lines: usize,
    updates: usize,
    skipped: usize,
    rejected_submissions: usize,
}

#[derive(Serialize)]
struct ReplayReport<'a> {
    turns: &'a [TurnView],
    progress: &'a ProgressView,
    stats: &'a ReplayStats,
}

/// Read transport pushes line by line and forward them to the engine.
///
/// Lines that fail to decode are logged and skipped. New user queries are run
/// through the submission gate so transcripts that resubmit while a response
/// is still in flight are reported.
async fn replay_lines<R>(
    reader: R,
    updates: &mpsc::Sender<StreamUpdate>,
    gate: &mut SubmissionGate,
    delay: Duration,
) -> std::io::Result<ReplayStats>
where
    R: AsyncBufRead + Unpin,
{
    let mut stats = ReplayStats::default();
    let mut lines = reader.lines();
    let mut users_seen = 0usize;
    let mut previous_status = StreamStatus::Ready;

    while let Some(line) = lines.next_line().await? {
        stats.lines += 1;
        if line.trim().is_empty() {
            continue;
        }

        let (messages, status) = match parse_update_line(&line) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(line = stats.lines, error = %e, "Skipping undecodable transcript line");
                stats.skipped += 1;
                continue;
            }
        };

        let users = messages.iter().filter(|m| m.is_user()).count();
        if users > users_seen {
            if let Some(query) = messages.last().filter(|m| m.is_user()).map(Message::text) {
                if let Err(e) = gate.submit(&query, previous_status.is_in_flight()) {
                    tracing::warn!(line = stats.lines, error = %e, "Transcript submits a query the gate would refuse");
                    stats.rejected_submissions += 1;
                }
            }
            users_seen = users;
        }
        previous_status = status;

        if updates.send(StreamUpdate { messages, status }).await.is_err() {
            tracing::warn!("Engine stopped before the transcript ended");
            break;
        }
        stats.updates += 1;

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    Ok(stats)
}

/// Print events as JSON lines until `done` fires, then flush what is buffered.
async fn print_events(mut events: broadcast::Receiver<TurnEvent>, done: Arc<Notify>) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Event printer fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = done.notified() => {
                while let Ok(event) = events.try_recv() {
                    print_event(&event);
                }
                break;
            }
        }
    }
}

fn print_event(event: &TurnEvent) {
    match serde_json::to_string(event) {
        Ok(json) => println!("{}", json),
        Err(e) => tracing::warn!(error = %e, event = event.event_name(), "Failed to encode event"),
    }
}

fn render_progress(progress: &ProgressView) -> String {
    let Some(turn) = progress.turn else {
        return "Progress: idle".to_string();
    };
    let percent = (progress.fraction * 100.0).round() as u32;
    let mut line = format!(
        "Progress (turn {}): {}% - {}s elapsed, {}s remaining",
        turn + 1,
        percent,
        progress.elapsed_secs,
        progress.remaining_secs
    );
    if progress.active {
        if let Some(label) = &progress.step_label {
            line.push_str(&format!(" [{}]", label));
        }
    }
    line
}

fn render_turns(turns: &[TurnView]) -> String {
    let mut out = String::new();
    for turn in turns {
        out.push_str(&format!("=== Turn {} ===\n", turn.index + 1));
        out.push_str(&format!("Q: {}\n", turn.query));
        match turn.answer.as_deref() {
            Some(answer) if !answer.trim().is_empty() => out.push_str(&format!("A: {}\n", answer.trim())),
            Some(_) => out.push_str("A: (no text yet)\n"),
            None => out.push_str("A: (awaiting response)\n"),
        }

        let facets = &turn.facets;
        if let Some(symbol) = facets.ticker_symbol() {
            out.push_str(&format!("Ticker: {}\n", symbol));
        }
        if let Some(status) = facets.status_text() {
            out.push_str(&format!("Status: {}\n", status));
        }
        if !facets.sources().is_empty() {
            out.push_str(&format!("Sources ({}):\n", facets.sources().len()));
            for (i, source) in facets.sources().iter().enumerate() {
                out.push_str(&format!("  {}. {} ({})\n", i + 1, source.title, source.site_label()));
                out.push_str(&format!("     {}\n", source.url));
            }
        }
        if !facets.news().is_empty() {
            out.push_str(&format!("News: {} item(s)\n", facets.news().len()));
        }
        if !facets.images().is_empty() {
            out.push_str(&format!("Images: {} item(s)\n", facets.images().len()));
        }
        if !facets.follow_ups().is_empty() {
            out.push_str("Follow-ups:\n");
            for question in facets.follow_ups() {
                out.push_str(&format!("  - {}\n", question));
            }
        }
        out.push('\n');
    }
    out
}

fn export_turn(turn: &TurnView, format: ExportFormat) -> Result<Option<String>, Box<dyn std::error::Error>> {
    let export = AnswerExport::from_turn(turn);
    Ok(match format {
        ExportFormat::Markdown => export.to_markdown(),
        ExportFormat::Json => Some(export.to_json()?),
        ExportFormat::Citations => export.citations(),
    })
}

fn load_config(args: &CliArgs, config_file: &Path) -> FathomConfig {
    let mut config = FathomConfig::load_or_default(config_file);
    config.apply_env_overrides();
    config.progress.speed = args.resolve_speed(config.progress.speed);
    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config first so its log level can seed the filter.
    let config_file = args.resolve_config_path();
    let config_exists = config_file.exists();
    let config = load_config(&args, &config_file);

    // Tracing.
    let level = args.resolve_log_level(&config.general.log_level);
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&level)),
        )
        .init();

    tracing::info!("Starting Fathom v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        path = %config_file.display(),
        found = config_exists,
        speed = %config.progress.speed,
        "Configuration loaded"
    );

    if args.write_config {
        config.save(&config_file)?;
        println!("Wrote {}", config_file.display());
        return Ok(());
    }

    // Engine.
    let engine = Arc::new(ReconciliationEngine::from_config(&config)?);
    let (tx, rx) = mpsc::channel::<StreamUpdate>(64);

    let printer_done = Arc::new(Notify::new());
    let printer = args.events.then(|| {
        tokio::spawn(print_events(engine.subscribe(), Arc::clone(&printer_done)))
    });

    let runner = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.run(rx).await })
    };

    // Replay.
    let mut gate = SubmissionGate::new(&config.submission, true);
    let delay = Duration::from_millis(args.delay_ms);
    let stats = match args.transcript_path() {
        Some(path) => {
            let file = tokio::fs::File::open(path).await?;
            tracing::info!(path = %path.display(), "Replaying transcript");
            replay_lines(BufReader::new(file), &tx, &mut gate, delay).await?
        }
        None => {
            tracing::info!("Replaying transcript from stdin");
            replay_lines(BufReader::new(tokio::io::stdin()), &tx, &mut gate, delay).await?
        }
    };
    drop(tx);
    runner.await?;

    if let Some(printer) = printer {
        printer_done.notify_one();
        printer.await?;
    }

    tracing::info!(
        lines = stats.lines,
        updates = stats.updates,
        skipped = stats.skipped,
        rejected = stats.rejected_submissions,
        "Replay finished"
    );

    // Output.
    let turns = engine.view();
    let progress = engine.progress();
    if args.json {
        let report = ReplayReport {
            turns: &turns,
            progress: &progress,
            stats: &stats,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if !args.events {
        print!("{}", render_turns(&turns));
        println!("{}", render_progress(&progress));
    }

    if let Some(format) = args.export {
        match turns.last() {
            Some(turn) => match export_turn(turn, format)? {
                Some(text) => println!("{}", text),
                None => tracing::warn!(?format, "Nothing to export for the last turn"),
            },
            None => tracing::warn!("Transcript contained no turns to export"),
        }
    }

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
