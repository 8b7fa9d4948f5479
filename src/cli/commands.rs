//! Command handlers

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use tracing::warn;

use super::{
    ChannelArg, ChunkArgs, Cli, Commands, ConfigAction, DeliveryArg, ProcessArgs, ReportFormat, RouteArgs,
};
use crate::config::{generate_sample_config, Config};
use crate::core::{DocumentMetadata, PipelineEngine};
use crate::delivery::{ConsoleChannel, DeliveryRecord, DeliveryStatus, DeliveryType, FileChannel};
use crate::evaluate::ValidationCriteria;
use crate::swarm::{embedder_from_config, Chunker, Coordinator, HealLog, TaskRequest};

const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "markdown", "rst", "csv", "json", "pdf"];

/// Dispatch a parsed command line
pub async fn run(cli: Cli, config: Config) -> Result<()> {
    match cli.command {
        Commands::Process(args) => process(&args, &config).await,
        Commands::Chunk(args) => chunk(&args, &config),
        Commands::Route(args) => route(&args, &config).await,
        Commands::Config(args) => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            match args.action {
                ConfigAction::Init { force } => {
                    if path.exists() && !force {
                        bail!("{} already exists (use --force to overwrite)", path.display());
                    }
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&path, generate_sample_config())
                        .with_context(|| format!("Failed to write config: {}", path.display()))?;
                    println!("{} Wrote {}", "✓".bright_green().bold(), path.display());
                }
                ConfigAction::Show => {
                    print!("{}", toml::to_string_pretty(&config).context("Failed to serialize config")?);
                }
                ConfigAction::Path => println!("{}", path.display()),
            }
            Ok(())
        }
    }
}

// ============================================================================
// Inputs
// ============================================================================

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map(|s| s.starts_with('.'))
            .unwrap_or(false)
}

/// Expand files and directories into document paths, sorted
pub fn collect_inputs(paths: &[PathBuf], extensions: Option<&[String]>, skip_hidden: bool) -> Vec<PathBuf> {
    let wanted = |path: &Path| {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        match extensions {
            Some(list) => list.iter().any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(&ext)),
            None => TEXT_EXTENSIONS.contains(&ext.as_str()),
        }
    };

    let mut files = Vec::new();
    for path in paths {
        if path.is_file() {
            files.push(path.clone());
            continue;
        }
        let entries = walkdir::WalkDir::new(path)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !(skip_hidden && is_hidden(e)))
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| wanted(e.path()))
            .map(|e| e.path().to_path_buf());
        files.extend(entries);
    }
    files.sort();
    files.dedup();
    files
}

/// Read a document as text; PDFs go through pdf-extract
pub fn read_document(path: &Path) -> Result<String> {
    let is_pdf = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("pdf"));
    if is_pdf {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read PDF: {}", path.display()))?;
        return pdf_extract::extract_text_from_mem(&bytes)
            .with_context(|| format!("Failed to extract text from PDF: {}", path.display()));
    }
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

// ============================================================================
// process
// ============================================================================

async fn process_one(
    engine: &Arc<PipelineEngine>,
    path: &Path,
    args: &ProcessArgs,
    criteria: &ValidationCriteria,
    delivery_type: DeliveryType,
) -> Result<DeliveryRecord> {
    let owned = path.to_path_buf();
    let text = tokio::task::spawn_blocking(move || read_document(&owned))
        .await
        .context("Reader task panicked")??;

    let title = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    let mut metadata = DocumentMetadata::titled(title).with_extra("path", path.display().to_string());
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        metadata = metadata.with_type(ext.to_lowercase());
    }

    let doc_id = engine.ingest_document(&text, metadata).await?;
    let status = engine.run_document(&doc_id, &args.goals).await?;
    if status.progress.failed > 0 {
        warn!(
            "{}: {} of {} chunks failed",
            path.display(),
            status.progress.failed,
            status.progress.total
        );
    }

    let result = engine.finalize_document(&doc_id, criteria, &args.goals).await?;
    let record = engine
        .deliver_result(result, args.format, args.channel.name(), delivery_type)
        .await?;
    Ok(record)
}

/// Poll until every record is terminal; scheduled deliveries fire on their own
async fn await_deliveries(engine: &PipelineEngine, ids: &[String]) -> Vec<DeliveryRecord> {
    loop {
        let records: Vec<DeliveryRecord> = ids
            .iter()
            .filter_map(|id| engine.delivery().record(id))
            .collect();
        if records.iter().all(|r| r.status.is_terminal()) {
            return records;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

async fn process(args: &ProcessArgs, config: &Config) -> Result<()> {
    let files = collect_inputs(&args.paths, args.extensions.as_deref(), args.skip_hidden);
    if files.is_empty() {
        bail!("No documents found in the given paths");
    }

    let engine = PipelineEngine::new(config)?;
    for spec in &config.workers {
        engine.register_worker(spec.clone())?;
    }
    match args.channel {
        ChannelArg::File => {
            let dir = args
                .output
                .clone()
                .unwrap_or_else(|| config.delivery.output_dir.clone());
            engine.register_channel(Arc::new(FileChannel::new(ChannelArg::File.name(), dir)));
        }
        ChannelArg::Console => engine.register_channel(Arc::new(ConsoleChannel)),
    }

    let criteria = ValidationCriteria::from_config(&config.evaluation);
    let delivery_type = match args.delivery {
        DeliveryArg::Immediate => DeliveryType::Immediate,
        DeliveryArg::Scheduled => DeliveryType::scheduled_in(*args.schedule_in),
        DeliveryArg::Batch => DeliveryType::Batch,
    };

    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓▒░"),
    );

    let mut ids = Vec::new();
    let mut failures = Vec::new();
    for path in &files {
        pb.set_message(path.display().to_string());
        match process_one(&engine, path, args, &criteria, delivery_type).await {
            Ok(record) => ids.push(record.id),
            Err(e) => {
                warn!("{}: {:#}", path.display(), e);
                failures.push((path.clone(), format!("{:#}", e)));
            }
        }
        pb.inc(1);
    }
    pb.finish_with_message("done");

    if args.delivery == DeliveryArg::Batch {
        let batches = engine.flush_deliveries().await;
        tracing::debug!("Flushed {} batches", batches.len());
    }
    let records = await_deliveries(&engine, &ids).await;

    let stats = engine.get_coordination_statistics();
    let delivery = engine.delivery().stats();
    match args.report {
        ReportFormat::Json => {
            let summary = json!({
                "documents": files.len(),
                "failed_documents": failures.iter().map(|(p, e)| json!({"path": p, "error": e})).collect::<Vec<_>>(),
                "deliveries": records,
                "delivery_stats": delivery,
                "coordination": stats,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        ReportFormat::Human => {
            println!("\n{}", "═".repeat(50).bright_cyan());
            println!(
                "  {} {} documents processed",
                "✓".bright_green().bold(),
                files.len() - failures.len()
            );
            for (path, error) in &failures {
                println!("  {} {}: {}", "⚠".yellow(), path.display(), error);
            }
            for record in &records {
                let status = match record.status {
                    DeliveryStatus::Delivered => "delivered".bright_green(),
                    DeliveryStatus::Failed => "failed".red(),
                    other => other.as_str().normal(),
                };
                println!(
                    "  {} {} via {} as {} ({}, {} attempt{})",
                    "📦".bright_cyan(),
                    status,
                    record.channel,
                    record.format,
                    humansize::format_size(record.size_bytes, humansize::BINARY),
                    record.attempts,
                    if record.attempts == 1 { "" } else { "s" }
                );
                if let Some(error) = &record.error {
                    println!("      {}", error.dimmed());
                }
            }
            println!(
                "  {} {} workers, {} tasks allocated, {} messages retried",
                "🐝".bright_cyan(),
                stats.workers.len(),
                stats.counters.tasks_allocated,
                stats.counters.messages_retried
            );
            println!(
                "  {} {} sent in {} deliveries",
                "📊".bright_cyan(),
                humansize::format_size(delivery.bytes_sent, humansize::BINARY),
                delivery.delivered
            );
            println!("{}", "═".repeat(50).bright_cyan());
        }
    }

    if !failures.is_empty() && failures.len() == files.len() {
        bail!("Every document failed");
    }
    Ok(())
}

// ============================================================================
// chunk / route
// ============================================================================

fn chunk(args: &ChunkArgs, config: &Config) -> Result<()> {
    let mut chunking = config.chunking.clone();
    if let Some(max) = args.max_words {
        chunking.max_chunk_size = max;
    }
    if let Some(overlap) = args.overlap {
        chunking.overlap_size = overlap;
    }

    let text = read_document(&args.file)?;
    let doc_id = args
        .file
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "document".to_string());
    let chunks = Chunker::new(chunking)?.chunk_document(&doc_id, text.trim())?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&chunks)?);
        return Ok(());
    }

    println!(
        "{}",
        format!("{:>4}  {:<6}  {:>6}  {:>5}  {:>7}  keywords", "pos", "type", "words", "olap", "complex").bold()
    );
    for chunk in &chunks {
        println!(
            "{:>4}  {:<6}  {:>6}  {:>5}  {:>7.2}  {}",
            chunk.position,
            chunk.content_type.as_str(),
            chunk.word_count,
            chunk.overlap_words,
            chunk.complexity,
            chunk.keywords.iter().take(5).cloned().collect::<Vec<_>>().join(", ")
        );
    }
    println!(
        "\n{} chunks, {} related links",
        chunks.len(),
        chunks.iter().map(|c| c.related_chunk_ids.len()).sum::<usize>()
    );
    Ok(())
}

async fn route(args: &RouteArgs, config: &Config) -> Result<()> {
    if config.workers.is_empty() {
        bail!("No workers configured");
    }
    let coordinator = Coordinator::new(
        config.coordination.clone(),
        embedder_from_config(&config.routing),
        Arc::new(HealLog::new()),
    );
    let mut names = std::collections::HashMap::new();
    for spec in &config.workers {
        let name = spec.name.clone();
        names.insert(coordinator.register_worker(spec.clone())?, name);
    }

    let index = coordinator.index();
    let task_vector = index
        .task_vector_async(&args.description, &args.requirements)
        .await?;
    let candidates = index.rank_with_vector(&task_vector, &args.description, &args.requirements, |_| true);
    if candidates.is_empty() {
        println!("{} No worker shares a capability with this task", "⚠".yellow());
        return Ok(());
    }

    println!("{}", format!("{:>4}  {:<20}  {:>10}  {:>7}", "rank", "worker", "similarity", "overlap").bold());
    for (i, candidate) in candidates.iter().enumerate() {
        let name = names.get(&candidate.worker_id).map(String::as_str).unwrap_or("?");
        println!(
            "{:>4}  {:<20}  {:>10.4}  {:>7}",
            i + 1,
            name,
            candidate.similarity,
            candidate.overlap
        );
    }

    let requirements: Vec<&str> = args.requirements.iter().map(String::as_str).collect();
    let task_id = coordinator
        .allocate_task(TaskRequest::new(args.description.clone()).with_requirements(&requirements))
        .await?;
    if let Some(worker) = coordinator.task(&task_id).and_then(|t| t.assigned_worker) {
        let name = names.get(&worker).cloned().unwrap_or(worker);
        println!("\n{} Allocation picks {}", "→".bright_green().bold(), name.bold());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_collect_inputs_filters_and_sorts() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b.md"), "b").unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::write(dir.path().join("image.png"), "x").unwrap();
        std::fs::create_dir(dir.path().join(".hidden")).unwrap();
        std::fs::write(dir.path().join(".hidden").join("c.md"), "c").unwrap();

        let files = collect_inputs(&[dir.path().to_path_buf()], None, true);
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.txt", "b.md"]);

        let only_md = collect_inputs(&[dir.path().to_path_buf()], Some(&["md".to_string()]), false);
        assert_eq!(only_md.len(), 2);
    }

    #[test]
    fn test_read_document_text() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("note.txt");
        std::fs::write(&path, "hello there").unwrap();
        assert_eq!(read_document(&path).unwrap(), "hello there");
        assert!(read_document(&dir.path().join("missing.txt")).is_err());
    }
}
