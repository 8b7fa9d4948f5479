//! Integration tests for the docswarm pipeline
//!
//! Drives documents through the public engine API from ingestion to delivery.

use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;

use docswarm::cli::{collect_inputs, read_document};
use docswarm::config::default_workers;
use docswarm::core::DocumentStatus;
use docswarm::delivery::{FileChannel, MemoryChannel};
use docswarm::evaluate::ValidatorKind;
use docswarm::swarm::{HashProjectionEmbedder, HealLog, TaskRequest};
use docswarm::{
    Config, Coordinator, DeliveryStatus, DeliveryType, DocumentMetadata, Evaluator, OutputFormat,
    PipelineEngine, ValidationCriteria, WorkerSpec,
};

fn report_text() -> String {
    let body = (0..12)
        .map(|i| {
            format!(
                "Survey wave {} shows reservoir sediment reducing turbine output by {} percent.",
                i,
                i + 3
            )
        })
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "# Introduction\nThis report reviews turbine output.\n\n# Findings\n{}\n\n# Conclusion\nDredging restores output.",
        body
    )
}

fn small_chunks() -> Config {
    let mut config = Config::default();
    config.chunking = config.chunking.with_window(40, 8);
    config.delivery.initial_delay_ms = 1;
    config.delivery.max_delay_ms = 2;
    config
}

async fn engine_with_workers(config: &Config) -> Arc<PipelineEngine> {
    let engine = PipelineEngine::new(config).unwrap();
    for spec in &config.workers {
        engine.register_worker(spec.clone()).unwrap();
    }
    engine
}

#[tokio::test]
async fn test_document_to_file_delivery() {
    let out = tempdir().unwrap();
    let config = small_chunks();
    let engine = engine_with_workers(&config).await;
    engine.register_channel(Arc::new(FileChannel::new("file", out.path())));

    let text = report_text();
    let doc_id = engine
        .ingest_document(&text, DocumentMetadata::titled("turbines.md"))
        .await
        .unwrap();
    let status = engine.run_document(&doc_id, &[]).await.unwrap();
    assert_eq!(status.document.status, DocumentStatus::Completed);
    assert!(status.progress.total > 1);
    assert_eq!(status.progress.completed, status.progress.total);

    assert_eq!(engine.reconstruct_document(&doc_id).unwrap(), text.trim());

    let criteria = ValidationCriteria::from_config(&config.evaluation);
    let goals = vec!["sediment".to_string()];
    let result = engine.finalize_document(&doc_id, &criteria, &goals).await.unwrap();
    assert_eq!(result.synthesized.themes[0], "sediment");
    assert!(result.synthesized.sources > 0);

    let record = engine
        .deliver_result(result, OutputFormat::Html, "file", DeliveryType::Immediate)
        .await
        .unwrap();
    assert_eq!(record.status, DeliveryStatus::Delivered);

    let written: Vec<_> = std::fs::read_dir(out.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].extension().unwrap(), "html");
    assert_eq!(std::fs::metadata(&written[0]).unwrap().len() as usize, record.size_bytes);
}

#[tokio::test]
async fn test_documents_share_workers() {
    let config = small_chunks();
    let engine = engine_with_workers(&config).await;

    let first = engine
        .ingest_document(&report_text(), DocumentMetadata::titled("a"))
        .await
        .unwrap();
    let second = engine
        .ingest_document(
            "fn main() {\n    let total = values.iter().sum::<u32>();\n    println!(\"{}\", total);\n}",
            DocumentMetadata::titled("b").with_type("rs"),
        )
        .await
        .unwrap();

    let (a, b) = tokio::join!(engine.run_document(&first, &[]), engine.run_document(&second, &[]));
    assert_eq!(a.unwrap().document.status, DocumentStatus::Completed);
    assert_eq!(b.unwrap().document.status, DocumentStatus::Completed);

    let stats = engine.get_coordination_statistics();
    assert_eq!(stats.total_load, 0);
    assert_eq!(stats.workers.len(), default_workers().len());
    assert!(stats.workers.iter().all(|w| w.load <= w.capacity));
}

#[tokio::test]
async fn test_batch_delivery_through_engine() {
    let mut config = small_chunks();
    config.delivery = config.delivery.with_batch(2, Duration::from_secs(60));
    let engine = engine_with_workers(&config).await;
    let channel = Arc::new(MemoryChannel::new("db"));
    engine.register_channel(channel.clone());

    let mut records = Vec::new();
    for title in ["one", "two"] {
        let id = engine
            .ingest_document(&report_text(), DocumentMetadata::titled(title))
            .await
            .unwrap();
        engine.run_document(&id, &[]).await.unwrap();
        let result = engine
            .finalize_document(&id, &ValidationCriteria::default(), &[])
            .await
            .unwrap();
        records.push(
            engine
                .deliver_result(result, OutputFormat::Csv, "db", DeliveryType::Batch)
                .await
                .unwrap(),
        );
        if records.len() == 1 {
            assert!(channel.rows().is_empty());
        }
    }

    assert_eq!(channel.rows().len(), 1);
    for record in &records {
        let settled = engine.delivery().record(&record.id).unwrap();
        assert_eq!(settled.status, DeliveryStatus::Delivered);
        assert!(settled.batch_id.is_some());
    }
    assert!(engine.flush_deliveries().await.is_empty());
}

#[tokio::test]
async fn test_allocation_picks_lower_load_ratio() {
    let coordinator = Coordinator::new(
        Default::default(),
        Arc::new(HashProjectionEmbedder::new(512, 4)),
        Arc::new(HealLog::new()),
    );
    let small = coordinator
        .register_worker(WorkerSpec::new("small", &["text"], 2))
        .unwrap();
    let large = coordinator
        .register_worker(WorkerSpec::new("large", &["text"], 3))
        .unwrap();

    for description in ["a", "b"] {
        coordinator
            .allocate_task_to(&small, TaskRequest::new(description).with_requirements(&["text"]))
            .await
            .unwrap();
    }
    coordinator
        .allocate_task_to(&large, TaskRequest::new("c").with_requirements(&["text"]))
        .await
        .unwrap();

    let task_id = coordinator
        .allocate_task(TaskRequest::new("summarize text").with_requirements(&["text"]))
        .await
        .unwrap();
    let task = coordinator.task(&task_id).unwrap();
    assert_eq!(task.assigned_worker.as_deref(), Some(large.as_str()));
}

#[test]
fn test_missing_conclusion_reported() {
    let content = format!(
        "# Introduction\n{}\n\n# Analysis\n{}",
        "context words ".repeat(40),
        "detail words ".repeat(40)
    );
    let criteria = ValidationCriteria::default().with_completeness(0.8);
    let results = Evaluator::default().validate("doc", &content, &criteria);

    let completeness = results
        .iter()
        .find(|r| r.validator == ValidatorKind::Completeness)
        .unwrap();
    assert!(!completeness.passed);
    assert!(completeness.issues.iter().any(|i| i.contains("conclusion")));
}

#[test]
fn test_inputs_from_directory() {
    let dir = tempdir().unwrap();
    std::fs::create_dir(dir.path().join("notes")).unwrap();
    std::fs::write(dir.path().join("notes").join("a.md"), "# A\nalpha").unwrap();
    std::fs::write(dir.path().join("b.txt"), "beta").unwrap();
    std::fs::write(dir.path().join("c.bin"), [0u8, 1, 2]).unwrap();

    // temp dirs may themselves be hidden, so hidden filtering stays off
    let files = collect_inputs(&[dir.path().to_path_buf()], None, false);
    assert_eq!(files.len(), 2);
    assert_eq!(read_document(&files[0]).unwrap(), "beta");
}
