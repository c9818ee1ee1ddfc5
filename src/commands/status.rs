use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::model::{CanonicalRecord, RawRecord};

pub fn run(args: StatusArgs) -> Result<()> {
    let manifest_dir = args.cache_root.join("manifests");
    let records_path = args.cache_root.join("extracted").join("structured_scores.json");
    let dataset_path = args.cache_root.join("processed").join("processed_scores.json");
    let corpus_path = args.cache_root.join("processed").join("rag_corpus.txt");

    info!(cache_root = %args.cache_root.display(), "status requested");

    report_manifests(&manifest_dir)?;

    if records_path.exists() {
        let raw = fs::read(&records_path)
            .with_context(|| format!("failed to read {}", records_path.display()))?;
        let records: Vec<RawRecord> = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse {}", records_path.display()))?;

        info!(path = %records_path.display(), records = records.len(), "raw records present");
    } else {
        warn!(path = %records_path.display(), "raw records missing, run extract first");
    }

    if dataset_path.exists() {
        let raw = fs::read(&dataset_path)
            .with_context(|| format!("failed to read {}", dataset_path.display()))?;
        let dataset: Vec<CanonicalRecord> = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse {}", dataset_path.display()))?;

        info!(path = %dataset_path.display(), records = dataset.len(), "canonical dataset present");
    } else {
        warn!(path = %dataset_path.display(), "canonical dataset missing, run transform first");
    }

    if corpus_path.exists() {
        let corpus = fs::read_to_string(&corpus_path)
            .with_context(|| format!("failed to read {}", corpus_path.display()))?;
        let blocks = corpus.lines().filter(|line| *line == "###").count();

        info!(path = %corpus_path.display(), blocks = blocks, "retrieval corpus present");
    } else {
        warn!(path = %corpus_path.display(), "retrieval corpus missing, run transform first");
    }

    Ok(())
}

fn report_manifests(manifest_dir: &Path) -> Result<()> {
    if !manifest_dir.exists() {
        warn!(path = %manifest_dir.display(), "manifest directory missing");
        return Ok(());
    }

    let mut extract_runs = 0usize;
    let mut transform_runs = 0usize;

    let entries = fs::read_dir(manifest_dir)
        .with_context(|| format!("failed to read {}", manifest_dir.display()))?;
    for entry in entries {
        let entry =
            entry.with_context(|| format!("failed to read entry in {}", manifest_dir.display()))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };

        if name.starts_with("extract_run_") {
            extract_runs += 1;
        } else if name.starts_with("transform_run_") {
            transform_runs += 1;
        }
    }

    info!(
        path = %manifest_dir.display(),
        extract_runs = extract_runs,
        transform_runs = transform_runs,
        "run manifests"
    );

    Ok(())
}
