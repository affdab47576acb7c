//! Per-run provenance: `reports/<run_id>/` with the run row, a markdown
//! summary and a parquet export of the published ranking set.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, Int64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chartkeep_core::{DailyStats, RankingEntry, RunLogEntry};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::ingest::IngestReport;

#[derive(Debug, Clone, Serialize)]
pub struct FeedProvenance {
    pub location: String,
    pub source: Option<String>,
    pub digest: String,
    pub artifact_path: Option<String>,
    pub rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport<'a> {
    pub run: &'a RunLogEntry,
    pub feed: Option<&'a FeedProvenance>,
    pub ingest: Option<&'a IngestReport>,
    pub stats: Option<&'a DailyStats>,
    pub cumulative_entities: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Write the report directory for a finished run. `published` is the ranking
/// set the run made effective, if any.
pub async fn write_run_report(
    reports_root: &Path,
    report: &RunReport<'_>,
    published: Option<&[RankingEntry]>,
) -> Result<PathBuf> {
    let dir = reports_root.join(report.run.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(report).context("serializing run report")?;
    fs::write(dir.join("run.json"), json)
        .await
        .context("writing run.json")?;
    fs::write(dir.join("summary.md"), render_summary(report, published))
        .await
        .context("writing summary.md")?;

    if let Some(entries) = published {
        export_rankings(&dir, entries).await?;
    }
    Ok(dir)
}

pub fn render_summary(report: &RunReport<'_>, published: Option<&[RankingEntry]>) -> String {
    let run = report.run;
    let mut lines = vec![
        format!("# Daily chart run {}", run.snapshot_date),
        String::new(),
        format!("- Run ID: `{}`", run.run_id),
        format!("- Status: {}", run.status),
        format!("- Actor: {}", run.actor),
        format!("- Algorithm: {}", run.algorithm_version),
        format!("- Started: {}", fmt_time(run.started_at)),
        format!("- Finished: {}", fmt_time(run.finished_at)),
        format!(
            "- Rows: {} ingested, {} rejected, {} ranking rows written",
            run.rows_ingested, run.rows_rejected, run.rows_written
        ),
    ];
    if run.dry_run {
        lines.push("- Dry run: nothing was published".to_string());
    }
    if run.forced {
        lines.push("- Forced past the freeze window".to_string());
    }
    if let Some(cause) = &run.cause {
        lines.push(format!("- Cause: {cause}"));
    }
    if let Some(feed) = report.feed {
        lines.push(format!("- Feed: `{}` ({} rows, sha256 `{}`)", feed.location, feed.rows, feed.digest));
    }

    if let Some(stats) = report.stats {
        lines.push(String::new());
        lines.push("## Stats".to_string());
        lines.push(format!(
            "- Average score: {} (change {})",
            fmt_opt(stats.current.avg_score),
            fmt_opt(stats.avg_score_diff())
        ));
        lines.push(format!(
            "- Zero popularity: {} (change {})",
            stats.current.count_pop_zero,
            fmt_opt(stats.count_pop_zero_diff())
        ));
        lines.push(format!(
            "- Zero track popularity: {} (change {})",
            stats.current.count_track_zero,
            fmt_opt(stats.count_track_zero_diff())
        ));
    }

    if !run.issues.is_empty() {
        lines.push(String::new());
        lines.push("## Rejected rows".to_string());
        lines.extend(
            run.issues
                .iter()
                .map(|i| format!("- {}/{}: {}", i.service, i.external_id, i.reason)),
        );
    }

    if let Some(entries) = published {
        lines.push(String::new());
        lines.push("## Top of the chart".to_string());
        lines.extend(entries.iter().take(20).map(|e| {
            format!(
                "{}. `{}` score {:.2} ({})",
                e.rank,
                e.entity_id,
                e.score,
                e.movement.as_str()
            )
        }));
    }
    lines.push(String::new());
    lines.join("\n")
}

fn fmt_time(at: Option<chrono::DateTime<chrono::Utc>>) -> String {
    at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string())
}

fn fmt_opt<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "n/a".to_string())
}

async fn export_rankings(dir: &Path, entries: &[RankingEntry]) -> Result<PathBuf> {
    let export_dir = dir.join("snapshots");
    fs::create_dir_all(&export_dir)
        .await
        .with_context(|| format!("creating {}", export_dir.display()))?;

    let rankings_path = export_dir.join("daily_rankings.parquet");
    write_rankings_parquet(&rankings_path, entries)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![manifest_entry("daily_rankings", dir, &rankings_path)?],
    };
    let manifest_path = export_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_rankings_parquet(path: &Path, entries: &[RankingEntry]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("snapshot_date", DataType::Utf8, false),
        ArrowField::new("entity_id", DataType::Utf8, false),
        ArrowField::new("rank", DataType::UInt32, false),
        ArrowField::new("prev_rank", DataType::UInt32, true),
        ArrowField::new("rank_delta", DataType::Int64, true),
        ArrowField::new("score", DataType::Float64, false),
        ArrowField::new("prev_score", DataType::Float64, true),
        ArrowField::new("score_delta", DataType::Float64, true),
        ArrowField::new("movement", DataType::Utf8, false),
        ArrowField::new("popularity", DataType::Int64, false),
        ArrowField::new("followers", DataType::Int64, false),
        ArrowField::new("algorithm_version", DataType::Utf8, false),
    ]));

    let dates = StringArray::from(
        entries
            .iter()
            .map(|e| Some(e.snapshot_date.to_string()))
            .collect::<Vec<_>>(),
    );
    let entity_ids = StringArray::from(
        entries
            .iter()
            .map(|e| Some(e.entity_id.to_string()))
            .collect::<Vec<_>>(),
    );
    let ranks = UInt32Array::from(entries.iter().map(|e| e.rank).collect::<Vec<_>>());
    let prev_ranks = UInt32Array::from(entries.iter().map(|e| e.prev_rank).collect::<Vec<_>>());
    let rank_deltas = Int64Array::from(entries.iter().map(|e| e.rank_delta).collect::<Vec<_>>());
    let scores = Float64Array::from(entries.iter().map(|e| e.score).collect::<Vec<_>>());
    let prev_scores = Float64Array::from(entries.iter().map(|e| e.prev_score).collect::<Vec<_>>());
    let score_deltas = Float64Array::from(entries.iter().map(|e| e.score_delta).collect::<Vec<_>>());
    let movements = StringArray::from(
        entries
            .iter()
            .map(|e| Some(e.movement.as_str()))
            .collect::<Vec<_>>(),
    );
    let popularity = Int64Array::from(entries.iter().map(|e| e.metrics.popularity).collect::<Vec<_>>());
    let followers = Int64Array::from(entries.iter().map(|e| e.metrics.followers).collect::<Vec<_>>());
    let versions = StringArray::from(
        entries
            .iter()
            .map(|e| Some(e.algorithm_version.as_str()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(dates),
            Arc::new(entity_ids),
            Arc::new(ranks),
            Arc::new(prev_ranks),
            Arc::new(rank_deltas),
            Arc::new(scores),
            Arc::new(prev_scores),
            Arc::new(score_deltas),
            Arc::new(movements),
            Arc::new(popularity),
            Arc::new(followers),
            Arc::new(versions),
        ],
    )
    .context("building daily_rankings record batch")?;

    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, root: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: path.strip_prefix(root).unwrap_or(path).display().to_string(),
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}
