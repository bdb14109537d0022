//! Per-run reports: JSON summary, markdown brief and a parquet snapshot of
//! table outcomes with a sha256 manifest.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

use crate::dispatch::DispatchOutcome;
use crate::partition::TableReport;
use crate::persist::TableOutcome;

pub const SUMMARY_FILE: &str = "run_summary.json";
pub const BRIEF_FILE: &str = "daily_brief.md";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub feed_id: String,
    pub fetched_orders: usize,
    pub feed_requests: usize,
    pub failed_requests: usize,
    pub undated_orders: usize,
    pub review_labels: usize,
    pub cost_rows_registered: usize,
    pub dispatch: Option<DispatchOutcome>,
    pub tables: Vec<TableReport>,
    #[serde(default)]
    pub reports_dir: Option<String>,
    #[serde(default)]
    pub parquet_manifest: Option<String>,
}

impl RunSummary {
    pub fn failed_tables(&self) -> usize {
        self.tables.iter().filter(|t| t.is_failed()).count()
    }

    pub fn written_tables(&self) -> usize {
        self.tables
            .iter()
            .filter(|t| matches!(t, TableReport::Reconciled(o) if o.written))
            .count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes `reports/<run_id>/` and records its paths on the summary.
pub async fn write_run_reports(workspace_root: &Path, summary: &mut RunSummary) -> Result<PathBuf> {
    let reports_dir = workspace_root
        .join("reports")
        .join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;
    let manifest_path = reports_dir.join("snapshots").join("manifest.json");
    summary.reports_dir = Some(reports_dir.display().to_string());
    summary.parquet_manifest = Some(manifest_path.display().to_string());

    fs::write(reports_dir.join(BRIEF_FILE), render_brief(summary))
        .await
        .context("writing daily_brief.md")?;

    let json = serde_json::to_vec_pretty(&*summary).context("serializing run summary")?;
    fs::write(reports_dir.join(SUMMARY_FILE), json)
        .await
        .context("writing run_summary.json")?;

    export_parquet_snapshot(&reports_dir, &summary.tables).await?;
    Ok(reports_dir)
}

fn render_brief(summary: &RunSummary) -> String {
    let mut lines = vec![
        "# Ledger Sync Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Feed: {}", summary.feed_id),
        format!(
            "- Orders fetched: {} ({} requests, {} failed)",
            summary.fetched_orders, summary.feed_requests, summary.failed_requests
        ),
        format!("- Undated orders: {}", summary.undated_orders),
        format!("- New cost rows: {}", summary.cost_rows_registered),
    ];
    if let Some(dispatch) = &summary.dispatch {
        lines.push(format!(
            "- Dispatch queue: {} pending (+{} / -{})",
            dispatch.pending, dispatch.added, dispatch.removed
        ));
    }
    lines.push(String::new());
    lines.push("## Tables".to_string());
    for table in &summary.tables {
        lines.push(match table {
            TableReport::Reconciled(o) => format!(
                "- {}: +{} ~{} -{} ={}{}",
                o.table,
                o.stats.inserted,
                o.stats.updated,
                o.stats.deleted,
                o.stats.unchanged,
                if o.written { "" } else { " (untouched)" }
            ),
            TableReport::Failed { table, error, .. } => format!("- {table}: FAILED ({error})"),
        });
    }
    lines.push(String::new());
    lines.join("\n")
}

async fn export_parquet_snapshot(reports_dir: &Path, tables: &[TableReport]) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let bytes = encode_parquet(partitions_batch(tables)?)?;
    let partitions_path = snapshot_dir.join("partitions.parquet");
    fs::write(&partitions_path, &bytes)
        .await
        .with_context(|| format!("writing {}", partitions_path.display()))?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![manifest_file("partitions", "snapshots/partitions.parquet", &bytes)],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let json = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, json)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

/// Encode one batch as a complete parquet file in memory.
fn encode_parquet(batch: RecordBatch) -> Result<Vec<u8>> {
    let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), None)
        .context("opening parquet encoder")?;
    writer.write(&batch).context("encoding partitions batch")?;
    writer.into_inner().context("finishing parquet file")
}

/// Manifest line for bytes already written under `relative_path`.
fn manifest_file(name: &str, relative_path: &str, bytes: &[u8]) -> ParquetManifestFile {
    ParquetManifestFile {
        name: name.to_string(),
        path: relative_path.to_string(),
        sha256: hex::encode(Sha256::digest(bytes)),
        bytes: bytes.len() as u64,
    }
}

fn reconciled(report: &TableReport) -> Option<&TableOutcome> {
    match report {
        TableReport::Reconciled(outcome) => Some(outcome),
        TableReport::Failed { .. } => None,
    }
}

fn partitions_batch(tables: &[TableReport]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("table", DataType::Utf8, false),
        ArrowField::new("mode", DataType::Utf8, false),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("inserted", DataType::UInt64, false),
        ArrowField::new("updated", DataType::UInt64, false),
        ArrowField::new("deleted", DataType::UInt64, false),
        ArrowField::new("unchanged", DataType::UInt64, false),
        ArrowField::new("row_count", DataType::UInt64, false),
        ArrowField::new("written", DataType::Boolean, false),
        ArrowField::new("content_sha256", DataType::Utf8, true),
        ArrowField::new("error", DataType::Utf8, true),
    ]));

    let count = |f: fn(&TableOutcome) -> usize| {
        UInt64Array::from(
            tables
                .iter()
                .map(|t| reconciled(t).map(|o| f(o) as u64).unwrap_or(0))
                .collect::<Vec<_>>(),
        )
    };

    let names = StringArray::from(tables.iter().map(|t| Some(t.table())).collect::<Vec<_>>());
    let modes = StringArray::from(
        tables
            .iter()
            .map(|t| {
                Some(match t {
                    TableReport::Reconciled(o) => o.mode.to_string(),
                    TableReport::Failed { mode, .. } => mode.to_string(),
                })
            })
            .collect::<Vec<_>>(),
    );
    let statuses = StringArray::from(
        tables
            .iter()
            .map(|t| Some(if t.is_failed() { "failed" } else { "reconciled" }))
            .collect::<Vec<_>>(),
    );
    let written = BooleanArray::from(
        tables
            .iter()
            .map(|t| reconciled(t).is_some_and(|o| o.written))
            .collect::<Vec<_>>(),
    );
    let hashes = StringArray::from(
        tables
            .iter()
            .map(|t| reconciled(t).map(|o| o.content_sha256.as_str()))
            .collect::<Vec<_>>(),
    );
    let errors = StringArray::from(
        tables
            .iter()
            .map(|t| match t {
                TableReport::Failed { error, .. } => Some(error.clone()),
                TableReport::Reconciled(_) => None,
            })
            .collect::<Vec<_>>(),
    );

    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(names),
            Arc::new(modes),
            Arc::new(statuses),
            Arc::new(count(|o| o.stats.inserted)),
            Arc::new(count(|o| o.stats.updated)),
            Arc::new(count(|o| o.stats.deleted)),
            Arc::new(count(|o| o.stats.unchanged)),
            Arc::new(count(|o| o.row_count)),
            Arc::new(written),
            Arc::new(hashes),
            Arc::new(errors),
        ],
    )
    .context("building partitions record batch")
}

/// Markdown digest of the most recent `runs` report directories.
pub fn report_recent_runs(runs: usize, workspace_root: &Path) -> Result<String> {
    let reports_root = workspace_root.join("reports");
    let mut dirs = std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# Ledger Sync Runs".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let summary_path = dir.path().join(SUMMARY_FILE);
        let summary: RunSummary = serde_json::from_str(
            &std::fs::read_to_string(&summary_path)
                .with_context(|| format!("reading {}", summary_path.display()))?,
        )
        .with_context(|| format!("parsing {}", summary_path.display()))?;

        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- finished: {}", summary.finished_at));
        lines.push(format!("- orders fetched: {}", summary.fetched_orders));
        lines.push(format!(
            "- tables: {} reconciled, {} written, {} failed",
            summary.tables.len() - summary.failed_tables(),
            summary.written_tables(),
            summary.failed_tables()
        ));
        let manifest_path = dir.path().join("snapshots").join("manifest.json");
        if manifest_path.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest_path.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanStats;
    use crate::schema::HeaderMigration;
    use chrono::TimeZone;
    use olr_core::LedgerMode;

    fn summary() -> RunSummary {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).single().unwrap();
        RunSummary {
            run_id: Uuid::new_v4(),
            started_at: at,
            finished_at: at,
            feed_id: "fixture".into(),
            fetched_orders: 3,
            feed_requests: 1,
            failed_requests: 0,
            undated_orders: 1,
            review_labels: 0,
            cost_rows_registered: 2,
            dispatch: None,
            tables: vec![
                TableReport::Reconciled(TableOutcome {
                    table: "shop_2024-02".into(),
                    mode: LedgerMode::Orders,
                    header: HeaderMigration::Created,
                    stats: PlanStats {
                        inserted: 2,
                        ..PlanStats::default()
                    },
                    written: true,
                    row_count: 2,
                    content_sha256: "abc".into(),
                }),
                TableReport::Failed {
                    table: "shop정산_2024-02".into(),
                    mode: LedgerMode::Settlements,
                    error: "read rejected".into(),
                },
            ],
            reports_dir: None,
            parquet_manifest: None,
        }
    }

    #[tokio::test]
    async fn writes_summary_brief_and_hashed_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut summary = summary();
        let reports_dir = write_run_reports(dir.path(), &mut summary).await.unwrap();
        let manifest_path = PathBuf::from(summary.parquet_manifest.clone().unwrap());

        let brief = std::fs::read_to_string(reports_dir.join(BRIEF_FILE)).unwrap();
        assert!(brief.contains("shop_2024-02: +2"));
        assert!(brief.contains("FAILED"));

        let manifest: ParquetManifest =
            serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();
        let entry = &manifest.files[0];
        let bytes = std::fs::read(reports_dir.join(&entry.path)).unwrap();
        assert_eq!(entry.bytes, bytes.len() as u64);
        assert_eq!(entry.sha256, hex::encode(Sha256::digest(&bytes)));

        let round: RunSummary =
            serde_json::from_slice(&std::fs::read(reports_dir.join(SUMMARY_FILE)).unwrap()).unwrap();
        assert_eq!(round, summary);

        let digest = report_recent_runs(5, dir.path()).unwrap();
        assert!(digest.contains(&summary.run_id.to_string()));
        assert!(digest.contains("1 reconciled, 1 written, 1 failed"));
    }
}
