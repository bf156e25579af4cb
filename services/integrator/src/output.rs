//! Integrated dataset and report writers.
//!
//! Every file is written to a temporary file in the destination directory and
//! then renamed over the final name, so a failure mid-write never leaves a
//! partial file behind. File names carry the level and the year, which keeps
//! concurrently running levels from colliding.

use std::fmt::Write as _;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Level;
use crate::integrate::{IntegratedDataset, IntegrationReport};
use crate::table::Table;

pub fn dataset_file_name(level: Level, year: i32) -> String {
    format!("dados_integrados_{}_{}.csv", level.file_label(), year)
}

pub fn report_file_name(level: Level, year: i32) -> String {
    format!("relatorio_{}_{}.json", level.file_label(), year)
}

pub fn summary_file_name(year: i32) -> String {
    format!("relatorio_integracao_{}.json", year)
}

/// Write `path`'s content into a temporary sibling file, not yet in place.
fn stage<F>(path: &Path, write: F) -> Result<NamedTempFile>
where
    F: FnOnce(&mut NamedTempFile) -> Result<()>,
{
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory {}", dir.display()))?;

    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temporary file in {}", dir.display()))?;
    write(&mut tmp)?;
    tmp.as_file().sync_all()?;
    Ok(tmp)
}

fn persist(tmp: NamedTempFile, path: &Path) -> Result<()> {
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to move output into place at {}", path.display()))?;
    Ok(())
}

fn stage_table_csv(path: &Path, table: &Table) -> Result<NamedTempFile> {
    stage(path, |tmp| {
        let mut writer = csv::Writer::from_writer(tmp);
        writer.write_record(table.columns())?;
        for row in table.rows() {
            writer.write_record(row.iter().map(|v| v.to_string()))?;
        }
        writer.flush()?;
        Ok(())
    })
}

fn stage_json<T: Serialize>(path: &Path, value: &T) -> Result<NamedTempFile> {
    stage(path, |tmp| {
        serde_json::to_writer_pretty(&mut *tmp, value)?;
        tmp.write_all(b"\n")?;
        Ok(())
    })
}

/// Comma-separated UTF-8 with a header row; nulls are empty fields.
pub fn write_table_csv(path: &Path, table: &Table) -> Result<()> {
    persist(stage_table_csv(path, table)?, path)
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    persist(stage_json(path, value)?, path)
}

/// Per-level diagnostic report as written next to the dataset.
#[derive(Debug, Serialize)]
pub struct LevelReport<'a> {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub dataset_file: String,
    pub rows: usize,
    pub columns: &'a [String],
    pub integration: &'a IntegrationReport,
}

#[derive(Debug, Clone)]
pub struct WrittenDataset {
    pub data_path: PathBuf,
    pub report_path: PathBuf,
}

/// Write the dataset CSV and its JSON report into `dir`, both or neither.
pub fn write_dataset(dir: &Path, dataset: &IntegratedDataset, run_id: Uuid) -> Result<WrittenDataset> {
    let data_path = dir.join(dataset_file_name(dataset.level, dataset.year));
    let report_path = dir.join(report_file_name(dataset.level, dataset.year));

    let report = LevelReport {
        run_id,
        generated_at: Utc::now(),
        dataset_file: data_path.display().to_string(),
        rows: dataset.table.len(),
        columns: dataset.table.columns(),
        integration: &dataset.report,
    };
    // Both files are staged before either lands; a level whose report cannot
    // be placed keeps no dataset file either.
    let data_tmp = stage_table_csv(&data_path, &dataset.table)?;
    let report_tmp = stage_json(&report_path, &report)?;
    persist(data_tmp, &data_path)?;
    if let Err(e) = persist(report_tmp, &report_path) {
        if let Err(cleanup) = fs::remove_file(&data_path) {
            warn!(path = %data_path.display(), error = %cleanup, "failed to remove orphaned dataset");
        }
        return Err(e);
    }

    info!(
        level = %dataset.level,
        year = dataset.year,
        path = %data_path.display(),
        rows = dataset.table.len(),
        "integrated dataset written"
    );
    Ok(WrittenDataset {
        data_path,
        report_path,
    })
}

// =============================================================================
// RUN SUMMARY
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct LevelSuccess {
    pub level: Level,
    pub rows: usize,
    pub columns: usize,
    pub data_file: String,
    pub skipped_sources: Vec<String>,
    pub warnings: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LevelFailure {
    pub level: Level,
    pub reason: String,
}

/// End-of-run summary: which levels succeeded and which failed, and why.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub year: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub succeeded: Vec<LevelSuccess>,
    pub failed: Vec<LevelFailure>,
}

impl RunSummary {
    pub fn new(year: i32) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            year,
            started_at: Utc::now(),
            finished_at: None,
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn record_success(&mut self, dataset: &IntegratedDataset, written: &WrittenDataset) {
        self.succeeded.push(LevelSuccess {
            level: dataset.level,
            rows: dataset.table.len(),
            columns: dataset.table.width(),
            data_file: written.data_path.display().to_string(),
            skipped_sources: dataset
                .report
                .skipped
                .iter()
                .map(|s| s.source.clone())
                .collect(),
            warnings: dataset.report.diagnostics.warnings.len(),
        });
    }

    pub fn record_failure(&mut self, level: Level, reason: impl Into<String>) {
        self.failed.push(LevelFailure {
            level,
            reason: reason.into(),
        });
    }

    pub fn finish(&mut self) {
        self.succeeded.sort_by_key(|s| s.level);
        self.failed.sort_by_key(|f| f.level);
        self.finished_at = Some(Utc::now());
    }

    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }

    /// Human-readable summary printed at the end of a run.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Integration {} ({})", self.year, self.run_id);
        for s in &self.succeeded {
            let _ = writeln!(
                out,
                "  [ok]     {:<12} {} rows x {} columns -> {}",
                s.level.to_string(),
                s.rows,
                s.columns,
                s.data_file
            );
            if !s.skipped_sources.is_empty() {
                let _ = writeln!(out, "           skipped: {}", s.skipped_sources.join(", "));
            }
        }
        for f in &self.failed {
            let _ = writeln!(out, "  [failed] {:<12} {}", f.level.to_string(), f.reason);
        }
        out
    }
}

pub fn write_summary(dir: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let path = dir.join(summary_file_name(summary.year));
    write_json(&path, summary)?;
    Ok(path)
}
