use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use rust_xlsxwriter::{Workbook, Worksheet};

use crate::rating_store::{RunRecord, TeamRating};
use crate::stage_stats::StageStats;

pub struct ExportReport {
    pub ratings: usize,
    pub stages: usize,
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Xlsx,
    Csv,
}

impl ExportFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("xlsx") => Ok(ExportFormat::Xlsx),
            Some("csv") => Ok(ExportFormat::Csv),
            _ => bail!("unsupported export extension for {} (use .xlsx or .csv)", path.display()),
        }
    }
}

const RATING_HEADER: [&str; 8] = [
    "rank",
    "team_id",
    "power_rating",
    "offense_rating",
    "defense_rating",
    "confidence",
    "data_source",
    "shrinkage_factor",
];

/// Ratings (ranked by power) and stage snapshots for one season/model version.
/// CSV output writes the stage table to a `<stem>_stages.csv` sibling.
pub fn export_audit(
    path: &Path,
    ratings: &[TeamRating],
    stages: &[StageStats],
    run: Option<&RunRecord>,
) -> Result<ExportReport> {
    let rating_rows = rating_rows(ratings);
    let stage_rows = stage_rows(stages);
    let files = match ExportFormat::from_path(path)? {
        ExportFormat::Xlsx => {
            let mut workbook = Workbook::new();
            {
                let sheet = workbook.add_worksheet();
                sheet.set_name("Ratings")?;
                write_rows(sheet, &rating_rows)?;
            }
            {
                let sheet = workbook.add_worksheet();
                sheet.set_name("StageStats")?;
                write_rows(sheet, &stage_rows)?;
            }
            if let Some(run) = run {
                let sheet = workbook.add_worksheet();
                sheet.set_name("Run")?;
                write_rows(sheet, &run_rows(run))?;
            }
            workbook
                .save(path)
                .with_context(|| format!("failed writing workbook to {}", path.display()))?;
            vec![path.to_path_buf()]
        }
        ExportFormat::Csv => {
            let stages_path = sibling(path, "stages");
            write_csv(path, &rating_rows)?;
            write_csv(&stages_path, &stage_rows)?;
            vec![path.to_path_buf(), stages_path]
        }
    };
    Ok(ExportReport {
        ratings: rating_rows.len().saturating_sub(1),
        stages: stage_rows.len().saturating_sub(1),
        files,
    })
}

fn rating_rows(ratings: &[TeamRating]) -> Vec<Vec<String>> {
    let mut ranked: Vec<&TeamRating> = ratings.iter().collect();
    ranked.sort_by(|a, b| {
        b.power_rating
            .partial_cmp(&a.power_rating)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.team_id.cmp(&b.team_id))
    });
    let mut rows = vec![RATING_HEADER.iter().map(|s| s.to_string()).collect()];
    rows.extend(ranked.iter().enumerate().map(|(idx, r)| {
        vec![
            (idx + 1).to_string(),
            r.team_id.to_string(),
            format!("{:.4}", r.power_rating),
            format!("{:.4}", r.offense_rating),
            format!("{:.4}", r.defense_rating),
            format!("{:.3}", r.confidence),
            r.data_source.as_str().to_string(),
            format!("{:.3}", r.shrinkage_factor),
        ]
    }));
    rows
}

fn stage_rows(stages: &[StageStats]) -> Vec<Vec<String>> {
    let mut rows = vec![StageStats::HEADER.iter().map(|s| s.to_string()).collect()];
    rows.extend(stages.iter().map(StageStats::row));
    rows
}

fn run_rows(run: &RunRecord) -> Vec<Vec<String>> {
    vec![
        vec!["run_id".into(), run.run_id.to_string()],
        vec!["season".into(), run.season.to_string()],
        vec!["model_version".into(), run.model_version.clone()],
        vec!["started_at".into(), run.started_at.clone()],
        vec!["finished_at".into(), run.finished_at.clone().unwrap_or_default()],
        vec!["status".into(), run.status.as_str().to_string()],
        vec!["failure_reason".into(), run.failure_reason.clone().unwrap_or_default()],
        vec!["upsert_failures".into(), run.upsert_failures.to_string()],
    ]
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("export");
    path.with_file_name(format!("{stem}_{suffix}.csv"))
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn write_csv(path: &Path, rows: &[Vec<String>]) -> Result<()> {
    let file = std::fs::File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut out = std::io::BufWriter::new(file);
    for row in rows {
        let line: Vec<String> = row.iter().map(|v| csv_field(v)).collect();
        writeln!(out, "{}", line.join(",")).with_context(|| format!("write {}", path.display()))?;
    }
    out.flush().with_context(|| format!("flush {}", path.display()))?;
    Ok(())
}

fn write_rows(worksheet: &mut Worksheet, rows: &[Vec<String>]) -> Result<()> {
    for (row_idx, row) in rows.iter().enumerate() {
        for (col_idx, value) in row.iter().enumerate() {
            worksheet
                .write_string(row_idx as u32, col_idx as u16, value)
                .with_context(|| format!("write cell ({row_idx},{col_idx})"))?;
        }
    }
    Ok(())
}
