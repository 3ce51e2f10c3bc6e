//! The persisted debug report
//!
//! One run produces exactly one `DebugReport`, written wholesale to a JSON
//! file the display collaborator reads. The builder is exclusively owned by
//! the controller for the run's lifetime and exposes only append/set and
//! finalize operations; traces are never mutated after they are appended.
//!
//! Field names are part of the collaborator contract and must not change.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_REPORT_FILE: &str = "debug_report.json";

/// One record of a single iteration's attempted action and outcome.
#[derive(Debug, Clone, Serialize)]
pub struct RepairTrace {
    pub iteration: u32,
    pub error_type: String,
    pub strategy: String,
    pub patch: String,
    pub success: bool,
    pub status: String,
}

/// Present only when the optimization phase accepted a candidate.
#[derive(Debug, Clone, Serialize)]
pub struct OptimizationReport {
    pub original_complexity: Option<String>,
    pub optimized_complexity: Option<String>,
    pub changes_summary: Vec<String>,
    pub optimized_code: String,
}

#[derive(Serialize)]
struct DebugReport<'a> {
    timestamp: String,
    original_code: &'a str,
    repaired_code: &'a str,
    traces: &'a [RepairTrace],
    best_attempt: &'a str,
    failure_explanation: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    optimization_report: Option<&'a OptimizationReport>,
}

/// Accumulates the report across the run. Append-only; the full document is
/// serialized once by `finalize`.
pub struct ReportBuilder {
    path: PathBuf,
    original_code: String,
    repaired_code: String,
    traces: Vec<RepairTrace>,
    best_attempt: String,
    failure_explanation: String,
    optimization: Option<OptimizationReport>,
}

impl ReportBuilder {
    pub fn new(path: &Path, original_code: &str) -> Self {
        Self {
            path: path.to_path_buf(),
            original_code: original_code.to_string(),
            repaired_code: String::new(),
            traces: Vec::new(),
            best_attempt: String::new(),
            failure_explanation: String::new(),
            optimization: None,
        }
    }

    pub fn add_trace(&mut self, trace: RepairTrace) {
        self.traces.push(trace);
    }

    pub fn set_repaired_code(&mut self, code: &str) {
        self.repaired_code = code.to_string();
    }

    pub fn set_best_attempt(&mut self, code: &str, explanation: &str) {
        self.best_attempt = code.to_string();
        self.failure_explanation = explanation.to_string();
    }

    pub fn set_optimization(&mut self, report: OptimizationReport) {
        self.optimization = Some(report);
    }

    /// Serialize and write the report, consuming the builder. The file is
    /// overwritten wholesale; there are no append/merge semantics across runs.
    pub fn finalize(self) -> Result<PathBuf> {
        let report = DebugReport {
            timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            original_code: &self.original_code,
            repaired_code: &self.repaired_code,
            traces: &self.traces,
            best_attempt: &self.best_attempt,
            failure_explanation: &self.failure_explanation,
            optimization_report: self.optimization.as_ref(),
        };

        let content = serde_json::to_string_pretty(&report).context("serializing debug report")?;
        fs::write(&self.path, content)
            .with_context(|| format!("writing debug report to {}", self.path.display()))?;
        Ok(self.path)
    }
}
