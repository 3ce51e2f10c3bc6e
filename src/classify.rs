//! Failure classification from unstructured stderr
//!
//! Best-effort, single-pass heuristic over diagnostic text in the shape of a
//! Python traceback. It does not parse a traceback grammar: stderr that never
//! mentions an `Error:` line (an uncaught assertion, a plain printed message)
//! classifies as unknown and the controller treats that as terminal.

use regex::Regex;
use std::sync::OnceLock;

/// Normalized view of a failed run's stderr. Absent fields mean the
/// corresponding piece could not be recovered from the text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassifiedFailure {
    pub error_kind: Option<String>,
    pub source_line: Option<usize>,
    pub message: Option<String>,
}

impl ClassifiedFailure {
    pub fn unclassified() -> Self {
        Self::default()
    }

    pub fn is_unclassified(&self) -> bool {
        self.error_kind.is_none() && self.source_line.is_none() && self.message.is_none()
    }

    /// One-line summary for traces and status output.
    pub fn summary(&self) -> String {
        match (&self.error_kind, &self.message) {
            (Some(kind), Some(msg)) => format!("{}: {}", kind, msg),
            (Some(kind), None) => kind.clone(),
            _ => "Unknown".to_string(),
        }
    }
}

fn line_number_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"File ".*", line (\d+)"#).expect("valid regex"))
}

/// Parse stderr into an (error kind, source line, message) triple.
///
/// Scans from the last line backward for the first line containing `Error:`
/// (the conventional tail of a traceback), splits it on the first colon, then
/// walks the preceding lines backward for the nearest `File "...", line N`.
pub fn classify(stderr: &str) -> ClassifiedFailure {
    if stderr.trim().is_empty() {
        return ClassifiedFailure::unclassified();
    }

    let lines: Vec<&str> = stderr.trim().lines().collect();

    for (back_idx, line) in lines.iter().rev().enumerate() {
        if !line.contains("Error:") {
            continue;
        }
        let Some((kind, message)) = line.split_once(':') else {
            continue;
        };

        let error_idx = lines.len() - 1 - back_idx;
        let source_line = lines[..error_idx].iter().rev().find_map(|prev| {
            line_number_pattern()
                .captures(prev)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse::<usize>().ok())
        });

        return ClassifiedFailure {
            error_kind: Some(kind.trim().to_string()),
            source_line,
            message: Some(message.trim().to_string()),
        };
    }

    ClassifiedFailure::unclassified()
}
