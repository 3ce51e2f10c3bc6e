//! Patch generation: layered heuristics, then model-assisted rewrites
//!
//! Strategies are tried in a fixed order and the first match wins. The
//! heuristics are fixed, non-learned rules that never change program logic
//! beyond what is needed to keep execution moving; everything else falls
//! through to the remote model. Every proposal is a complete replacement
//! program, never a diff.

use crate::classify::ClassifiedFailure;
use crate::extract::{extract_code_block, extract_json_object, fix_json_issues};
use crate::ollama::Inference;
use crate::report::OptimizationReport;
use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;

pub const RECURSION_PREAMBLE: &str = "import sys\nsys.setrecursionlimit(5000)\n";

/// A complete candidate replacement for the program, with a human-readable
/// label for the strategy that produced it.
#[derive(Debug, Clone)]
pub struct PatchProposal {
    pub new_code: String,
    pub strategy: String,
}

pub struct PatchEngine<C> {
    client: C,
    model_label: String,
}

impl<C: Inference> PatchEngine<C> {
    pub fn new(client: C, model_label: &str) -> Self {
        Self {
            client,
            model_label: model_label.to_string(),
        }
    }

    /// Produce a full replacement program for a classified failure.
    ///
    /// Heuristics first, remote fallback last. `None` means no strategy could
    /// produce a usable proposal for this attempt; a remote transport failure
    /// is logged and reported the same way rather than retried here.
    pub async fn generate(&self, code: &str, failure: &ClassifiedFailure) -> Option<PatchProposal> {
        if let Some(proposal) = apply_heuristics(code, failure) {
            return Some(proposal);
        }

        eprintln!(
            "  Heuristics did not apply. Asking the model ({})...",
            self.model_label
        );
        match self.client.complete(&debug_prompt(code, failure)).await {
            Ok(response) => extract_code_block(&response).map(|new_code| PatchProposal {
                new_code,
                strategy: format!("Model ({})", self.model_label),
            }),
            Err(e) => {
                eprintln!("  Model call failed: {}", e);
                None
            }
        }
    }

    /// Rewrite code that runs cleanly but whose behavior the user says is
    /// wrong. Purely remote; no heuristic layer applies to logic bugs.
    pub async fn repair_logic(&self, code: &str, description: &str) -> Option<String> {
        match self.client.complete(&logic_prompt(code, description)).await {
            Ok(response) => extract_code_block(&response),
            Err(e) => {
                eprintln!("  Logic repair call failed: {}", e);
                None
            }
        }
    }

    /// Request an optimized rewrite plus complexity metadata as structured
    /// JSON. `None` if no valid structure is recoverable from the response.
    pub async fn optimize(&self, code: &str) -> Option<OptimizationReport> {
        let response = match self.client.complete_structured(&optimize_prompt(code)).await {
            Ok(response) => response,
            Err(e) => {
                eprintln!("  Optimization call failed: {}", e);
                return None;
            }
        };
        parse_optimization(&response)
    }
}

/// Ordered heuristic layer. Each entry is a predicate over the failure plus a
/// transform of the code; evaluation order is fixed and the first success
/// wins.
fn apply_heuristics(code: &str, failure: &ClassifiedFailure) -> Option<PatchProposal> {
    raise_recursion_limit(code, failure).or_else(|| define_missing_name(code, failure))
}

/// RecursionError: prepend a limit-raising preamble. Changes no program
/// logic, only an execution ceiling, and never applies twice.
fn raise_recursion_limit(code: &str, failure: &ClassifiedFailure) -> Option<PatchProposal> {
    if failure.error_kind.as_deref() != Some("RecursionError") {
        return None;
    }
    if code.contains("sys.setrecursionlimit") {
        return None;
    }
    Some(PatchProposal {
        new_code: format!("{}{}", RECURSION_PREAMBLE, code),
        strategy: "Heuristic: Increase Recursion Limit".to_string(),
    })
}

fn name_error_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"name '(.*)' is not defined").expect("valid regex"))
}

/// NameError: bind the missing name to None just above the failing line, at
/// that line's indentation. A defensive stub, not a real fix; it lets
/// execution proceed to either success or a more diagnosable failure.
fn define_missing_name(code: &str, failure: &ClassifiedFailure) -> Option<PatchProposal> {
    if failure.error_kind.as_deref() != Some("NameError") {
        return None;
    }
    let line_number = failure.source_line?;
    let message = failure.message.as_deref()?;
    let missing = name_error_pattern().captures(message)?.get(1)?.as_str();

    let mut lines: Vec<&str> = code.lines().collect();
    if line_number == 0 || line_number > lines.len() {
        return None;
    }
    let idx = line_number - 1;
    let failing = lines[idx];
    let indent = &failing[..failing.len() - failing.trim_start().len()];

    let stub = format!("{}{} = None", indent, missing);
    lines.insert(idx, &stub);
    Some(PatchProposal {
        new_code: lines.join("\n"),
        strategy: "Heuristic: Define Missing Var".to_string(),
    })
}

fn debug_prompt(code: &str, failure: &ClassifiedFailure) -> String {
    let location = match failure.source_line {
        Some(n) => format!("at line {}", n),
        None => "location unknown".to_string(),
    };
    format!(
        "You are a Python debugging assistant. Fix the following code to resolve the error.\n\
         Error: {} {}.\n\n\
         Code:\n```python\n{}\n```\n\n\
         Instructions:\n\
         1. Fix the error (e.g. infinite loop, invalid index, bad type).\n\
         2. Ensure the fix prevents the crash/timeout.\n\
         3. Return ONLY the full fixed code in a Python code block.\n",
        failure.summary(),
        location,
        code
    )
}

fn logic_prompt(code: &str, description: &str) -> String {
    format!(
        "You are a Python debugging assistant. The following code runs without \
         crashing, but its behavior is wrong.\n\n\
         Expected behavior (from the user): {}\n\n\
         Code:\n```python\n{}\n```\n\n\
         Instructions:\n\
         1. Rewrite the code so it matches the expected behavior.\n\
         2. Keep the program self-contained and runnable as-is.\n\
         3. Return ONLY the full rewritten code in a Python code block.\n",
        description, code
    )
}

fn optimize_prompt(code: &str) -> String {
    format!(
        "You are a Python performance expert. Optimize the following working \
         code without changing its observable output.\n\n\
         Code:\n```python\n{}\n```\n\n\
         Respond with a JSON object and nothing else, using exactly these keys:\n\
         {{\n\
           \"original_complexity\": \"e.g. O(n^2)\",\n\
           \"optimized_complexity\": \"e.g. O(n)\",\n\
           \"changes_summary\": [\"one line per change\"],\n\
           \"optimized_code\": \"the full optimized program\"\n\
         }}\n",
        code
    )
}

#[derive(Deserialize)]
struct OptimizationJson {
    #[serde(default)]
    original_complexity: Option<String>,
    #[serde(default)]
    optimized_complexity: Option<String>,
    #[serde(default)]
    changes_summary: Vec<String>,
    optimized_code: String,
}

/// Parse a structured optimization response: direct JSON first, then an
/// embedded object within surrounding text.
fn parse_optimization(response: &str) -> Option<OptimizationReport> {
    let direct: Option<OptimizationJson> = serde_json::from_str(response).ok();
    let parsed = match direct {
        Some(parsed) => parsed,
        None => {
            let fragment = extract_json_object(response)?;
            serde_json::from_str(&fix_json_issues(fragment)).ok()?
        }
    };

    if parsed.optimized_code.trim().is_empty() {
        return None;
    }

    Some(OptimizationReport {
        original_complexity: parsed.original_complexity,
        optimized_complexity: parsed.optimized_complexity,
        changes_summary: parsed.changes_summary,
        optimized_code: parsed.optimized_code,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify;

    fn recursion_failure() -> ClassifiedFailure {
        ClassifiedFailure {
            error_kind: Some("RecursionError".to_string()),
            source_line: None,
            message: Some("maximum recursion depth exceeded".to_string()),
        }
    }

    #[test]
    fn test_recursion_heuristic_prepends_preamble() {
        let code = "def f(n):\n    return f(n + 1)\nf(0)";
        let proposal = apply_heuristics(code, &recursion_failure()).unwrap();
        assert!(proposal.new_code.starts_with(RECURSION_PREAMBLE));
        assert!(proposal.new_code.ends_with(code));
        assert_eq!(proposal.strategy, "Heuristic: Increase Recursion Limit");
    }

    #[test]
    fn test_recursion_heuristic_never_applies_twice() {
        let code = format!("{}def f(n):\n    return f(n + 1)\nf(0)", RECURSION_PREAMBLE);
        assert!(apply_heuristics(&code, &recursion_failure()).is_none());
    }

    #[test]
    fn test_name_heuristic_inserts_stub_at_indentation() {
        let code = "def run():\n    print(total)\nrun()";
        let failure = ClassifiedFailure {
            error_kind: Some("NameError".to_string()),
            source_line: Some(2),
            message: Some("name 'total' is not defined".to_string()),
        };
        let proposal = apply_heuristics(code, &failure).unwrap();
        assert_eq!(
            proposal.new_code,
            "def run():\n    total = None\n    print(total)\nrun()"
        );
        assert_eq!(proposal.strategy, "Heuristic: Define Missing Var");
    }

    #[test]
    fn test_name_heuristic_requires_in_range_line() {
        let failure = ClassifiedFailure {
            error_kind: Some("NameError".to_string()),
            source_line: Some(99),
            message: Some("name 'x' is not defined".to_string()),
        };
        assert!(apply_heuristics("print(x)", &failure).is_none());
    }

    #[test]
    fn test_heuristics_skip_unrelated_errors() {
        let failure = classify("IndexError: list index out of range");
        assert!(apply_heuristics("print(items[5])", &failure).is_none());
    }

    #[test]
    fn test_parse_optimization_direct_json() {
        let response = r#"{
            "original_complexity": "O(n^2)",
            "optimized_complexity": "O(n)",
            "changes_summary": ["replaced nested loop with a set"],
            "optimized_code": "print(sorted(set(xs)))"
        }"#;
        let report = parse_optimization(response).unwrap();
        assert_eq!(report.original_complexity.as_deref(), Some("O(n^2)"));
        assert_eq!(report.optimized_complexity.as_deref(), Some("O(n)"));
        assert_eq!(report.changes_summary.len(), 1);
        assert_eq!(report.optimized_code, "print(sorted(set(xs)))");
    }

    #[test]
    fn test_parse_optimization_embedded_json() {
        let response = "Here is the analysis:\n```json\n{\"optimized_code\": \"print(1)\", \"changes_summary\": []}\n```";
        let report = parse_optimization(response).unwrap();
        assert_eq!(report.optimized_code, "print(1)");
        assert_eq!(report.original_complexity, None);
    }

    #[test]
    fn test_parse_optimization_rejects_garbage() {
        assert!(parse_optimization("not json at all").is_none());
        assert!(parse_optimization(r#"{"optimized_code": "  "}"#).is_none());
    }

    #[test]
    fn test_debug_prompt_embeds_error_and_code() {
        let failure = classify(
            "  File \"bug.py\", line 3, in <module>\nIndexError: list index out of range",
        );
        let prompt = debug_prompt("print(items[5])", &failure);
        assert!(prompt.contains("IndexError: list index out of range"));
        assert!(prompt.contains("at line 3"));
        assert!(prompt.contains("print(items[5])"));
    }
}
