//! The repair controller
//!
//! Owns the iteration budget and drives the sandbox/classifier/generator
//! loop, then a post-success optimization-or-logic-repair phase gated by
//! verification. All mutable state for a run (the evolving current code and
//! the append-only trace) lives here; every terminal path persists the
//! debug report exactly once.

use crate::classify::{classify, ClassifiedFailure};
use crate::ollama::Inference;
use crate::patch::PatchEngine;
use crate::report::{RepairTrace, ReportBuilder};
use crate::sandbox::Sandbox;
use crate::util::ellipsize;
use crate::verify::verify_equivalence;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_MAX_ITERATIONS: u32 = 3;

const STATUS_PREVIEW_CHARS: usize = 120;

/// Where a run ended up.
#[derive(Debug)]
pub struct RunOutcome {
    pub repaired: bool,
    pub final_code: String,
    pub report_path: PathBuf,
}

enum Phase {
    Running(u32),
    Succeeded {
        code: String,
        via_final_run: bool,
        // Iteration number for any post-success trace entry, so the report
        // keeps counting past the loop's own entries.
        next_iteration: u32,
    },
    Exhausted {
        code: String,
        explanation: String,
    },
}

pub struct RepairController<C> {
    sandbox: Sandbox,
    engine: PatchEngine<C>,
    script_path: PathBuf,
    max_iterations: u32,
    description: Option<String>,
    report_path: PathBuf,
}

impl<C: Inference> RepairController<C> {
    pub fn new(
        sandbox: Sandbox,
        engine: PatchEngine<C>,
        script_path: &Path,
        max_iterations: u32,
        description: Option<String>,
        report_path: &Path,
    ) -> Self {
        Self {
            sandbox,
            engine,
            script_path: script_path.to_path_buf(),
            max_iterations: max_iterations.max(1),
            description,
            report_path: report_path.to_path_buf(),
        }
    }

    /// Drive one full repair run over `original_code`.
    ///
    /// Always persists a debug report before returning, success or not.
    pub async fn run(self, original_code: &str) -> Result<RunOutcome> {
        let mut report = ReportBuilder::new(&self.report_path, original_code);
        let mut current = original_code.to_string();
        let mut phase = Phase::Running(1);

        loop {
            phase = match phase {
                Phase::Running(i) if i > self.max_iterations => {
                    self.final_verification(&current, &mut report)
                }
                Phase::Running(i) => self.iterate(i, &mut current, &mut report).await,
                terminal => break self.finish(terminal, report).await,
            };
        }
    }

    /// One observe-patch step of the loop.
    async fn iterate(&self, iteration: u32, current: &mut String, report: &mut ReportBuilder) -> Phase {
        eprintln!("\n  --- Iteration {} ---", iteration);
        let result = self.sandbox.run(current);

        if result.success() {
            eprintln!("  + Code executed without errors.");
            report.add_trace(RepairTrace {
                iteration,
                error_type: "None".to_string(),
                strategy: "Code ran successfully".to_string(),
                patch: "None".to_string(),
                success: true,
                status: "Success".to_string(),
            });
            return Phase::Succeeded {
                code: current.clone(),
                via_final_run: false,
                next_iteration: iteration + 1,
            };
        }

        eprintln!("  Error detected (exit status {})", result.exit_status);

        // A timed-out child leaves no traceback worth parsing; synthesize the
        // classification instead of invoking the classifier.
        let failure = if result.timed_out {
            eprintln!("  Execution timed out.");
            ClassifiedFailure {
                error_kind: Some("TimeoutError".to_string()),
                source_line: None,
                message: Some("Execution timed out (possible infinite loop)".to_string()),
            }
        } else {
            classify(&result.stderr)
        };

        if failure.is_unclassified() {
            eprintln!("  Could not analyze error type from stderr.");
            report.add_trace(RepairTrace {
                iteration,
                error_type: "Unknown".to_string(),
                strategy: "Could not parse stderr".to_string(),
                patch: "None".to_string(),
                success: false,
                status: "Unparsable".to_string(),
            });
            return Phase::Exhausted {
                code: current.clone(),
                explanation: "Could not classify the failure from stderr".to_string(),
            };
        }

        eprintln!(
            "  Analyzed: {} (line {:?})",
            failure.summary(),
            failure.source_line
        );

        let Some(proposal) = self.engine.generate(current, &failure).await else {
            eprintln!("  No patch generated.");
            report.add_trace(RepairTrace {
                iteration,
                error_type: failure.summary(),
                strategy: "No patch strategy found".to_string(),
                patch: "None".to_string(),
                success: false,
                status: "No patch".to_string(),
            });
            return Phase::Exhausted {
                code: current.clone(),
                explanation: format!("No patch could be generated for: {}", failure.summary()),
            };
        };

        eprintln!(
            "  Applying patch via {}: {}",
            proposal.strategy,
            ellipsize(&proposal.new_code.replace('\n', " "), STATUS_PREVIEW_CHARS)
        );
        report.add_trace(RepairTrace {
            iteration,
            error_type: failure.summary(),
            strategy: proposal.strategy.clone(),
            patch: proposal.new_code.clone(),
            success: false,
            status: "Attempted".to_string(),
        });

        *current = proposal.new_code;
        Phase::Running(iteration + 1)
    }

    /// The budget is spent; one uncounted run decides between success and
    /// exhaustion.
    fn final_verification(&self, current: &str, report: &mut ReportBuilder) -> Phase {
        eprintln!("\n  Max iterations reached. Running final verification...");
        let result = self.sandbox.run(current);

        if result.success() {
            eprintln!("  + Final patch worked.");
            report.add_trace(RepairTrace {
                iteration: self.max_iterations + 1,
                error_type: "None".to_string(),
                strategy: "Final verification run".to_string(),
                patch: "None".to_string(),
                success: true,
                status: "Success (Final)".to_string(),
            });
            return Phase::Succeeded {
                code: current.to_string(),
                via_final_run: true,
                next_iteration: self.max_iterations + 2,
            };
        }

        eprintln!("  Final run failed (exit status {}).", result.exit_status);
        report.add_trace(RepairTrace {
            iteration: self.max_iterations + 1,
            error_type: classify(&result.stderr).summary(),
            strategy: "Final verification run".to_string(),
            patch: "None".to_string(),
            success: false,
            status: "Failed (Final)".to_string(),
        });
        Phase::Exhausted {
            code: current.to_string(),
            explanation: "Max iterations reached & final run failed".to_string(),
        }
    }

    async fn finish(self, phase: Phase, mut report: ReportBuilder) -> Result<RunOutcome> {
        match phase {
            Phase::Succeeded {
                code,
                via_final_run,
                next_iteration,
            } => {
                let final_code = self.post_success(&code, next_iteration, &mut report).await;
                let explanation = if via_final_run { "Success (Final)" } else { "Success" };

                report.set_repaired_code(&final_code);
                report.set_best_attempt(&final_code, explanation);
                let report_path = report.finalize()?;
                eprintln!("  Debug report saved to {}", report_path.display());

                if let Err(e) = self.save_fixed_code(&final_code) {
                    eprintln!("  Warning: failed to save fixed code: {}", e);
                }

                Ok(RunOutcome {
                    repaired: true,
                    final_code,
                    report_path,
                })
            }
            Phase::Exhausted { code, explanation } => {
                eprintln!("  Giving up: {}", explanation);
                report.set_best_attempt(&code, &explanation);
                let report_path = report.finalize()?;
                eprintln!("  Debug report saved to {}", report_path.display());

                Ok(RunOutcome {
                    repaired: false,
                    final_code: code,
                    report_path,
                })
            }
            Phase::Running(_) => unreachable!("loop only exits on terminal phases"),
        }
    }

    /// After a successful run: logic repair when the user described the
    /// intended behavior, otherwise an optimization attempt. Either way the
    /// pre-phase code is the safe fallback and a rejection is never fatal.
    async fn post_success(
        &self,
        success_code: &str,
        iteration: u32,
        report: &mut ReportBuilder,
    ) -> String {
        match &self.description {
            Some(description) => {
                self.try_logic_repair(success_code, description, iteration, report)
                    .await
            }
            None => self.try_optimize(success_code, iteration, report).await,
        }
    }

    async fn try_logic_repair(
        &self,
        success_code: &str,
        description: &str,
        iteration: u32,
        report: &mut ReportBuilder,
    ) -> String {
        eprintln!("\n  Attempting logic repair from the user's description...");
        let Some(candidate) = self.engine.repair_logic(success_code, description).await else {
            eprintln!("  No rewrite produced; keeping the verified code.");
            return success_code.to_string();
        };

        // The premise of a logic repair is that the old output was itself
        // wrong, so the gate is a rerun of the candidate, not a comparison
        // against the pre-repair baseline.
        let trial = self.sandbox.run(&candidate);
        if trial.success() {
            eprintln!("  + Logic repair accepted.");
            report.add_trace(logic_repair_trace(iteration, true, &candidate, "Accepted"));
            candidate
        } else {
            eprintln!("  Logic repair rejected: candidate failed to run.");
            report.add_trace(logic_repair_trace(
                iteration,
                false,
                &candidate,
                &format!(
                    "Rejected: candidate failed (exit {}): {}",
                    trial.exit_status,
                    ellipsize(&trial.stderr, 400)
                ),
            ));
            success_code.to_string()
        }
    }

    async fn try_optimize(
        &self,
        success_code: &str,
        iteration: u32,
        report: &mut ReportBuilder,
    ) -> String {
        eprintln!("\n  Attempting optimization...");
        let Some(optimization) = self.engine.optimize(success_code).await else {
            eprintln!("  No valid optimization response; keeping the verified code.");
            return success_code.to_string();
        };

        let verdict = verify_equivalence(&self.sandbox, success_code, &optimization.optimized_code);
        if verdict.accepted {
            eprintln!("  + Optimization accepted.");
            let optimized = optimization.optimized_code.clone();
            report.add_trace(optimization_trace(iteration, true, &optimized, "Accepted"));
            report.set_optimization(optimization);
            optimized
        } else {
            eprintln!("  Optimization rejected: {}", ellipsize(&verdict.reason, 200));
            report.add_trace(optimization_trace(
                iteration,
                false,
                &optimization.optimized_code,
                &format!("Rejected: {}", verdict.reason),
            ));
            success_code.to_string()
        }
    }

    /// Convenience export of the final code, derived from the input's base
    /// name. Not part of the control flow; failures here only warn.
    fn save_fixed_code(&self, code: &str) -> Result<PathBuf> {
        let fixed_dir = self
            .script_path
            .parent()
            .map(|p| p.join("fixed"))
            .unwrap_or_else(|| PathBuf::from("fixed"));
        fs::create_dir_all(&fixed_dir).context("creating fixed/ directory")?;

        let stem = self
            .script_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("script");
        let ext = self
            .script_path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("py");
        let path = fixed_dir.join(format!("{}_fixed.{}", stem, ext));

        fs::write(&path, code).with_context(|| format!("writing {}", path.display()))?;
        eprintln!("  + Fixed code saved to {}", path.display());
        Ok(path)
    }
}

fn logic_repair_trace(iteration: u32, success: bool, patch: &str, status: &str) -> RepairTrace {
    RepairTrace {
        iteration,
        error_type: "Logic Repair".to_string(),
        strategy: "Model logic repair".to_string(),
        patch: patch.to_string(),
        success,
        status: status.to_string(),
    }
}

fn optimization_trace(iteration: u32, success: bool, patch: &str, status: &str) -> RepairTrace {
    RepairTrace {
        iteration,
        error_type: "Optimization".to_string(),
        strategy: "Model optimization".to_string(),
        patch: patch.to_string(),
        success,
        status: status.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Scripted inference stub: each call pops the next canned response.
    /// An exhausted queue behaves like an unreachable service.
    struct StubInference {
        completions: Mutex<VecDeque<anyhow::Result<String>>>,
        structured: Mutex<VecDeque<anyhow::Result<String>>>,
    }

    impl StubInference {
        fn unreachable_service() -> Self {
            Self {
                completions: Mutex::new(VecDeque::new()),
                structured: Mutex::new(VecDeque::new()),
            }
        }

        fn with_completions(responses: Vec<anyhow::Result<String>>) -> Self {
            Self {
                completions: Mutex::new(responses.into()),
                structured: Mutex::new(VecDeque::new()),
            }
        }

        fn with_structured(responses: Vec<anyhow::Result<String>>) -> Self {
            Self {
                completions: Mutex::new(VecDeque::new()),
                structured: Mutex::new(responses.into()),
            }
        }
    }

    impl Inference for StubInference {
        async fn complete(&self, _prompt: &str) -> anyhow::Result<String> {
            self.completions
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(anyhow!("connection refused")))
        }

        async fn complete_structured(&self, _prompt: &str) -> anyhow::Result<String> {
            self.structured
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(anyhow!("connection refused")))
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        script_path: PathBuf,
        report_path: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let script_path = dir.path().join("bug.py");
        let report_path = dir.path().join("debug_report.json");
        fs::write(&script_path, "placeholder").unwrap();
        Fixture {
            script_path,
            report_path,
            _dir: dir,
        }
    }

    fn controller(
        fx: &Fixture,
        client: StubInference,
        iterations: u32,
        description: Option<String>,
        timeout_ms: u64,
    ) -> RepairController<StubInference> {
        let sandbox =
            Sandbox::new(Duration::from_millis(timeout_ms)).with_interpreter("sh", ".sh");
        RepairController::new(
            sandbox,
            PatchEngine::new(client, "stub"),
            &fx.script_path,
            iterations,
            description,
            &fx.report_path,
        )
    }

    fn report_json(fx: &Fixture) -> serde_json::Value {
        serde_json::from_str(&fs::read_to_string(&fx.report_path).unwrap()).unwrap()
    }

    /// stderr in the shape the classifier expects, emitted from a shell
    /// script so the tests run without a Python toolchain.
    const INDEX_ERROR_SCRIPT: &str = concat!(
        "echo 'Traceback (most recent call last):' >&2\n",
        "echo '  File \"bug.py\", line 7, in <module>' >&2\n",
        "echo 'IndexError: list index out of range' >&2\n",
        "exit 1\n",
    );

    #[tokio::test]
    async fn test_clean_program_succeeds_in_one_iteration() {
        let fx = fixture();
        let outcome = controller(&fx, StubInference::unreachable_service(), 3, None, 5_000)
            .run("echo already fine")
            .await
            .unwrap();

        assert!(outcome.repaired);
        assert_eq!(outcome.final_code, "echo already fine");

        let json = report_json(&fx);
        let traces = json["traces"].as_array().unwrap();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0]["status"], "Success");
        assert_eq!(json["failure_explanation"], "Success");
        assert_eq!(json["repaired_code"], "echo already fine");
    }

    #[tokio::test]
    async fn test_model_patch_repairs_within_budget() {
        let fx = fixture();
        let client = StubInference::with_completions(vec![Ok(
            "Here is the fix:\n```\necho repaired\n```".to_string(),
        )]);
        let outcome = controller(&fx, client, 3, None, 5_000)
            .run(INDEX_ERROR_SCRIPT)
            .await
            .unwrap();

        assert!(outcome.repaired);
        assert_eq!(outcome.final_code, "echo repaired");
        assert_ne!(outcome.final_code, INDEX_ERROR_SCRIPT);

        let json = report_json(&fx);
        let traces = json["traces"].as_array().unwrap();
        assert_eq!(traces.len(), 2);
        assert_eq!(
            traces[0]["error_type"],
            "IndexError: list index out of range"
        );
        assert_eq!(traces[0]["status"], "Attempted");
        assert_eq!(traces[1]["status"], "Success");
    }

    #[tokio::test]
    async fn test_timeout_synthesizes_timeout_error() {
        let fx = fixture();
        let client =
            StubInference::with_completions(vec![Ok("```\necho no more spin\n```".to_string())]);
        let outcome = controller(&fx, client, 3, None, 300)
            .run("sleep 10")
            .await
            .unwrap();

        assert!(outcome.repaired);
        let json = report_json(&fx);
        let traces = json["traces"].as_array().unwrap();
        assert!(traces[0]["error_type"]
            .as_str()
            .unwrap()
            .starts_with("TimeoutError"));
    }

    #[tokio::test]
    async fn test_unparsable_stderr_ends_the_run() {
        let fx = fixture();
        let code = "echo 'something broke but not in traceback shape' >&2\nexit 1";
        let outcome = controller(&fx, StubInference::unreachable_service(), 3, None, 5_000)
            .run(code)
            .await
            .unwrap();

        assert!(!outcome.repaired);
        assert_eq!(outcome.final_code, code);

        let json = report_json(&fx);
        let traces = json["traces"].as_array().unwrap();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0]["status"], "Unparsable");
        assert_eq!(json["best_attempt"], code);
        assert_eq!(json["repaired_code"], "");
    }

    #[tokio::test]
    async fn test_generation_failure_ends_the_run() {
        let fx = fixture();
        let outcome = controller(&fx, StubInference::unreachable_service(), 3, None, 5_000)
            .run(INDEX_ERROR_SCRIPT)
            .await
            .unwrap();

        assert!(!outcome.repaired);
        let json = report_json(&fx);
        let traces = json["traces"].as_array().unwrap();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0]["status"], "No patch");
        assert_eq!(traces[0]["strategy"], "No patch strategy found");
    }

    #[tokio::test]
    async fn test_final_verification_rescues_last_patch() {
        // Budget of 1: the patch is adopted in iteration 1 and only the
        // uncounted final verification run can prove it works.
        let fx = fixture();
        let client = StubInference::with_completions(vec![Ok("```\necho rescued\n```".to_string())]);
        let outcome = controller(&fx, client, 1, None, 5_000)
            .run(INDEX_ERROR_SCRIPT)
            .await
            .unwrap();

        assert!(outcome.repaired);
        assert_eq!(outcome.final_code, "echo rescued");

        let json = report_json(&fx);
        assert_eq!(json["failure_explanation"], "Success (Final)");
        let traces = json["traces"].as_array().unwrap();
        assert_eq!(traces.last().unwrap()["status"], "Success (Final)");
    }

    #[tokio::test]
    async fn test_exhaustion_records_best_attempt() {
        let fx = fixture();
        let client = StubInference::with_completions(vec![Ok("```\nexit 1\n```".to_string())]);
        let outcome = controller(&fx, client, 1, None, 5_000)
            .run(INDEX_ERROR_SCRIPT)
            .await
            .unwrap();

        assert!(!outcome.repaired);
        let json = report_json(&fx);
        assert_eq!(
            json["failure_explanation"],
            "Max iterations reached & final run failed"
        );
        assert_eq!(json["best_attempt"], "exit 1");
        let traces = json["traces"].as_array().unwrap();
        assert_eq!(traces.last().unwrap()["status"], "Failed (Final)");
    }

    #[tokio::test]
    async fn test_rejected_optimization_keeps_success_code() {
        let fx = fixture();
        // The "optimized" candidate changes observable output, so the gate
        // must reject it and keep the pre-optimization program.
        let structured = serde_json::json!({
            "original_complexity": "O(n)",
            "optimized_complexity": "O(1)",
            "changes_summary": ["claims a shortcut"],
            "optimized_code": "echo different",
        })
        .to_string();
        let client = StubInference::with_structured(vec![Ok(structured)]);
        let outcome = controller(&fx, client, 3, None, 5_000)
            .run("echo stable")
            .await
            .unwrap();

        assert!(outcome.repaired);
        assert_eq!(outcome.final_code, "echo stable");

        let json = report_json(&fx);
        assert_eq!(json["repaired_code"], "echo stable");
        assert!(json.get("optimization_report").is_none());
        let traces = json["traces"].as_array().unwrap();
        let rejection = traces.last().unwrap();
        assert_eq!(rejection["error_type"], "Optimization");
        // The loop succeeded at iteration 1, so the phase entry continues the
        // count instead of restarting it.
        assert_eq!(rejection["iteration"], 2);
        let status = rejection["status"].as_str().unwrap();
        assert!(status.starts_with("Rejected:"));
        assert!(status.len() > "Rejected:".len());
    }

    #[tokio::test]
    async fn test_accepted_optimization_replaces_code_and_reports() {
        let fx = fixture();
        let structured = serde_json::json!({
            "original_complexity": "O(n^2)",
            "optimized_complexity": "O(n)",
            "changes_summary": ["same output, less work"],
            "optimized_code": "echo stable # leaner",
        })
        .to_string();
        let client = StubInference::with_structured(vec![Ok(structured)]);
        let outcome = controller(&fx, client, 3, None, 5_000)
            .run("echo stable")
            .await
            .unwrap();

        assert!(outcome.repaired);
        assert_eq!(outcome.final_code, "echo stable # leaner");

        let json = report_json(&fx);
        assert_eq!(json["optimization_report"]["original_complexity"], "O(n^2)");
        assert_eq!(json["repaired_code"], "echo stable # leaner");
        let traces = json["traces"].as_array().unwrap();
        assert_eq!(traces.last().unwrap()["status"], "Accepted");
        assert_eq!(traces.last().unwrap()["iteration"], 2);
    }

    #[tokio::test]
    async fn test_logic_repair_adopts_running_candidate() {
        let fx = fixture();
        let client = StubInference::with_completions(vec![Ok(
            "```\necho corrected behavior\n```".to_string(),
        )]);
        let outcome = controller(
            &fx,
            client,
            3,
            Some("output should say corrected behavior".to_string()),
            5_000,
        )
        .run("echo wrong behavior")
        .await
        .unwrap();

        assert!(outcome.repaired);
        // Logic repair is gated on the candidate running, not on matching the
        // old output - the premise is that the old output was wrong.
        assert_eq!(outcome.final_code, "echo corrected behavior");

        let json = report_json(&fx);
        let traces = json["traces"].as_array().unwrap();
        let entry = traces.last().unwrap();
        assert_eq!(entry["error_type"], "Logic Repair");
        assert_eq!(entry["status"], "Accepted");
        assert_eq!(entry["iteration"], 2);
    }

    #[tokio::test]
    async fn test_logic_repair_rejects_failing_candidate() {
        let fx = fixture();
        let client = StubInference::with_completions(vec![Ok("```\nexit 7\n```".to_string())]);
        let outcome = controller(
            &fx,
            client,
            3,
            Some("should not crash".to_string()),
            5_000,
        )
        .run("echo original behavior")
        .await
        .unwrap();

        assert!(outcome.repaired);
        assert_eq!(outcome.final_code, "echo original behavior");

        let json = report_json(&fx);
        let entry = json["traces"].as_array().unwrap().last().unwrap().clone();
        assert_eq!(entry["error_type"], "Logic Repair");
        assert!(entry["status"].as_str().unwrap().starts_with("Rejected:"));
    }

    #[tokio::test]
    async fn test_fixed_code_exported_next_to_script() {
        let fx = fixture();
        let outcome = controller(&fx, StubInference::unreachable_service(), 3, None, 5_000)
            .run("echo exported")
            .await
            .unwrap();

        assert!(outcome.repaired);
        let fixed_path = fx.script_path.parent().unwrap().join("fixed/bug_fixed.py");
        assert_eq!(fs::read_to_string(fixed_path).unwrap(), "echo exported");
    }
}
