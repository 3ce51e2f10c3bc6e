//! The verification gate for optimization and logic-repair candidates
//!
//! Black-box, single-sample equivalence: run the baseline, run the
//! candidate, compare stdout byte-for-byte. This is the system's only
//! correctness guarantee and it is knowingly weak: it observes one
//! execution of each program and cannot detect divergence on inputs other
//! than the program's own embedded test invocation. Do not strengthen it
//! silently; callers rely on rejection reasons being literal.

use crate::sandbox::Sandbox;
use crate::util::ellipsize;

const REASON_STDERR_MAX_CHARS: usize = 1_500;

#[derive(Debug, Clone)]
pub struct Verdict {
    pub accepted: bool,
    pub reason: String,
}

impl Verdict {
    fn accept() -> Self {
        Self {
            accepted: true,
            reason: "Outputs match".to_string(),
        }
    }

    fn reject(reason: String) -> Self {
        Self {
            accepted: false,
            reason,
        }
    }
}

/// Decide whether `candidate` may replace `original`.
///
/// Rejects if the baseline itself no longer runs (guards against verifying
/// against a regressed baseline), if the candidate fails, or if the two runs'
/// stdout differ in any byte. Exact equality is the sole acceptance
/// criterion: no semantic diffing, no whitespace tolerance.
pub fn verify_equivalence(sandbox: &Sandbox, original: &str, candidate: &str) -> Verdict {
    let baseline = sandbox.run(original);
    if !baseline.success() {
        return Verdict::reject(format!(
            "Original code failed during verification (exit {}): {}",
            baseline.exit_status,
            ellipsize(&baseline.stderr, REASON_STDERR_MAX_CHARS)
        ));
    }

    let trial = sandbox.run(candidate);
    if !trial.success() {
        return Verdict::reject(format!(
            "Candidate code failed (exit {}): {}",
            trial.exit_status,
            ellipsize(&trial.stderr, REASON_STDERR_MAX_CHARS)
        ));
    }

    if baseline.stdout != trial.stdout {
        return Verdict::reject(format!(
            "Output mismatch: expected {:?}, got {:?}",
            ellipsize(&baseline.stdout, 200),
            ellipsize(&trial.stdout, 200)
        ));
    }

    Verdict::accept()
}
