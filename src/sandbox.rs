//! Sandboxed execution of candidate programs
//!
//! Writes the candidate to a uniquely named temporary file and runs it as an
//! isolated child process under a wall-clock timeout. One call is exactly one
//! process launch; the temp file is removed on every exit path.

use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Default wall-clock budget for a single candidate run.
pub const DEFAULT_TIMEOUT_SECS: u64 = 2;

/// Message reported when a timed-out child produced no stderr of its own.
pub const TIMEOUT_SENTINEL: &str = "Execution timed out.";

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Outcome of one sandboxed run.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
    pub timed_out: bool,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_status == 0 && !self.timed_out
    }

    fn launch_failure(message: String) -> Self {
        Self {
            stdout: String::new(),
            stderr: message,
            exit_status: -1,
            timed_out: false,
        }
    }
}

pub struct Sandbox {
    interpreter: String,
    suffix: String,
    timeout: Duration,
}

impl Sandbox {
    pub fn new(timeout: Duration) -> Self {
        Self {
            interpreter: "python3".to_string(),
            suffix: ".py".to_string(),
            timeout,
        }
    }

    /// Override the interpreter and temp-file suffix. Tests use `sh` so they
    /// run without a Python toolchain on the machine.
    pub fn with_interpreter(mut self, program: &str, suffix: &str) -> Self {
        self.interpreter = program.to_string();
        self.suffix = suffix.to_string();
        self
    }

    /// Run `code` once and report what happened.
    ///
    /// Never returns an error: launch failures are folded into the result as
    /// an `exit_status` of -1 with the failure message in stderr, so the
    /// controller can treat every outcome uniformly.
    pub fn run(&self, code: &str) -> ExecutionResult {
        let file = match self.write_temp(code) {
            Ok(file) => file,
            Err(e) => {
                return ExecutionResult::launch_failure(format!(
                    "Failed to stage code for execution: {}",
                    e
                ))
            }
        };

        // `file` is dropped (and the temp file removed) on every path out of
        // this function, including panics while waiting on the child.
        self.execute(file.path())
    }

    /// Launch the interpreter on `script` and wait under the deadline.
    ///
    /// Both streams are drained on background threads so a chatty child
    /// cannot deadlock against a full pipe. A child still alive at the
    /// deadline is killed; whatever it printed up to that point is kept.
    fn execute(&self, script: &Path) -> ExecutionResult {
        let spawned = Command::new(&self.interpreter)
            .arg(script)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                return ExecutionResult::launch_failure(format!(
                    "Failed to launch {}: {}",
                    self.interpreter, e
                ))
            }
        };

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let deadline = Instant::now() + self.timeout;

        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    return ExecutionResult {
                        stdout: collect(stdout),
                        stderr: collect(stderr),
                        exit_status: status.code().unwrap_or(-1),
                        timed_out: false,
                    }
                }
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    let captured = collect(stderr);
                    return ExecutionResult {
                        stdout: collect(stdout),
                        stderr: if captured.is_empty() {
                            TIMEOUT_SENTINEL.to_string()
                        } else {
                            captured
                        },
                        exit_status: -1,
                        timed_out: true,
                    };
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    let _ = child.kill();
                    return ExecutionResult::launch_failure(format!(
                        "Failed to wait for child process: {}",
                        e
                    ));
                }
            }
        }
    }

    fn write_temp(&self, code: &str) -> std::io::Result<tempfile::NamedTempFile> {
        let mut file = tempfile::Builder::new()
            .prefix("codemend_run_")
            .suffix(&self.suffix)
            .tempfile()?;
        file.write_all(code.as_bytes())?;
        file.flush()?;
        Ok(file)
    }
}

fn drain<R: Read + Send + 'static>(stream: Option<R>) -> Option<JoinHandle<String>> {
    stream.map(|mut source| {
        thread::spawn(move || {
            let mut bytes = Vec::new();
            let _ = source.read_to_end(&mut bytes);
            String::from_utf8_lossy(&bytes).into_owned()
        })
    })
}

fn collect(reader: Option<JoinHandle<String>>) -> String {
    reader.and_then(|handle| handle.join().ok()).unwrap_or_default()
}
