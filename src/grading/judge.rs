//! Per-test command construction and verdicts.

use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

use super::store::Verdict;
use crate::sandbox::{shell_quote, RunOutput};
use crate::workspace::RawFile;

/// Last stdout line written by the timing wrapper.
pub const RUNTIME_MARKER: &str = "===RUNTIME_MS===";

static MAIN_GUARD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*if\s+__name__\s*==\s*["']__main__["']\s*:"#).expect("Invalid main guard regex")
});

/// Pick the file to execute: the first with a `__main__` guard, else
/// `main.py`, else the first Python file.
pub fn detect_entry_point(files: &[RawFile]) -> Option<String> {
    let python = || files.iter().filter(|f| f.path.ends_with(".py"));
    python()
        .find(|f| MAIN_GUARD.is_match(&String::from_utf8_lossy(&f.data)))
        .or_else(|| files.iter().find(|f| f.path.trim_start_matches("./") == "main.py"))
        .or_else(|| python().next())
        .map(|f| f.path.trim_start_matches("./").to_string())
}

/// Shell wrapper that runs `entry` and appends its runtime in milliseconds.
pub fn build_command(entry: &str) -> Vec<String> {
    let script = format!(
        "start=$(date +%s%N); PYTHONDONTWRITEBYTECODE=1 PYTHONUNBUFFERED=1 HOME=/tmp LANG=C.UTF-8 \
         python -u {}; status=$?; end=$(date +%s%N); echo '{}' $(((end-start)/1000000)); exit $status",
        shell_quote(entry),
        RUNTIME_MARKER
    );
    vec!["sh".to_string(), "-c".to_string(), script]
}

/// Strip the runtime marker line. Returns trimmed stdout and the measured runtime.
pub fn split_runtime_marker(stdout: &str) -> (String, Option<Duration>) {
    let trimmed = stdout.trim();
    let (body, last) = trimmed.rsplit_once('\n').unwrap_or(("", trimmed));
    match last.strip_prefix(RUNTIME_MARKER).map(|ms| ms.trim().parse::<u64>()) {
        Some(Ok(ms)) => (body.trim_end().to_string(), Some(Duration::from_millis(ms))),
        _ => (trimmed.to_string(), None),
    }
}

/// Timeouts win over crashes, crashes over output mismatches.
pub fn classify(timed_out: bool, exit_code: i32, actual: &str, expected: &str) -> Verdict {
    if timed_out {
        Verdict::TimeLimitExceeded
    } else if exit_code != 0 {
        Verdict::RuntimeError
    } else if actual.trim() != expected.trim() {
        Verdict::WrongOutput
    } else {
        Verdict::Passed
    }
}

#[derive(Debug, Clone)]
pub struct Judgement {
    pub verdict: Verdict,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub runtime: Duration,
}

pub fn judge(output: &RunOutput, limit: Duration, expected: &str) -> Judgement {
    let (stdout, measured) = split_runtime_marker(&output.stdout_lossy());
    let runtime = measured.unwrap_or(output.runtime);
    let timed_out = output.timed_out || runtime > limit;
    Judgement {
        verdict: classify(timed_out, output.exit_code, &stdout, expected),
        stdout,
        stderr: output.stderr_lossy().trim().to_string(),
        exit_code: output.exit_code,
        runtime,
    }
}
