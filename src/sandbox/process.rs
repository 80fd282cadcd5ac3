//! Child process helpers shared by the container and VM runners.

use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::debug;

use super::backend::{exit_code_of, read_capped};

/// How long to wait for pipe readers once the process itself is gone.
/// Grandchildren that inherited the pipes can otherwise keep them open.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
pub(crate) struct CapturedRun {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
    pub deadline_hit: bool,
    pub elapsed: Duration,
}

/// Spawn `cmd`, feed it `stdin`, capture up to `cap` bytes per stream and
/// kill it once `deadline` elapses.
pub(crate) async fn run_captured(
    mut cmd: Command,
    stdin: &[u8],
    deadline: Duration,
    cap: usize,
) -> std::io::Result<CapturedRun> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let start = Instant::now();
    let mut child = cmd.spawn()?;

    let stdout_task = child.stdout.take().map(|out| tokio::spawn(read_capped(out, cap)));
    let stderr_task = child.stderr.take().map(|err| tokio::spawn(read_capped(err, cap)));

    if let Some(mut pipe) = child.stdin.take() {
        let input = stdin.to_vec();
        tokio::spawn(async move {
            if !input.is_empty() {
                let _ = pipe.write_all(&input).await;
            }
            let _ = pipe.shutdown().await;
        });
    }

    let (status, deadline_hit) = match tokio::time::timeout(deadline, child.wait()).await {
        Ok(status) => (Some(status?), false),
        Err(_) => {
            debug!("Deadline of {:?} reached, killing child", deadline);
            let _ = child.start_kill();
            (child.wait().await.ok(), true)
        }
    };
    let elapsed = start.elapsed();

    Ok(CapturedRun {
        stdout: join_reader(stdout_task).await,
        stderr: join_reader(stderr_task).await,
        exit_code: status.as_ref().map(exit_code_of).unwrap_or(-1),
        deadline_hit,
        elapsed,
    })
}

async fn join_reader(task: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    let Some(task) = task else {
        return Vec::new();
    };
    let abort = task.abort_handle();
    match tokio::time::timeout(DRAIN_TIMEOUT, task).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(_)) => Vec::new(),
        Err(_) => {
            abort.abort();
            Vec::new()
        }
    }
}

/// Quote a string for a POSIX shell.
pub fn shell_quote(raw: &str) -> String {
    if !raw.is_empty()
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        return raw.to_string();
    }
    format!("'{}'", raw.replace('\'', r"'\''"))
}

/// Join an argv into a single shell command line.
pub fn shell_join(args: &[String]) -> String {
    args.iter().map(|a| shell_quote(a)).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn test_run_captured_feeds_stdin() {
        let run = run_captured(sh("cat; echo err >&2; exit 3"), b"hello", Duration::from_secs(5), 1024)
            .await
            .unwrap();
        assert_eq!(run.stdout, b"hello");
        assert_eq!(run.stderr, b"err\n");
        assert_eq!(run.exit_code, 3);
        assert!(!run.deadline_hit);
    }

    #[tokio::test]
    async fn test_run_captured_kills_on_deadline() {
        let run = run_captured(sh("exec sleep 10"), b"", Duration::from_millis(300), 1024)
            .await
            .unwrap();
        assert!(run.deadline_hit);
        assert!(run.elapsed < Duration::from_secs(3));
        assert_eq!(run.exit_code, 137);
    }

    #[tokio::test]
    async fn test_run_captured_caps_output() {
        let run = run_captured(sh("head -c 10000 /dev/zero"), b"", Duration::from_secs(5), 64)
            .await
            .unwrap();
        assert_eq!(run.stdout.len(), 64);
        assert_eq!(run.exit_code, 0);
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("main.py"), "main.py");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(
            shell_join(&["python".to_string(), "-c".to_string(), "print(1)".to_string()]),
            "python -c 'print(1)'"
        );
    }
}
