//! Helpers for streams, blocking work and child processes.

use std::{panic, pin::Pin};

use futures::Stream;

use crate::prelude::*;

pub mod io;
pub mod size_hint;

/// A boxed, sendable stream.
pub type BoxedStream<Item> = Pin<Box<dyn Stream<Item = Item> + Send>>;

/// Wrapper around [`tokio::task::spawn_blocking`] that propagates panics from
/// the background task.
///
/// Use this for in-process CPU-bound work like image decoding, so it doesn't
/// block the async executor.
pub async fn spawn_blocking_propagating_panics<F, T>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => value,
        Err(err) if err.is_panic() => panic::resume_unwind(err.into_panic()),
        // Only happens if the runtime is shutting down underneath us.
        Err(err) => panic!("blocking task was cancelled: {err}"),
    }
}

/// Report any command failures, and include any error output.
///
/// Standard output and standard error are logged at appropriate levels. And
/// each line of standard error may be optionally checked with `is_error_line`
/// to determine if the command failed despite a successful exit status.
pub fn check_for_command_failure(
    command_name: &str,
    output: &std::process::Output,
    is_error_line: Option<&dyn Fn(&str) -> bool>,
) -> Result<()> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    trace!(
        command_name = command_name,
        output = %stdout,
        "Standard output from command"
    );

    if output.status.success() {
        if !stderr.trim().is_empty() {
            debug!(
                command_name = command_name,
                output = %stderr,
                "Standard error from command",
            );
        }
        if let Some(is_error_line) = is_error_line
            && stderr.lines().any(is_error_line)
        {
            return Err(anyhow!(
                "{} printed error output:\n{}",
                command_name,
                stderr,
            ));
        }
        Ok(())
    } else {
        error!(
            command_name = command_name,
            output = %stderr,
            "Standard error from failed command",
        );
        if let Some(exit_code) = output.status.code() {
            Err(anyhow!(
                "{} failed with exit code {} and error output:\n{}",
                command_name,
                exit_code,
                stderr,
            ))
        } else {
            Err(anyhow!(
                "{} failed with error output:\n{}",
                command_name,
                stderr,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{os::unix::process::ExitStatusExt as _, process::Output};

    use super::*;

    fn output(code: i32, stderr: &str) -> Output {
        Output {
            status: std::process::ExitStatus::from_raw(code << 8),
            stdout: vec![],
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[test]
    fn failed_commands_include_stderr() {
        let err = check_for_command_failure("pdfinfo", &output(1, "Syntax Error"), None)
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("exit code 1"));
        assert!(message.contains("Syntax Error"));
    }

    #[test]
    fn error_lines_catch_successful_failures() {
        let is_error_line = |line: &str| line.starts_with("Error");
        assert!(
            check_for_command_failure("tool", &output(0, "ok\nError: bad page"), Some(&is_error_line))
                .is_err()
        );
        assert!(
            check_for_command_failure("tool", &output(0, "all fine"), Some(&is_error_line)).is_ok()
        );
    }

    #[tokio::test]
    #[should_panic(expected = "boom")]
    async fn blocking_panics_propagate() {
        let _: u32 = spawn_blocking_propagating_panics(|| -> u32 { panic!("boom") }).await;
    }
}
