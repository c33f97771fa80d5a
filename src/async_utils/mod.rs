//! Asynchronous utilities for use with Tokio.
//!
//! The pipeline itself is sequential, but OCR runs as a child process and
//! decoding or encoding a page is CPU-bound. These helpers keep that work off
//! the async executor.

use regex::Regex;

use crate::prelude::*;

pub mod io;

/// Wrapper around [`tokio::task::spawn_blocking`] that reports a panic in the
/// background task as an error.
pub async fn run_blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("background task panicked or was cancelled")
}

/// Report any command failures, and include any error output.
///
/// The output of standard error and standard output will be logged at
/// appropriate levels. And standard error may be optionally checked against a
/// regex to determine if the command failed.
pub fn check_for_command_failure(
    command_name: &str,
    output: &std::process::Output,
    error_regex: Option<&Regex>,
) -> Result<()> {
    let stderr = String::from_utf8_lossy(&output.stderr);
    debug!(
        command_name = command_name,
        bytes = output.stdout.len(),
        "Standard output from command"
    );

    if output.status.success() {
        if let Some(regex) = error_regex
            && regex.is_match(&stderr)
        {
            return Err(anyhow!(
                "{} printed error output:\n{}",
                command_name,
                stderr.trim_end(),
            ));
        }
        debug!(
            command_name = command_name,
            output = %stderr,
            "Standard error from command",
        );
        Ok(())
    } else if let Some(exit_code) = output.status.code() {
        Err(anyhow!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr.trim_end(),
        ))
    } else {
        Err(anyhow!(
            "{} was killed by a signal, with error output:\n{}",
            command_name,
            stderr.trim_end(),
        ))
    }
}
