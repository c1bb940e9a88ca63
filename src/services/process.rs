//! Shared child-process execution helper.
//!
//! Every `Command` in this crate that can run for more than an instant is
//! spawned through here rather than via a bare `.output().await`, so two
//! things are true no matter which branch of the race below wins:
//!
//! - `kill_on_drop(true)` is set unconditionally, so if the awaiting future
//!   is ever dropped (a `tokio::time::timeout` firing elsewhere, a caller
//!   abandoning the call) the OS process is sent a kill signal instead of
//!   being left to run as an orphan.
//! - Cancellation is polled cooperatively against the spawned child itself,
//!   not just checked between pipeline stages, so a job cancelled while an
//!   extractor/ffmpeg/fpcalc invocation is mid-flight has that invocation
//!   killed rather than left running to completion in the background.

use std::time::Duration;

use tokio::process::Command;
use tokio::time::sleep;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Why `run` returned without a completed `Output`.
pub enum Outcome {
    Output(std::process::Output),
    TimedOut,
    Cancelled,
}

/// Spawn `cmd` and race it to completion against an optional timeout and a
/// polled cancellation check. On timeout or cancellation the losing
/// `wait_with_output` future (and the `Child` it owns) is dropped, which —
/// because of `kill_on_drop(true)` — terminates the process.
pub async fn run(
    mut cmd: Command,
    timeout: Option<Duration>,
    is_cancelled: &(dyn Fn() -> bool + Sync),
) -> std::io::Result<Outcome> {
    cmd.kill_on_drop(true);
    let child = cmd.spawn()?;

    let cancel_watch = async {
        loop {
            if is_cancelled() {
                return;
            }
            sleep(CANCEL_POLL_INTERVAL).await;
        }
    };

    match timeout {
        Some(timeout) => {
            tokio::select! {
                result = child.wait_with_output() => result.map(Outcome::Output),
                _ = sleep(timeout) => Ok(Outcome::TimedOut),
                _ = cancel_watch => Ok(Outcome::Cancelled),
            }
        }
        None => {
            tokio::select! {
                result = child.wait_with_output() => result.map(Outcome::Output),
                _ = cancel_watch => Ok(Outcome::Cancelled),
            }
        }
    }
}

/// Always-false cancellation check for call sites with no job/cancellation
/// context (e.g. the synchronous classify-only endpoint).
pub fn never_cancelled() -> bool {
    false
}
