//! Interpretation of captured run output.
//!
//! Decodes the raw byte streams from the process runner into text and
//! classifies the terminal state of the run. Decode failures never
//! propagate as errors — they become a `DecodeFailed` outcome with a
//! fixed student-facing message.

use std::time::Duration;

use crate::runner::Captured;

/// Fixed stderr text for runs whose output was not valid UTF-8.
pub const DECODE_FAILED_MESSAGE: &str =
    "The output of your program could not be decoded as text.";

/// How a grading run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalState {
    /// The child exited on its own within the budget.
    Completed { exit_code: i32 },
    /// The child was killed at the wall-clock budget.
    TimedOut,
    /// Captured bytes were not valid text.
    DecodeFailed,
}

/// Decoded, classified result of one grading run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub stdout: String,
    pub stderr: String,
    pub state: TerminalState,
}

/// Student-facing message for a run that exceeded its budget.
pub fn timeout_message(budget: Duration) -> String {
    format!(
        "Your program did not finish within {} seconds and was terminated.",
        budget.as_secs_f64()
    )
}

/// Decode a capture into text, classifying timeout and decode failures.
pub fn interpret(captured: Captured, budget: Duration) -> RunOutcome {
    match captured {
        Captured::TimedOut => RunOutcome {
            stdout: String::new(),
            stderr: timeout_message(budget),
            state: TerminalState::TimedOut,
        },
        Captured::Exited {
            exit_code,
            stdout,
            stderr,
        } => match (String::from_utf8(stdout), String::from_utf8(stderr)) {
            (Ok(stdout), Ok(stderr)) => RunOutcome {
                stdout,
                stderr,
                state: TerminalState::Completed { exit_code },
            },
            _ => RunOutcome {
                stdout: String::new(),
                stderr: DECODE_FAILED_MESSAGE.to_string(),
                state: TerminalState::DecodeFailed,
            },
        },
    }
}
