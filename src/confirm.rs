// SPDX-License-Identifier: AGPL-3.0-or-later
//! Confirmation gate for destructive actions

use std::collections::VecDeque;
use std::io::{BufRead, Write};
use std::sync::Mutex;
use tracing::{info, warn};

use crate::error::{PaveError, Result};

/// The only accepted affirmative answer
pub const AFFIRMATIVE: &str = "yes";

/// Answers a yes/no question before something destructive happens
pub trait Confirm: Send + Sync {
    fn confirm(&self, prompt: &str) -> bool;
}

/// Whether an operator's answer is the affirmative token
pub fn is_affirmative(answer: &str) -> bool {
    answer.trim() == AFFIRMATIVE
}

/// Prompts on the terminal and reads one line
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn confirm(&self, prompt: &str) -> bool {
        print!("{prompt} Type '{AFFIRMATIVE}' to continue: ");
        let _ = std::io::stdout().flush();

        let mut answer = String::new();
        match std::io::stdin().lock().read_line(&mut answer) {
            Ok(_) => is_affirmative(&answer),
            Err(e) => {
                warn!(error = %e, "Could not read confirmation");
                false
            }
        }
    }
}

/// Pre-answered yes, for `--yes` and unattended runs
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeYes;

impl Confirm for AssumeYes {
    fn confirm(&self, prompt: &str) -> bool {
        println!("{prompt} (confirmed by --yes)");
        true
    }
}

/// Replays queued answers; an empty queue declines
#[derive(Debug, Default)]
pub struct ScriptedConfirm {
    answers: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedConfirm {
    pub fn answering<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: Mutex::new(answers.into_iter().map(Into::into).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Confirm for ScriptedConfirm {
    fn confirm(&self, prompt: &str) -> bool {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(prompt.to_string());
        self.answers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .is_some_and(|answer| is_affirmative(&answer))
    }
}

/// Print a destructive step before it runs
pub fn announce(action: &str) {
    println!("  -> {action}");
    info!(action, "Destructive step");
}

/// Announce `action`, then require confirmation for it
pub fn require(confirm: &dyn Confirm, action: &str) -> Result<()> {
    println!("About to {action}.");
    if confirm.confirm(&format!("This will {action}.")) {
        info!(action, "Destructive action confirmed");
        Ok(())
    } else {
        warn!(action, "Destructive action declined");
        Err(PaveError::Cancelled {
            action: action.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_exact_yes_is_affirmative() {
        assert!(is_affirmative("yes"));
        assert!(is_affirmative("yes\n"));
        assert!(!is_affirmative("y"));
        assert!(!is_affirmative("YES"));
        assert!(!is_affirmative("yes please"));
    }

    #[test]
    fn test_require_declined_is_cancelled() {
        let confirm = ScriptedConfirm::answering(["no"]);
        let err = require(&confirm, "destroy the bootstrap identity").unwrap_err();
        assert!(matches!(err, PaveError::Cancelled { .. }));
        assert_eq!(confirm.prompts().len(), 1);
    }

    #[test]
    fn test_require_accepts_yes_and_empty_queue_declines() {
        let confirm = ScriptedConfirm::answering(["yes"]);
        assert!(require(&confirm, "apply").is_ok());
        assert!(require(&confirm, "apply").is_err());
        assert!(require(&AssumeYes, "apply").is_ok());
    }
}
