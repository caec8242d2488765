//! Operator confirmation and input validation ahead of any mutation.

use promotion_common::{Error, Result};
use std::collections::VecDeque;
use std::io::{self, BufRead, Write};

/// The only answer accepted as confirmation
pub const CONFIRMATION: &str = "yes";

/// Operator-facing console: status lines out, answers in
pub trait Console {
    fn say(&mut self, line: &str);

    fn ask(&mut self, question: &str) -> Result<String>;
}

/// Console bound to the process's stdin/stdout
#[derive(Debug, Default)]
pub struct StdConsole;

impl Console for StdConsole {
    fn say(&mut self, line: &str) {
        println!("{}", line);
    }

    fn ask(&mut self, question: &str) -> Result<String> {
        print!("{} ", question);
        io::stdout().flush()?;

        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        Ok(answer)
    }
}

/// Console replaying canned answers. Everything said or asked is kept in
/// `transcript`.
#[derive(Debug, Default)]
pub struct ScriptedConsole {
    answers: VecDeque<String>,
    pub transcript: Vec<String>,
}

impl ScriptedConsole {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: answers.into_iter().map(Into::into).collect(),
            transcript: Vec::new(),
        }
    }

    /// Number of questions asked so far
    pub fn questions_asked(&self) -> usize {
        self.transcript.iter().filter(|l| l.starts_with("? ")).count()
    }
}

impl Console for ScriptedConsole {
    fn say(&mut self, line: &str) {
        self.transcript.push(line.to_string());
    }

    fn ask(&mut self, question: &str) -> Result<String> {
        self.transcript.push(format!("? {}", question));
        // Running out of answers behaves like closing stdin
        Ok(self.answers.pop_front().unwrap_or_default())
    }
}

/// Ask for confirmation. Only the exact literal `yes` (ignoring the line
/// terminator) confirms.
pub fn confirm(console: &mut dyn Console, question: &str) -> Result<bool> {
    let answer = console.ask(question)?;
    Ok(answer.trim_end_matches(['\n', '\r']) == CONFIRMATION)
}

/// Reject empty or whitespace-only rollback reasons
pub fn validate_reason(reason: &str) -> Result<String> {
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(Error::EmptyReason);
    }
    Ok(reason.to_string())
}

/// Use the supplied reason or ask for one
pub fn obtain_reason(console: &mut dyn Console, supplied: Option<&str>) -> Result<String> {
    match supplied {
        Some(reason) => validate_reason(reason),
        None => {
            let answer = console.ask("Reason for rollback:")?;
            validate_reason(&answer)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_exact_yes_confirms() {
        for (answer, expected) in [
            ("yes\n", true),
            ("yes\r\n", true),
            ("yes", true),
            ("YES\n", false),
            ("y\n", false),
            (" yes\n", false),
            ("yes please\n", false),
            ("", false),
        ] {
            let mut console = ScriptedConsole::new([answer]);
            assert_eq!(confirm(&mut console, "Continue?").unwrap(), expected, "{:?}", answer);
        }
    }

    #[test]
    fn test_exhausted_script_declines() {
        let mut console = ScriptedConsole::default();
        assert!(!confirm(&mut console, "Continue?").unwrap());
        assert_eq!(console.questions_asked(), 1);
    }

    #[test]
    fn test_reason_validation() {
        assert!(matches!(validate_reason(""), Err(Error::EmptyReason)));
        assert!(matches!(validate_reason("  \n"), Err(Error::EmptyReason)));
        assert_eq!(validate_reason(" bad deploy \n").unwrap(), "bad deploy");
    }

    #[test]
    fn test_obtain_reason_prompts_only_when_missing() {
        let mut console = ScriptedConsole::new(["health checks failing\n"]);
        assert_eq!(
            obtain_reason(&mut console, Some("from flag")).unwrap(),
            "from flag"
        );
        assert_eq!(console.questions_asked(), 0);

        assert_eq!(
            obtain_reason(&mut console, None).unwrap(),
            "health checks failing"
        );
        assert_eq!(console.questions_asked(), 1);
    }
}
