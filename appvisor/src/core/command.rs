//! Terminal control-command vocabulary.

/// A completed terminal input line, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalCommand {
    /// Run the auto-fix loop against the latest error report.
    Fix,
    /// Print the control-command vocabulary.
    Help,
    /// Drop the app's buffered errors.
    ClearErrors,
    /// Anything else goes to the shell untouched.
    PassThrough(String),
}

impl TerminalCommand {
    pub fn parse(line: &str) -> Self {
        match line.trim() {
            "fix" => TerminalCommand::Fix,
            "help" => TerminalCommand::Help,
            "clear-errors" => TerminalCommand::ClearErrors,
            _ => TerminalCommand::PassThrough(line.to_string()),
        }
    }

    pub fn is_control(&self) -> bool {
        !matches!(self, TerminalCommand::PassThrough(_))
    }
}

pub const HELP_TEXT: &str = "\
appvisor terminal commands:
  fix            ask the agent to repair the errors currently reported for this app
  clear-errors   forget buffered build and runtime errors for this app
  help           show this message
Anything else runs in the shell.
";
