use std::str::FromStr;
use thiserror::Error;

/// One line typed at the measuring prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Measure,
    /// Commit the pending value, optionally under a new label
    Commit(Option<String>),
    Label(String),
    Discard,
    /// 0-based log index
    Edit(usize),
    /// 0-based log index
    Delete(usize),
    List,
    Status,
    Reconnect,
    Finish,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Type a command, 'help' lists them")]
    Empty,

    #[error("Unknown command '{0}', 'help' lists them")]
    Unknown(String),

    #[error("'{0}' needs an argument")]
    MissingArgument(&'static str),

    #[error("'{0}' is not a list position (1, 2, ...)")]
    BadPosition(String),
}

pub const HELP: &str = "\
  measure | m          ask the device for a reading
  label <text>         set the label for the next commit
  commit | c [label]   store the reading under the label
  discard              drop the current reading
  list | l             show stored readings
  edit <n>             take reading n back for correction
  delete <n>           remove reading n
  status               show connection and current reading
  reconnect            retry after a failed or lost connection
  finish               build the report and end the visit
  quit | q             leave without a report";

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };
        let argument = (!rest.is_empty()).then(|| rest.to_string());

        match word.to_lowercase().as_str() {
            "" => Err(CommandError::Empty),
            "measure" | "m" => Ok(Command::Measure),
            "commit" | "c" => Ok(Command::Commit(argument)),
            "label" => argument
                .map(Command::Label)
                .ok_or(CommandError::MissingArgument("label")),
            "discard" => Ok(Command::Discard),
            "edit" => Ok(Command::Edit(position(rest, "edit")?)),
            "delete" | "del" => Ok(Command::Delete(position(rest, "delete")?)),
            "list" | "l" => Ok(Command::List),
            "status" => Ok(Command::Status),
            "reconnect" => Ok(Command::Reconnect),
            "finish" => Ok(Command::Finish),
            "help" | "?" => Ok(Command::Help),
            "quit" | "q" | "exit" => Ok(Command::Quit),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

// Lists are shown numbered from 1.
fn position(text: &str, command: &'static str) -> Result<usize, CommandError> {
    if text.is_empty() {
        return Err(CommandError::MissingArgument(command));
    }
    match text.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n - 1),
        _ => Err(CommandError::BadPosition(text.to_string())),
    }
}

/// `y`/`yes` in either case; anything else declines.
pub fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes" | "s" | "sim")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_commands() {
        assert_eq!("m".parse(), Ok(Command::Measure));
        assert_eq!("  MEASURE ".parse(), Ok(Command::Measure));
        assert_eq!("finish".parse(), Ok(Command::Finish));
        assert_eq!("q".parse(), Ok(Command::Quit));
    }

    #[test]
    fn commit_keeps_label_with_spaces() {
        assert_eq!("commit".parse(), Ok(Command::Commit(None)));
        assert_eq!(
            "c  Living room wall ".parse(),
            Ok(Command::Commit(Some("Living room wall".to_string())))
        );
        assert_eq!(
            "label".parse::<Command>(),
            Err(CommandError::MissingArgument("label"))
        );
    }

    #[test]
    fn positions_are_one_based() {
        assert_eq!("edit 1".parse(), Ok(Command::Edit(0)));
        assert_eq!("delete 3".parse(), Ok(Command::Delete(2)));
        assert_eq!(
            "delete 0".parse::<Command>(),
            Err(CommandError::BadPosition("0".to_string()))
        );
        assert_eq!(
            "edit".parse::<Command>(),
            Err(CommandError::MissingArgument("edit"))
        );
    }

    #[test]
    fn unknown_and_empty() {
        assert_eq!("".parse::<Command>(), Err(CommandError::Empty));
        assert_eq!(
            "jump".parse::<Command>(),
            Err(CommandError::Unknown("jump".to_string()))
        );
    }

    #[test]
    fn confirmation_answers() {
        assert!(is_yes("Y"));
        assert!(is_yes(" yes "));
        assert!(!is_yes(""));
        assert!(!is_yes("no"));
    }
}
