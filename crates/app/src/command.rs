use council_chat::chat::{ConversationId, ConversationSummary};
use snafu::{OptionExt, Snafu, ensure};

/// Which conversation `/open` refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenTarget {
    /// 1-based position in the last printed list.
    Index(usize),
    Id(ConversationId),
}

impl OpenTarget {
    pub fn resolve(&self, conversations: &[ConversationSummary]) -> Option<ConversationId> {
        match self {
            Self::Index(position) => position
                .checked_sub(1)
                .and_then(|index| conversations.get(index))
                .map(|summary| summary.id.clone()),
            Self::Id(id) => Some(id.clone()),
        }
    }
}

/// One line of shell input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    Empty,
    Help,
    List,
    New,
    Open(OpenTarget),
    Quit,
    Send(String),
    /// Shows the configured server, or saves a new one for the next start.
    Server(Option<String>),
}

impl ShellCommand {
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Self::Empty);
        }
        let Some(command) = line.strip_prefix('/') else {
            return Ok(Self::Send(line.to_string()));
        };

        let mut parts = command.split_whitespace();
        let name = parts.next().unwrap_or_default();
        let argument = parts.next();
        let command = match name {
            "help" | "?" => Self::Help,
            "list" | "ls" => Self::List,
            "new" => Self::New,
            "quit" | "exit" | "q" => Self::Quit,
            "open" => {
                let raw = argument.context(MissingArgumentSnafu {
                    stage: "parse-open-target",
                    command: "/open",
                })?;
                let target = match raw.strip_prefix('#').unwrap_or(raw).parse::<usize>() {
                    Ok(position) => {
                        ensure!(
                            position > 0,
                            InvalidArgumentSnafu {
                                stage: "parse-open-index",
                                command: "/open",
                                raw,
                            }
                        );
                        OpenTarget::Index(position)
                    }
                    Err(_) => OpenTarget::Id(ConversationId::new(raw)),
                };
                Self::Open(target)
            }
            "server" => Self::Server(argument.map(str::to_string)),
            _ => {
                return UnknownCommandSnafu {
                    stage: "parse-command-name",
                    raw: line,
                }
                .fail();
            }
        };

        ensure!(
            (matches!(command, Self::Open(_) | Self::Server(_)) || argument.is_none())
                && parts.next().is_none(),
            UnexpectedArgumentSnafu {
                stage: "parse-command-arguments",
                raw: line,
            }
        );
        Ok(command)
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CommandError {
    #[snafu(display("unknown command `{raw}`; try /help"))]
    UnknownCommand { stage: &'static str, raw: String },
    #[snafu(display("{command} needs an argument"))]
    MissingArgument {
        stage: &'static str,
        command: &'static str,
    },
    #[snafu(display("invalid argument `{raw}` for {command}"))]
    InvalidArgument {
        stage: &'static str,
        command: &'static str,
        raw: String,
    },
    #[snafu(display("`{raw}` takes no arguments"))]
    UnexpectedArgument { stage: &'static str, raw: String },
}

pub const HELP: &str = "\
commands:
  /list            show conversations
  /new             start a new conversation
  /open <n|id>     open a conversation by list number or id
  /server [url]    show the council server, or save a new one for next start
  /quit            leave
anything else is sent to the council";

#[cfg(test)]
mod tests {
    use super::*;
    use council_chat::chat::Conversation;

    #[test]
    fn plain_text_is_sent() {
        assert_eq!(
            ShellCommand::parse("  what is rust?  ").expect("parsed"),
            ShellCommand::Send("what is rust?".to_string())
        );
        assert_eq!(ShellCommand::parse("   ").expect("parsed"), ShellCommand::Empty);
    }

    #[test]
    fn slash_commands_parse() {
        assert_eq!(ShellCommand::parse("/new").expect("parsed"), ShellCommand::New);
        assert_eq!(ShellCommand::parse("/ls").expect("parsed"), ShellCommand::List);
        assert_eq!(ShellCommand::parse("/exit").expect("parsed"), ShellCommand::Quit);
        assert_eq!(
            ShellCommand::parse("/open 2").expect("parsed"),
            ShellCommand::Open(OpenTarget::Index(2))
        );
        assert_eq!(
            ShellCommand::parse("/open #3").expect("parsed"),
            ShellCommand::Open(OpenTarget::Index(3))
        );
        assert_eq!(
            ShellCommand::parse("/open 4f1c-aa").expect("parsed"),
            ShellCommand::Open(OpenTarget::Id(ConversationId::new("4f1c-aa")))
        );
        assert_eq!(
            ShellCommand::parse("/server").expect("parsed"),
            ShellCommand::Server(None)
        );
        assert_eq!(
            ShellCommand::parse("/server http://10.0.0.5:8001").expect("parsed"),
            ShellCommand::Server(Some("http://10.0.0.5:8001".to_string()))
        );
    }

    #[test]
    fn malformed_commands_are_rejected() {
        assert!(matches!(
            ShellCommand::parse("/frobnicate"),
            Err(CommandError::UnknownCommand { .. })
        ));
        assert!(matches!(
            ShellCommand::parse("/open"),
            Err(CommandError::MissingArgument { .. })
        ));
        assert!(matches!(
            ShellCommand::parse("/open 0"),
            Err(CommandError::InvalidArgument { .. })
        ));
        assert!(matches!(
            ShellCommand::parse("/new now"),
            Err(CommandError::UnexpectedArgument { .. })
        ));
        assert!(matches!(
            ShellCommand::parse("/server http://a http://b"),
            Err(CommandError::UnexpectedArgument { .. })
        ));
    }

    #[test]
    fn index_targets_resolve_against_the_list() {
        let list = vec![
            Conversation::new(ConversationId::new("a")).summary(),
            Conversation::new(ConversationId::new("b")).summary(),
        ];

        assert_eq!(
            OpenTarget::Index(2).resolve(&list),
            Some(ConversationId::new("b"))
        );
        assert_eq!(OpenTarget::Index(3).resolve(&list), None);
        assert_eq!(
            OpenTarget::Id(ConversationId::new("zzz")).resolve(&list),
            Some(ConversationId::new("zzz"))
        );
    }
}
