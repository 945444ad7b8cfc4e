use std::collections::BTreeMap;

/// Command names as typed at the prompt.
pub mod names {
    pub const CLEAR: &str = "clear";
    pub const HELP: &str = "help";
    pub const LIST: &str = "list";
    pub const MAKE_DIR: &str = "makeDir";
    pub const REMOVE_DIR: &str = "removeDir";
    pub const OPEN_SERVER: &str = "openServer";
    pub const CLOSE_SERVER: &str = "closeServer";
    pub const OPEN_INTERACTIVE: &str = "openInteractive";
    pub const REBOOT: &str = "reboot";
}

const ROOT_PATH: &str = "/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandMetadata {
    pub name: &'static str,
    pub usage: &'static str,
    pub description: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Clear,
    Help,
    List { path: String },
    MakeDir { name: String },
    RemoveDir { name: String },
    OpenServer,
    CloseServer,
    OpenInteractive,
    Reboot,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Clear => names::CLEAR,
            Command::Help => names::HELP,
            Command::List { .. } => names::LIST,
            Command::MakeDir { .. } => names::MAKE_DIR,
            Command::RemoveDir { .. } => names::REMOVE_DIR,
            Command::OpenServer => names::OPEN_SERVER,
            Command::CloseServer => names::CLOSE_SERVER,
            Command::OpenInteractive => names::OPEN_INTERACTIVE,
            Command::Reboot => names::REBOOT,
        }
    }
}

/// A committed line after tokenization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLine {
    Empty,
    /// The first token names no command; carries the line as typed.
    Unknown(String),
    Command(Command),
}

#[derive(Clone, Debug)]
pub struct CommandDefinition {
    metadata: CommandMetadata,
    parse: fn(&[&str]) -> Command,
}

impl CommandDefinition {
    pub fn new(metadata: CommandMetadata, parse: fn(&[&str]) -> Command) -> Self {
        Self { metadata, parse }
    }

    pub fn metadata(&self) -> &CommandMetadata {
        &self.metadata
    }
}

#[derive(Debug)]
pub struct CommandRegistry {
    definitions: BTreeMap<&'static str, CommandDefinition>,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            definitions: canonical_definitions()
                .into_iter()
                .map(|definition| (definition.metadata.name, definition))
                .collect(),
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&CommandMetadata> {
        self.definitions.get(name).map(CommandDefinition::metadata)
    }

    pub fn list(&self) -> Vec<&CommandMetadata> {
        self.definitions
            .values()
            .map(CommandDefinition::metadata)
            .collect()
    }

    /// Splits on whitespace; the first token selects the command.
    pub fn parse_line(&self, line: &str) -> ParsedLine {
        let tokens = line.split_whitespace().collect::<Vec<_>>();
        let Some((name, args)) = tokens.split_first() else {
            return ParsedLine::Empty;
        };
        match self.definitions.get(*name) {
            Some(definition) => ParsedLine::Command((definition.parse)(args)),
            None => ParsedLine::Unknown(line.to_owned()),
        }
    }
}

fn first_arg(args: &[&str]) -> String {
    args.first().map(|arg| (*arg).to_owned()).unwrap_or_default()
}

fn canonical_definitions() -> Vec<CommandDefinition> {
    vec![
        CommandDefinition::new(
            CommandMetadata {
                name: names::CLEAR,
                usage: "clear",
                description: "Clear the terminal.",
            },
            |_| Command::Clear,
        ),
        CommandDefinition::new(
            CommandMetadata {
                name: names::HELP,
                usage: "help",
                description: "List the available commands.",
            },
            |_| Command::Help,
        ),
        CommandDefinition::new(
            CommandMetadata {
                name: names::LIST,
                usage: "list [path]",
                description: "List a sandbox directory (the root by default).",
            },
            |args| Command::List {
                path: args
                    .first()
                    .map(|path| (*path).to_owned())
                    .unwrap_or_else(|| ROOT_PATH.to_owned()),
            },
        ),
        CommandDefinition::new(
            CommandMetadata {
                name: names::MAKE_DIR,
                usage: "makeDir <name>",
                description: "Create a directory in the sandbox.",
            },
            |args| Command::MakeDir {
                name: first_arg(args),
            },
        ),
        CommandDefinition::new(
            CommandMetadata {
                name: names::REMOVE_DIR,
                usage: "removeDir <name>",
                description: "Remove a sandbox directory and everything in it.",
            },
            |args| Command::RemoveDir {
                name: first_arg(args),
            },
        ),
        CommandDefinition::new(
            CommandMetadata {
                name: names::OPEN_SERVER,
                usage: "openServer",
                description: "Install dependencies and start the dev server.",
            },
            |_| Command::OpenServer,
        ),
        CommandDefinition::new(
            CommandMetadata {
                name: names::CLOSE_SERVER,
                usage: "closeServer",
                description: "Stop the dev server.",
            },
            |_| Command::CloseServer,
        ),
        CommandDefinition::new(
            CommandMetadata {
                name: names::OPEN_INTERACTIVE,
                usage: "openInteractive",
                description: "Open a shell inside the sandbox; type 'exit' to leave.",
            },
            |_| Command::OpenInteractive,
        ),
        CommandDefinition::new(
            CommandMetadata {
                name: names::REBOOT,
                usage: "reboot",
                description: "Tear the sandbox down and boot a fresh one.",
            },
            |_| Command::Reboot,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lists_every_command_once() {
        let registry = CommandRegistry::new();
        let names = registry
            .list()
            .into_iter()
            .map(|metadata| metadata.name)
            .collect::<Vec<_>>();

        assert_eq!(names.len(), 9);
        for name in [
            names::CLEAR,
            names::HELP,
            names::LIST,
            names::MAKE_DIR,
            names::REMOVE_DIR,
            names::OPEN_SERVER,
            names::CLOSE_SERVER,
            names::OPEN_INTERACTIVE,
            names::REBOOT,
        ] {
            assert!(registry.lookup(name).is_some(), "missing {name}");
        }
    }

    #[test]
    fn blank_lines_parse_as_empty() {
        let registry = CommandRegistry::new();
        assert_eq!(registry.parse_line(""), ParsedLine::Empty);
        assert_eq!(registry.parse_line("  \t "), ParsedLine::Empty);
    }

    #[test]
    fn unknown_lines_keep_their_literal_text() {
        let registry = CommandRegistry::new();
        assert_eq!(
            registry.parse_line("ls -la"),
            ParsedLine::Unknown("ls -la".to_owned())
        );
        assert_eq!(
            registry.parse_line("List"),
            ParsedLine::Unknown("List".to_owned())
        );
    }

    #[test]
    fn arguments_are_taken_from_the_second_token() {
        let registry = CommandRegistry::new();
        assert_eq!(
            registry.parse_line("list"),
            ParsedLine::Command(Command::List {
                path: "/".to_owned()
            })
        );
        assert_eq!(
            registry.parse_line("  list   document  "),
            ParsedLine::Command(Command::List {
                path: "document".to_owned()
            })
        );
        assert_eq!(
            registry.parse_line("makeDir notes extra"),
            ParsedLine::Command(Command::MakeDir {
                name: "notes".to_owned()
            })
        );
    }

    #[test]
    fn missing_directory_name_is_forwarded_as_empty() {
        let registry = CommandRegistry::new();
        assert_eq!(
            registry.parse_line("removeDir"),
            ParsedLine::Command(Command::RemoveDir {
                name: String::new()
            })
        );
    }
}
