//! Chat commands understood by the server.
//!
//! A chat line whose first word is a known `!command` is executed by the
//! session table instead of being relayed to the other players.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Start,
    Disconnect,
    /// Everything after the command word, trimmed.
    Name(String),
    /// `None` asks for a random color.
    Color(Option<String>),
    Ping,
    Help,
}

/// Command words and their help text, in the order `!help` lists them.
pub const COMMANDS: &[(&str, &str)] = &[
    ("!start", "Start a synchronized speedrun for everyone"),
    ("!disconnect", "Leave the server"),
    ("!name <name>", "Change your display name"),
    ("!color [name|#hex]", "Change your color, random if omitted"),
    ("!ping", "Show your round-trip time to the server"),
    ("!help", "List the available commands"),
];

/// Parses a chat line. Returns `None` for ordinary chat, including lines that
/// merely start with `!` but name no known command.
pub fn parse(text: &str) -> Option<ChatCommand> {
    let text = text.trim();
    let rest = text.strip_prefix('!')?;
    let (word, argument) = match rest.split_once(char::is_whitespace) {
        Some((word, argument)) => (word, argument.trim()),
        None => (rest, ""),
    };

    let command = match word.to_lowercase().as_str() {
        "start" => ChatCommand::Start,
        "disconnect" => ChatCommand::Disconnect,
        "name" => ChatCommand::Name(argument.to_string()),
        "color" | "colour" => {
            ChatCommand::Color((!argument.is_empty()).then(|| argument.to_string()))
        }
        "ping" => ChatCommand::Ping,
        "help" => ChatCommand::Help,
        _ => return None,
    };
    Some(command)
}
