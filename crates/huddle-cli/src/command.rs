use anyhow::{Context, bail};

use huddle_types::MessageId;

/// One line typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Say(String),
    Open(String),
    Join(String),
    New(String),
    Edit { id: MessageId, body: String },
    Delete(MessageId),
    Filter(String),
    Channels,
    Help,
    Logout,
    Quit,
}

pub const HELP: &str = "\
/open <name>       open a joined channel
/join <name>       join a channel
/new <name>        create a channel
/edit <id> <text>  edit one of your messages
/delete <id>       delete one of your messages
/filter [text]     filter the channel list
/channels          list channels
/logout            sign out and exit
/quit              exit
anything else is sent to the open channel";

/// Parses a prompt line. Blank lines yield `None`.
pub fn parse(line: &str) -> anyhow::Result<Option<Command>> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Say(line.to_string())));
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };

    let cmd = match name {
        "open" => Command::Open(required(arg, "/open <name>")?),
        "join" => Command::Join(required(arg, "/join <name>")?),
        "new" => Command::New(required(arg, "/new <name>")?),
        "edit" => {
            let (id, body) = arg.split_once(char::is_whitespace).context("usage: /edit <id> <text>")?;
            Command::Edit {
                id: parse_id(id)?,
                body: body.trim().to_string(),
            }
        }
        "delete" => Command::Delete(parse_id(&required(arg, "/delete <id>")?)?),
        "filter" => Command::Filter(arg.to_string()),
        "channels" => Command::Channels,
        "help" => Command::Help,
        "logout" => Command::Logout,
        "quit" | "exit" => Command::Quit,
        other => bail!("unknown command /{} (try /help)", other),
    };
    Ok(Some(cmd))
}

fn required(arg: &str, usage: &str) -> anyhow::Result<String> {
    if arg.is_empty() {
        bail!("usage: {}", usage);
    }
    Ok(arg.to_string())
}

fn parse_id(text: &str) -> anyhow::Result<MessageId> {
    text.trim()
        .parse()
        .with_context(|| format!("'{}' is not a message id", text.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_said() {
        assert_eq!(parse("hello there\n").unwrap(), Some(Command::Say("hello there".into())));
        assert_eq!(parse("   ").unwrap(), None);
    }

    #[test]
    fn commands_with_arguments() {
        assert_eq!(parse("/open general").unwrap(), Some(Command::Open("general".into())));
        assert_eq!(parse("/new  ops team ").unwrap(), Some(Command::New("ops team".into())));
        assert_eq!(
            parse("/edit 12 fixed typo").unwrap(),
            Some(Command::Edit {
                id: 12,
                body: "fixed typo".into()
            })
        );
        assert_eq!(parse("/delete 7").unwrap(), Some(Command::Delete(7)));
        assert_eq!(parse("/filter").unwrap(), Some(Command::Filter(String::new())));
        assert_eq!(parse("/quit").unwrap(), Some(Command::Quit));
    }

    #[test]
    fn bad_input_is_reported() {
        assert!(parse("/open").is_err());
        assert!(parse("/edit 12").is_err());
        assert!(parse("/delete abc").unwrap_err().to_string().contains("not a message id"));
        assert!(parse("/dance").unwrap_err().to_string().contains("unknown command"));
    }
}
