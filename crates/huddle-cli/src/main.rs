mod command;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use huddle_client::{
    Applied, Backend, ChannelDirectory, ChannelSession, ClientConfig, HostedBackend, LoadState, Session, ViewSignal,
};
use huddle_types::{ChangeEvent, Message};

use command::Command;

enum Input {
    Line(Option<String>),
    Change(Option<(ChangeEvent, Applied)>),
    Insert(Option<Message>),
    Signal(ViewSignal),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Logs go to stderr so they do not interleave with the chat on stdout
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "huddle=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    // Config
    let config = ClientConfig::from_env()?;
    let email = std::env::var("HUDDLE_EMAIL").context("HUDDLE_EMAIL is not set")?;
    let password = std::env::var("HUDDLE_PASSWORD").context("HUDDLE_PASSWORD is not set")?;

    let backend = HostedBackend::connect(config, &email, &password)
        .await
        .context("sign in failed")?;
    let session = Session::establish(backend).await?;
    info!("Huddle ready for {}", email);

    let mut directory = ChannelDirectory::new(session.clone());
    directory.refresh().await;
    if let Err(e) = directory.watch_inserts().await {
        warn!("Unread counts unavailable: {}", e);
    }
    let (mut view, mut signals) = ChannelSession::new(session.clone());

    print_lines(channel_lines(&directory));
    println!("Type /help for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let open = view.selected_id();
        let input = tokio::select! {
            line = lines.next_line() => Input::Line(line?),
            change = view.next_change() => Input::Change(change),
            insert = directory.next_insert(open) => Input::Insert(insert),
            Some(signal) = signals.recv() => Input::Signal(signal),
        };

        match input {
            Input::Line(None) => break,
            Input::Line(Some(line)) => {
                let cmd = match command::parse(&line) {
                    Ok(Some(cmd)) => cmd,
                    Ok(None) => continue,
                    Err(e) => {
                        println!("! {}", e);
                        continue;
                    }
                };
                match cmd {
                    Command::Quit => break,
                    Command::Logout => {
                        match session.sign_out().await {
                            Ok(()) => break,
                            Err(e) => println!("! Error signing out: {}", e),
                        }
                    }
                    cmd => match run(cmd, &mut directory, &mut view).await {
                        Ok(output) => print_lines(output),
                        Err(e) => println!("! {}", e),
                    },
                }
            }
            Input::Change(Some((event, applied))) => {
                if let Some(line) = change_line(&view, &event, applied) {
                    println!("{}", line);
                }
            }
            Input::Change(None) => println!("! Live updates stopped for this channel."),
            Input::Insert(Some(msg)) => {
                let unread = directory.unread(msg.channel_id);
                if unread > 0 {
                    if let Some(channel) = directory.channels().iter().find(|c| c.id == msg.channel_id) {
                        println!("* #{} has {} unread", channel.name, unread);
                    }
                }
            }
            Input::Insert(None) => warn!("Unread counts stopped updating"),
            Input::Signal(ViewSignal::ScrollToBottom) => {}
            Input::Signal(ViewSignal::MessagesUnavailable { reason, .. }) => {
                println!("! No messages available ({})", reason);
            }
        }
    }

    Ok(())
}

/// Runs one command and returns what it has to say. The user's own sends,
/// edits and deletes are reported here; their feed echoes change nothing.
async fn run<B: Backend>(
    cmd: Command,
    directory: &mut ChannelDirectory<B>,
    view: &mut ChannelSession<B>,
) -> anyhow::Result<Vec<String>> {
    let output = match cmd {
        Command::Say(text) => {
            let sent = view.send_message(&text).await?;
            vec![message_line(view, &sent)]
        }
        Command::Open(name) => {
            let id = channel_id(directory, &name)?;
            directory.open(id, view).await?;
            history_lines(view)
        }
        Command::Join(name) => {
            let id = channel_id(directory, &name)?;
            directory.join(id).await?;
            vec![format!("Joined #{}", name)]
        }
        Command::New(name) => {
            let channel = directory.create_channel(&name).await?;
            vec![format!("Created #{} (join it with /join {})", channel.name, channel.name)]
        }
        Command::Edit { id, body } => {
            let edited = view.edit_message(id, &body).await?;
            vec![format!("(edited) {}", message_line(view, &edited))]
        }
        Command::Delete(id) => {
            view.delete_message(id).await?;
            vec![format!("[{}] (deleted)", id)]
        }
        Command::Filter(text) => {
            directory.set_filter(&text);
            channel_lines(directory)
        }
        Command::Channels => {
            directory.refresh().await;
            channel_lines(directory)
        }
        Command::Help => vec![command::HELP.to_string()],
        Command::Logout | Command::Quit => Vec::new(),
    };
    Ok(output)
}

fn channel_id<B: Backend>(directory: &ChannelDirectory<B>, name: &str) -> anyhow::Result<uuid::Uuid> {
    directory
        .find_by_name(name)
        .map(|c| c.id)
        .with_context(|| format!("no channel named '{}'", name))
}

fn print_lines(lines: Vec<String>) {
    for line in lines {
        println!("{}", line);
    }
}

fn channel_lines<B: Backend>(directory: &ChannelDirectory<B>) -> Vec<String> {
    directory
        .visible_channels()
        .into_iter()
        .map(|channel| {
            let marker = if directory.is_joined(channel.id) { "*" } else { " " };
            match directory.unread(channel.id) {
                0 => format!("{} #{}", marker, channel.name),
                n => format!("{} #{} ({})", marker, channel.name, n),
            }
        })
        .collect()
}

fn history_lines<B: Backend>(view: &ChannelSession<B>) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(channel) = view.selected_channel() {
        lines.push(format!("--- #{} ---", channel.name));
    }
    if view.messages().is_empty() && *view.load_state() == LoadState::Loaded {
        lines.push("(no messages yet)".to_string());
    }
    lines.extend(view.messages().iter().map(|msg| message_line(view, msg)));
    lines
}

fn message_line<B: Backend>(view: &ChannelSession<B>, msg: &Message) -> String {
    format!(
        "[{}] {} <{}> {}",
        msg.id,
        msg.created_at.format("%H:%M"),
        msg.display_name(view.session().user_id()),
        msg.message
    )
}

/// Remote changes only; echoes of the user's own mutations come back
/// `Unchanged` and print nothing.
fn change_line<B: Backend>(view: &ChannelSession<B>, event: &ChangeEvent, applied: Applied) -> Option<String> {
    match (event, applied) {
        (ChangeEvent::Insert(_), Applied::Inserted) => {
            view.store().get(event.message_id()).map(|msg| message_line(view, msg))
        }
        (ChangeEvent::Update(_), Applied::Updated) => view
            .store()
            .get(event.message_id())
            .map(|msg| format!("(edited) {}", message_line(view, msg))),
        (ChangeEvent::Delete { id, .. }, Applied::Deleted) => Some(format!("[{}] (deleted)", id)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_client::{MemoryBackend, MemoryWorld};

    #[tokio::test]
    async fn own_mutations_are_reported_with_ids() {
        let world = MemoryWorld::new();
        let alice = world.add_user("alice@example.com");
        let general = world.add_channel("general").unwrap();
        world.add_member(general.id, alice.id).unwrap();
        let session: Session<MemoryBackend> = Session::new(world.connect(&alice), alice.clone());
        let mut directory = ChannelDirectory::new(session.clone());
        let (mut view, _signals) = ChannelSession::new(session);
        directory.refresh().await;

        let opened = run(Command::Open("general".into()), &mut directory, &mut view).await.unwrap();
        assert_eq!(opened, vec!["--- #general ---".to_string(), "(no messages yet)".to_string()]);

        let said = run(Command::Say("hello".into()), &mut directory, &mut view).await.unwrap();
        let id = view.messages()[0].id;
        assert_eq!(said.len(), 1);
        assert!(said[0].starts_with(&format!("[{}] ", id)));
        assert!(said[0].ends_with("<You> hello"));

        let edited = run(
            Command::Edit {
                id,
                body: "hello again".into(),
            },
            &mut directory,
            &mut view,
        )
        .await
        .unwrap();
        assert!(edited[0].starts_with(&format!("(edited) [{}] ", id)));
        assert!(edited[0].ends_with("<You> hello again"));

        let deleted = run(Command::Delete(id), &mut directory, &mut view).await.unwrap();
        assert_eq!(deleted, vec![format!("[{}] (deleted)", id)]);
        assert!(view.messages().is_empty());
    }

    #[tokio::test]
    async fn echoes_of_own_mutations_print_nothing() {
        let world = MemoryWorld::new();
        let alice = world.add_user("alice@example.com");
        let general = world.add_channel("general").unwrap();
        world.add_member(general.id, alice.id).unwrap();
        let session = Session::new(world.connect(&alice), alice.clone());
        let (mut view, _signals) = ChannelSession::new(session);
        view.select_channel(general).await.unwrap();

        view.send_message("hello").await.unwrap();
        let (event, applied) = view.next_change().await.unwrap();
        assert_eq!(applied, Applied::Unchanged);
        assert_eq!(change_line(&view, &event, applied), None);
    }
}
