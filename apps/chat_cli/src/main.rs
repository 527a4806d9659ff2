use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chat_client::{
    credentials::{load_persisted, persist},
    load_settings, ChatSession, Credential, CredentialSource, FileUpload, SessionEvent,
};
use clap::Parser;
use shared::domain::{Message, MessageBody, RoomId, UserId};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Settings file; defaults to ./chat.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "chat-credentials.json")]
    credentials: PathBuf,
    #[arg(long, requires = "token")]
    user_id: Option<i64>,
    #[arg(long, requires = "user_id")]
    token: Option<String>,
    /// Store the supplied token in the credentials file.
    #[arg(long)]
    remember: bool,
    /// Room to open; lines read from stdin are sent to it.
    #[arg(long)]
    room: Option<i64>,
    /// List archived conversations and exit.
    #[arg(long)]
    archived: bool,
}

fn resolve_credential(args: &Args) -> Result<Credential> {
    if let (Some(user_id), Some(token)) = (args.user_id, args.token.as_deref()) {
        let credential = Credential::new(UserId(user_id), token);
        if args.remember {
            persist(&args.credentials, &credential)?;
        }
        return Ok(credential);
    }
    match load_persisted(&args.credentials)? {
        Some(credential) => Ok(credential),
        None => bail!(
            "no credential in '{}'; pass --user-id and --token",
            args.credentials.display()
        ),
    }
}

fn render(message: &Message) -> String {
    let marker = if message.key.is_pending() { "…" } else { " " };
    let body = match &message.body {
        MessageBody::Text { text } => text.clone(),
        MessageBody::File { name, caption, .. } => match caption {
            Some(caption) => format!("[file {name}] {caption}"),
            None => format!("[file {name}]"),
        },
    };
    format!(
        "{marker}{} #{} user {}: {body}",
        message.sent_at.format("%H:%M:%S"),
        message.room_id,
        message.sender_id
    )
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::ConnectionChanged(state) => println!("-- connection: {state:?}"),
        SessionEvent::MessageUpserted { message, .. } => println!("{}", render(message)),
        SessionEvent::MessageReplaced { message, .. } => println!("{}", render(message)),
        SessionEvent::MessageRemoved { room_id, .. } => {
            println!("-- #{room_id}: a message could not be sent")
        }
        SessionEvent::UnreadChanged { room_id, unread } => {
            println!("-- #{room_id}: {unread} unread")
        }
        SessionEvent::TypingChanged { room_id, users } if !users.is_empty() => {
            let names: Vec<String> = users.iter().map(|user| user.to_string()).collect();
            println!("-- #{room_id}: {} typing", names.join(", "))
        }
        SessionEvent::SessionExpired => println!("-- session expired, sign in again"),
        SessionEvent::Error(err) => println!("-- error: {err}"),
        _ => {}
    }
}

async fn send_file(session: &ChatSession, room_id: RoomId, input: &str) -> Result<()> {
    let (path, caption) = match input.split_once(' ') {
        Some((path, caption)) => (path, Some(caption.trim())),
        None => (input, None),
    };
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read '{path}'"))?;
    let file_name = Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string());
    session
        .send_file_message(room_id, FileUpload::new(file_name, bytes), caption)
        .await?;
    Ok(())
}

async fn chat_loop(session: &ChatSession, room_id: RoomId) -> Result<()> {
    for message in session.open_room(room_id).await? {
        println!("{}", render(&message));
    }
    println!("-- type to send, '/file <path> [caption]' to upload, '/quit' to leave");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        let sent = match line.strip_prefix("/file ") {
            Some(input) => send_file(session, room_id, input.trim()).await,
            None => session
                .send_message(room_id, line)
                .await
                .map(|_| ())
                .map_err(Into::into),
        };
        if let Err(err) = sent {
            warn!("send failed: {err:#}");
        }
    }
    session.close_room(room_id);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let settings = load_settings(args.config.as_deref())?;
    let credential = resolve_credential(&args)?;
    let credentials = CredentialSource::new(Some(credential.clone()));
    let session = ChatSession::from_settings(&settings, credentials)?;

    let mut events = session.subscribe_events();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!("dropped {skipped} session events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let rooms = session.login(credential).await?;
    println!("Logged in, {} rooms", rooms.len());
    for room in &rooms {
        println!(
            "  #{} {} ({} unread){}",
            room.room_id,
            room.title.as_deref().unwrap_or("untitled"),
            room.unread_count,
            if room.can_send_messages { "" } else { " read-only" }
        );
    }

    if args.archived {
        for room in session.archived_chats().await? {
            println!(
                "  archived #{} {}",
                room.room_id,
                room.title.as_deref().unwrap_or("untitled")
            );
        }
    } else if let Some(room) = args.room {
        chat_loop(&session, RoomId(room)).await?;
    }

    session.logout().await;
    printer.abort();
    Ok(())
}
