use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    config::{load_settings_from, DEFAULT_CONFIG_FILE},
    ClientEvent, ConversationClient, HistoryOutcome, PeersOutcome, SendOutcome,
};
use shared::{
    domain::PeerId,
    protocol::{Message, OutgoingMessage},
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Signed-in user; identifies the push connection.
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    peer: Option<String>,
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[arg(long)]
    api_url: Option<String>,
    #[arg(long)]
    push_url: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Open(PeerId),
    Peers,
    Image {
        path: PathBuf,
        caption: Option<String>,
    },
    Send(String),
    Quit,
    Help,
}

impl Command {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Some(Self::Send(line.to_string()));
        };
        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest, ""),
        };
        match (name, arg) {
            ("peer", id) if !id.is_empty() => Some(Self::Open(PeerId::new(id))),
            ("peers", _) => Some(Self::Peers),
            ("image", arg) if !arg.is_empty() => {
                let (path, caption) = match arg.split_once(char::is_whitespace) {
                    Some((path, caption)) => (path, Some(caption.trim().to_string())),
                    None => (arg, None),
                };
                Some(Self::Image {
                    path: PathBuf::from(path),
                    caption: caption.filter(|c| !c.is_empty()),
                })
            }
            ("quit" | "exit", _) => Some(Self::Quit),
            _ => Some(Self::Help),
        }
    }
}

fn render(message: &Message) -> String {
    let mut line = format!(
        "[{}] {}: {}",
        message.created_at.format("%H:%M"),
        message.sender_id,
        message.text.as_deref().unwrap_or_default()
    );
    if message.image.is_some() {
        line.push_str(" [image]");
    }
    line
}

fn print_events(client: &Arc<ConversationClient>) {
    let mut events = client.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ClientEvent::HistoryReplaced { peer_id, messages }) => {
                    println!("--- conversation with {peer_id} ({} messages)", messages.len());
                    for message in &messages {
                        println!("{}", render(message));
                    }
                }
                Ok(ClientEvent::MessageAppended(message)) => println!("{}", render(&message)),
                Ok(ClientEvent::PeersUpdated(peers)) => {
                    for peer in peers {
                        println!("  {}  {}", peer.id, peer.full_name);
                    }
                }
                Ok(ClientEvent::Notification(notification)) => {
                    eprintln!("! {}", notification.message)
                }
                Ok(ClientEvent::PushChannelClosed) => {
                    eprintln!("! live updates stopped; the push connection closed")
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "cli: event printer lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn run_command(client: &Arc<ConversationClient>, command: Command) -> Result<bool> {
    match command {
        Command::Open(peer_id) => {
            if let HistoryOutcome::Skipped = client.open_conversation(peer_id).await {
                eprintln!("! peer id must not be blank");
            }
        }
        Command::Peers => {
            if let PeersOutcome::Loaded { count: 0 } = client.load_peers().await {
                println!("  (no users)");
            }
        }
        Command::Image { path, caption } => {
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let mime_type = mime_guess::from_path(&path)
                .first_raw()
                .unwrap_or("application/octet-stream");
            let payload = OutgoingMessage {
                text: caption,
                image: None,
            }
            .with_image_bytes(&bytes, mime_type);
            report_send(client.send_message(&payload).await);
        }
        Command::Send(text) => {
            report_send(client.send_message(&OutgoingMessage::text(text)).await);
        }
        Command::Quit => return Ok(false),
        Command::Help => {
            println!("commands: /peer <id>, /peers, /image <path> [caption], /quit");
        }
    }
    Ok(true)
}

fn report_send(outcome: SendOutcome) {
    match outcome {
        SendOutcome::Skipped => eprintln!("! open a conversation first with /peer <id>"),
        SendOutcome::Rejected(err) => eprintln!("! {err}"),
        SendOutcome::NotDisplayed(message) => {
            println!("(delivered to {})", message.receiver_id)
        }
        _ => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = load_settings_from(&args.config);
    if let Some(api_url) = args.api_url {
        settings.api_base_url = api_url;
    }
    if let Some(push_url) = args.push_url {
        settings.push_url = Some(push_url);
    }

    let user_id = PeerId::new(args.user_id);
    let client = ConversationClient::connect(&settings, &user_id)
        .await
        .with_context(|| format!("connecting to {}", settings.api_base_url))?;
    print_events(&client);
    println!("signed in as {user_id}; /peers lists users, /peer <id> opens a conversation");

    if let Some(peer) = args.peer {
        run_command(&client, Command::Open(PeerId::new(peer))).await?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(command) = Command::parse(&line) else {
            continue;
        };
        match run_command(&client, command).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => eprintln!("! {err:#}"),
        }
    }

    client.reset();
    Ok(())
}
