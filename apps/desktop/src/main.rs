use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    config::{load_settings_from, DEFAULT_SETTINGS_FILE},
    send::AttachmentUpload,
    ClientEvent, ClientHandle, SyncClient,
};
use shared::domain::{ConversationHandle, ConversationId, Message, ProfileId};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Profile id of the local viewer.
    #[arg(long)]
    profile_id: String,
    /// Peer profile id to open, or `chatbot`.
    #[arg(long)]
    conversation: String,
    #[arg(long, default_value = "")]
    display_name: String,
    #[arg(long, default_value = DEFAULT_SETTINGS_FILE)]
    config: PathBuf,
    /// Text to send once the conversation is open.
    #[arg(long)]
    send: Option<String>,
    /// File to attach to the sent message.
    #[arg(long)]
    attach: Option<PathBuf>,
    /// Exit after this many seconds without a new event.
    #[arg(long, default_value_t = 30)]
    watch_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let settings = load_settings_from(&args.config, |key| std::env::var(key).ok());
    info!(server = %settings.server_base_url, "desktop: settings loaded");
    let client = SyncClient::with_http(ProfileId::new(args.profile_id.clone()), settings)?;
    run(&client, &args).await
}

async fn run(client: &dyn ClientHandle, args: &Args) -> Result<()> {
    let events = client.subscribe_events();
    client.start().await;

    let handle = match ConversationId::parse(&args.conversation) {
        ConversationId::Peer(peer) => ConversationHandle::peer(peer, args.display_name.clone()),
        ConversationId::Chatbot => ConversationHandle::chatbot(args.display_name.clone()),
    };
    let outcome = client.switch_to(handle).await?;
    info!(?outcome, "desktop: conversation opened");
    print_timeline(&client.timeline().await);

    if args.send.is_some() || args.attach.is_some() {
        let attachment = match &args.attach {
            Some(path) => Some(read_attachment(path).await?),
            None => None,
        };
        let body = args.send.clone().unwrap_or_default();
        match client.send(&body, attachment).await {
            Ok(confirmed) => println!("sent {}", confirmed.id),
            Err(err) => warn!("desktop: send failed: {err}"),
        }
    }

    let stream = BroadcastStream::new(events).timeout(Duration::from_secs(args.watch_secs));
    tokio::pin!(stream);
    while let Some(Ok(event)) = stream.next().await {
        match event {
            Ok(ClientEvent::TimelineUpdated { messages, .. }) => print_timeline(&messages),
            Ok(ClientEvent::Connectivity(change)) => println!("connectivity: {change:?}"),
            Ok(ClientEvent::SendFailed { provisional_id, reason }) => {
                println!("send {provisional_id} failed: {reason}")
            }
            Ok(ClientEvent::Error(err)) => println!("error: {err}"),
            Err(err) => warn!("desktop: event stream lagged: {err}"),
        }
    }

    client.dispose().await;
    Ok(())
}

async fn read_attachment(path: &PathBuf) -> Result<AttachmentUpload> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read attachment {}", path.display()))?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "attachment".into());
    Ok(AttachmentUpload::new(file_name, "", bytes))
}

fn print_timeline(messages: &[Message]) {
    println!("--- {} messages ---", messages.len());
    for message in messages {
        match serde_json::to_string(message) {
            Ok(line) => println!("{line}"),
            Err(err) => warn!("desktop: failed to render message: {err}"),
        }
    }
}
