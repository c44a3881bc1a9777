use anyhow::{anyhow, Result};
use chat_sync::{group_by_age, load_settings, ClientEvent, Session, SyncClient};
use chrono::Local;
use clap::Parser;
use shared::domain::{Channel, Sender, UserId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides `server_url` from chat_sync.toml / environment.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    token: String,
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    user_name: String,
    /// Channel id to open; defaults to the first entry of the directory.
    #[arg(long)]
    channel: Option<String>,
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::ConnectionChanged(state) => println!("[connection] {state:?}"),
        ClientEvent::HistoryUpdated { channel, messages } => {
            if let Some(last) = messages.last() {
                let marker = if last.is_temp { " (sending)" } else { "" };
                println!("[{channel}] {}: {}{marker}", last.sender.name, last.content);
            }
        }
        ClientEvent::SendFailed { channel, reason, .. } => {
            println!("[{channel}] message not sent: {reason}")
        }
        ClientEvent::NotificationReceived(notification) => {
            println!("[notification] {}", notification.message)
        }
        ClientEvent::NotificationsUpdated { unread_count } => {
            println!("[notifications] {unread_count} unread")
        }
        ClientEvent::Error(message) => println!("[error] {message}"),
    }
}

fn pick_channel(channels: &[Channel], wanted: Option<&str>) -> Result<Channel> {
    let found = match wanted {
        Some(id) => channels.iter().find(|channel| channel.id.as_str() == id),
        None => channels.first(),
    };
    found
        .cloned()
        .ok_or_else(|| anyhow!("no matching channel in directory"))
}

async fn print_notifications(client: &SyncClient) -> Result<()> {
    let notifications = client.notifications().await;
    let buckets = group_by_age(&notifications, &Local::now());
    for (label, bucket) in [
        ("today", &buckets.today),
        ("yesterday", &buckets.yesterday),
        ("this week", &buckets.this_week),
        ("older", &buckets.older),
    ] {
        if bucket.is_empty() {
            continue;
        }
        println!("-- {label}");
        for notification in bucket.iter() {
            println!("{}", serde_json::to_string(notification)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    let session = Session::new(args.token);
    let client = SyncClient::from_settings(&settings, &session)?;
    client
        .set_identity(Sender {
            id: UserId::from(args.user_id),
            name: args.user_name,
            avatar: None,
        })
        .await;

    let mut events = client.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(&event);
        }
    });

    client.start(session).await;

    let channels = client.list_channels().await?;
    for channel in &channels {
        println!("{} {:?} {} ({} unread)", channel.id, channel.kind, channel.name, channel.unread_count);
    }
    let channel = pick_channel(&channels, args.channel.as_deref())?;
    println!("Opening {}", channel.name);
    for message in client.select_channel(channel).await? {
        println!("{}: {}", message.sender.name, message.content);
    }
    if let Err(err) = client.load_notifications().await {
        warn!("could not load notifications: {err}");
    }

    println!("Type a message, or /notifications, /read-all, /quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "" => continue,
            "/quit" => break,
            "/notifications" => print_notifications(&client).await?,
            "/read-all" => {
                let summary = client.mark_all_notifications_read().await;
                println!(
                    "cleared {} notifications ({} failed updates)",
                    summary.cleared, summary.failed
                );
            }
            text => {
                if let Err(err) = client.send_message(text).await {
                    println!("send failed: {err}");
                }
            }
        }
    }

    client.shutdown().await;
    Ok(())
}
