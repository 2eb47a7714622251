use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    load_settings, ChatClient, ClientConfig, ClientHandle, PushStatus, SessionEvent, UpdateOrigin,
};
use shared::{
    domain::{ChannelId, GroupId, InvitationId, ServerId, TargetId},
    protocol::Message,
};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "noncord", about = "Terminal client for the noncord chat backend")]
struct Cli {
    /// Client settings file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Overrides `api_base_url`, e.g. http://localhost:8080/api/v1.
    #[arg(long, global = true)]
    api_url: Option<String>,
    /// Where the session tokens are kept.
    #[arg(long, global = true)]
    token_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Login {
        username: String,
        password: String,
    },
    Register {
        username: String,
        email: String,
        password: String,
    },
    Logout,
    Servers,
    Server {
        server_id: String,
    },
    CreateServer {
        name: String,
    },
    CreateChannel {
        server_id: String,
        name: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    Invite {
        server_id: String,
    },
    Join {
        invitation_id: String,
    },
    Messages {
        target_id: String,
        /// Read a group conversation instead of a channel.
        #[arg(long)]
        group: bool,
    },
    Send {
        channel_id: String,
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
    /// Print the channel history, then follow new messages until Ctrl-C.
    Tail {
        channel_id: String,
    },
}

fn target(id: String, group: bool) -> TargetId {
    if group {
        TargetId::Group(GroupId::from(id))
    } else {
        TargetId::Channel(ChannelId::from(id))
    }
}

fn settings(cli: &Cli) -> Result<ClientConfig> {
    let mut settings = load_settings(cli.config.as_deref())?;
    if let Some(api_url) = &cli.api_url {
        settings.api_base_url = api_url.clone();
    }
    if let Some(token_file) = &cli.token_file {
        settings.token_path = Some(token_file.clone());
    }
    if settings.token_path.is_none() {
        let dir = dirs::config_dir().context("no user config directory on this platform")?;
        settings.token_path = Some(dir.join("noncord").join("session.json"));
    }
    Ok(settings)
}

fn print_message(message: &Message) {
    let author = if message.display_name.is_empty() {
        message
            .author
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "you".to_string())
    } else {
        message.display_name.clone()
    };
    println!(
        "[{}] {author}: {}",
        message.created_at.format("%Y-%m-%d %H:%M:%S"),
        message.message
    );
}

/// Cached lists are newest first; terminals read oldest first.
fn print_history(messages: &[Message]) {
    for message in messages.iter().rev() {
        print_message(message);
    }
}

async fn tail(client: &ChatClient, channel_id: ChannelId) -> Result<()> {
    let target = TargetId::Channel(channel_id.clone());
    let mut updates = BroadcastStream::new(client.subscribe_cache());
    let mut session = BroadcastStream::new(client.subscribe_session());
    let mut push = BroadcastStream::new(client.connect_push().await?);

    let history = client.load_channel(&channel_id).await?;
    print_history(&history);
    let mut newest = history.first().map(|m| (m.created_at, m.id.clone()));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(update) = updates.next() => {
                let Ok(update) = update else { continue };
                if update.target != target || update.origin == UpdateOrigin::Removed {
                    continue;
                }
                for message in update.messages.iter().rev() {
                    let key = (message.created_at, message.id.clone());
                    if newest.as_ref().map_or(true, |seen| &key > seen) {
                        print_message(message);
                        newest = Some(key);
                    }
                }
            }
            Some(event) = session.next() => {
                if let Ok(SessionEvent::LoginRequired { notice }) = event {
                    eprintln!("{notice}");
                    break;
                }
            }
            Some(status) = push.next() => match status {
                Ok(PushStatus::Ready) => info!(%channel_id, "tail: live"),
                Ok(PushStatus::Stopped { reason }) => {
                    warn!(%reason, "tail: push stream stopped");
                    break;
                }
                _ => {}
            },
        }
    }

    client.disconnect_push().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();
    let cli = Cli::parse();
    let client = ChatClient::from_config(settings(&cli)?)?;

    match cli.command {
        Command::Login { username, password } => {
            client.login(&username, &password).await?;
            println!("signed in as {username}");
        }
        Command::Register {
            username,
            email,
            password,
        } => {
            client.register(&username, &email, &password).await?;
            println!("registered and signed in as {username}");
        }
        Command::Logout => {
            client.logout().await?;
            println!("signed out");
        }
        Command::Servers => {
            for server in client.list_servers().await? {
                println!("{}\t{}", server.id, server.name);
            }
        }
        Command::Server { server_id } => {
            let server = client.open_server(&ServerId::from(server_id)).await?;
            println!("{} ({})", server.name, server.id);
            if let Some(description) = &server.description {
                println!("{description}");
            }
            for channel in server.ordered_channels() {
                println!("  #{}\t{}", channel.name, channel.id);
            }
        }
        Command::CreateServer { name } => {
            let server = client.create_server(&name).await?;
            println!("created server {}\t{}", server.id, server.name);
        }
        Command::CreateChannel {
            server_id,
            name,
            description,
        } => {
            let channel = client
                .create_channel(&ServerId::from(server_id), &name, &description)
                .await?;
            println!("created channel #{}\t{}", channel.name, channel.id);
        }
        Command::Invite { server_id } => {
            let invitation = client
                .create_invitation(&ServerId::from(server_id))
                .await?;
            println!(
                "invitation {} (expires {})",
                invitation.id, invitation.expires_at
            );
        }
        Command::Join { invitation_id } => {
            let joined = client
                .join_invitation(&InvitationId::from(invitation_id))
                .await?;
            println!("joined {}\t{}", joined.server.id, joined.server.name);
        }
        Command::Messages { target_id, group } => {
            let messages = match target(target_id, group) {
                TargetId::Channel(id) => client.load_channel(&id).await?,
                TargetId::Group(id) => client.load_group(&id).await?,
            };
            print_history(&messages);
        }
        Command::Send { channel_id, text } => {
            let message = client
                .send_message(&TargetId::Channel(ChannelId::from(channel_id)), &text.join(" "))
                .await?;
            print_message(&message);
        }
        Command::Tail { channel_id } => tail(&client, ChannelId::from(channel_id)).await?,
    }

    Ok(())
}
