use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use ack_chat::client::ChatClient;
use ack_chat::listener::ChatEvent;
use ack_chat::server::{ChatServer, ServerConfig};

#[derive(Parser)]
#[command(name = "ack-chat", version, about = "Chat service with acknowledgment-gated broadcasts")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the chat server.
    Server {
        /// Address to listen on.
        #[arg(long, default_value = "127.0.0.1:50000")]
        bind: SocketAddr,
        /// Per-connection inactivity timeout in seconds.
        #[arg(long, default_value_t = 60)]
        receive_timeout_secs: u64,
    },
    /// Connect as an interactive client. Lines from stdin are broadcast;
    /// `/quit` (or end of input) logs out.
    Client {
        /// Server address.
        #[arg(long, default_value = "127.0.0.1:50000")]
        addr: SocketAddr,
        /// Username to log in with.
        #[arg(long)]
        user: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    match Cli::parse().command {
        Command::Server {
            bind,
            receive_timeout_secs,
        } => {
            let config = ServerConfig {
                bind,
                receive_timeout: Duration::from_secs(receive_timeout_secs),
            };
            let server = ChatServer::bind(config)
                .await
                .with_context(|| format!("binding {bind}"))?;
            server.run().await.context("accept loop failed")?;
        }
        Command::Client { addr, user } => {
            run_client(addr, &user).await?;
        }
    }
    Ok(())
}

enum Step {
    Input(Option<String>),
    Event(Option<ChatEvent>),
}

async fn run_client(addr: SocketAddr, user: &str) -> anyhow::Result<()> {
    let mut client = ChatClient::login(addr, user)
        .await
        .with_context(|| format!("logging in as {user:?} at {addr}"))?;
    println!("logged in as {user}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let step = tokio::select! {
            line = lines.next_line() => Step::Input(line?),
            event = client.next_event() => Step::Event(event),
        };
        match step {
            Step::Input(None) => break,
            Step::Input(Some(line)) => {
                let text = line.trim();
                if text == "/quit" {
                    break;
                }
                if text.is_empty() {
                    continue;
                }
                let server_time_ns = client.send_chat(text).await?;
                println!("(delivered, server time {} \u{b5}s)", server_time_ns / 1_000);
            }
            Step::Event(Some(ChatEvent::Message { from, text })) => {
                println!("{from}: {text}");
            }
            Step::Event(Some(ChatEvent::UserListUpdate { users })) => {
                println!("* online: {}", users.join(", "));
            }
            Step::Event(None) => {
                println!("connection lost");
                return Ok(());
            }
        }
    }

    let message_count = client.logout().await?;
    println!("logged out, {message_count} messages sent");
    Ok(())
}
