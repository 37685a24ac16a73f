mod chat;
mod client;
mod config;
mod error;
mod framing;
mod protocol;
mod server;
mod ui;
mod upstream;

use anyhow::Context;
use chat::{ChatSession, TurnOutcome};
use clap::{Parser, Subcommand};
use client::{ClientConfig, CoachClient, Notice};
use config::{ChatArgs, ServeArgs};
use std::io::Write;

#[derive(Parser)]
#[command(name = "coach", about = "Streaming relay and terminal client for the AI coach")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay in front of the completion provider
    Serve(ServeArgs),
    /// Chat with the coach through a running relay
    Chat(ChatArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => {
            init_tracing("info,coach_relay=debug");
            let auth_token = config::resolve_server_token(args.token.clone())
                .context("failed to resolve relay token")?;
            server::run(server::ServerConfig {
                listen: args.listen.clone(),
                auth_token,
                upstream: args.upstream(),
            })
            .await
        }
        Command::Chat(args) => {
            let token = config::resolve_client_token(args.token)
                .ok_or_else(|| anyhow::anyhow!(Notice::LoginRequired.text()))?;
            let client = CoachClient::new(ClientConfig {
                base_url: args.url,
                token,
            });

            match args.prompt {
                Some(prompt) => {
                    init_tracing("warn");
                    ask_once(&client, &prompt).await
                }
                // Raw mode owns the terminal; only log when asked to.
                None => {
                    init_tracing("off");
                    ui::run_tui(client)
                }
            }
        }
    }
}

fn init_tracing(default_filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn ask_once(client: &CoachClient, prompt: &str) -> anyhow::Result<()> {
    let mut session = ChatSession::new();
    let mut printed = 0;
    let mut stdout = std::io::stdout();

    let outcome = session
        .send(client, prompt, |reply| {
            let _ = write!(stdout, "{}", &reply.content[printed..]);
            let _ = stdout.flush();
            printed = reply.content.len();
        })
        .await?;

    match outcome {
        TurnOutcome::Completed(_) => {
            println!();
            Ok(())
        }
        TurnOutcome::Failed(notice) => anyhow::bail!(notice.text()),
    }
}
