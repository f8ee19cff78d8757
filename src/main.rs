use anyhow::Result;
use chatgate::api::GenerateStreamBody;
use chatgate::cli::{Cli, Commands};
use chatgate::{utils, Gateway, RequestLimits, Settings};
use clap::Parser;
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let mut settings = Settings::new()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&settings.logging.level)),
        )
        .init();

    if let Commands::Serve { host, port } = &cli.command {
        if let Some(host) = host {
            settings.server.host = host.clone();
        }
        if let Some(port) = port {
            settings.server.port = *port;
        }
    }

    let gateway = Gateway::from_settings(settings)?;

    let result = match cli.command {
        Commands::Serve { .. } => gateway.serve().await,
        Commands::Chat {
            prompt,
            session_id,
            new_context,
            max_tokens,
            temperature,
        } => {
            let body = GenerateStreamBody {
                session_id,
                prompt,
                max_tokens,
                temperature,
                new_context,
            };
            stream_reply(&gateway, body).await
        }
        Commands::Interactive { session_id } => handle_interactive(&gateway, session_id).await,
    };

    gateway.shutdown().await?;

    result
}

/// Run one request through the pipeline, printing fragments as they arrive
async fn stream_reply(gateway: &Gateway, body: GenerateStreamBody) -> Result<()> {
    let limits = RequestLimits::from_settings(gateway.settings());
    let request = body.into_request(&limits)?;

    let result = gateway.stream_reply(request, utils::print_fragment).await;
    println!();
    result?;
    Ok(())
}

async fn handle_interactive(gateway: &Gateway, session_id: String) -> Result<()> {
    utils::print_header("Interactive Mode");
    utils::print_info(&format!("Session ID: {}", session_id));
    utils::print_info("Type your messages (/help for commands, Ctrl+C to exit)\n");

    let stdin = io::stdin();
    let mut reader = BufReader::new(stdin);

    loop {
        utils::print_prompt("You: ");
        let mut input = String::new();
        if reader.read_line(&mut input).await? == 0 {
            return Ok(());
        }

        let input = input.trim();
        if input.is_empty() {
            continue;
        }

        match input {
            "/clear" => {
                gateway.store().reset(&session_id).await;
                utils::print_success("Session history cleared\n");
                continue;
            }
            "/history" => {
                for turn in gateway.store().history(&session_id).await {
                    println!("[{}] {}", turn.role(), turn.content());
                }
                println!();
                continue;
            }
            "/help" => {
                println!("Special commands:");
                println!("  /clear    - Clear session history");
                println!("  /history  - Show session history");
                println!("  /help     - Show this help");
                println!("  Ctrl+C    - Exit\n");
                continue;
            }
            _ => {}
        }

        utils::print_prompt("Assistant: ");
        let body = GenerateStreamBody {
            session_id: session_id.clone(),
            prompt: input.to_string(),
            max_tokens: None,
            temperature: None,
            new_context: false,
        };
        if let Err(e) = stream_reply(gateway, body).await {
            utils::print_error(&e.to_string());
        }
    }
}
