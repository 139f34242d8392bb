use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use finsight_agent::source::ScriptedSource;
use finsight_client::{ChatClient, SubmitOutcome};
use finsight_core::config::Config;
use finsight_core::protocol::StreamEvent;
use finsight_server::{start_server, AppState};

#[derive(Parser)]
#[command(
    name = "finsight",
    about = "Streaming financial-analysis chat: server and terminal client in one binary",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the streaming server
    Serve {
        /// Port to listen on (default: 8710)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Send one message and print the streamed answer
    Chat {
        /// Message to send
        #[arg(short, long)]
        message: String,

        /// Server base URL
        #[arg(long, default_value = "http://127.0.0.1:8710")]
        url: String,

        /// Continue an existing conversation
        #[arg(long)]
        chat_id: Option<String>,

        /// Ticker symbol context for tool execution
        #[arg(long)]
        symbol: Option<String>,
    },

    /// List stored conversations
    Chats {
        /// Server base URL
        #[arg(long, default_value = "http://127.0.0.1:8710")]
        url: String,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    // Load config
    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("finsight.json"));
    let config = Config::load(&config_path)?;

    match cli.command {
        Commands::Serve { port } => {
            let port = port.unwrap_or_else(|| config.port());
            tracing::info!("Starting Finsight server on port {port}");

            let state = Arc::new(AppState::new(
                Arc::new(config),
                Arc::new(ScriptedSource::new()),
            ));
            start_server(state, port).await?;
        }
        Commands::Chat {
            message,
            url,
            chat_id,
            symbol,
        } => {
            let mut client = match chat_id {
                Some(chat_id) => {
                    let mut client = ChatClient::new(url);
                    if !client.restore(&chat_id).await? {
                        anyhow::bail!("restore already in progress");
                    }
                    client
                }
                None => ChatClient::new(url),
            };
            client.set_symbol(symbol);

            let outcome = client
                .submit_with(&message, |event, _messages| print_event(event))
                .await?;
            println!();

            match outcome {
                SubmitOutcome::Completed => {}
                SubmitOutcome::Failed(reason) => anyhow::bail!("stream failed: {reason}"),
                SubmitOutcome::Duplicate => anyhow::bail!("a request is already pending"),
            }
            if let Some(chat_id) = client.chat_id() {
                println!("chat: {chat_id}");
            }
        }
        Commands::Chats { url } => {
            let client = ChatClient::new(url);
            let chats = client.list_chats().await?;
            if chats.is_empty() {
                println!("No stored conversations.");
            }
            for chat in chats {
                println!(
                    "{}  {:>3} exchange(s)  {}  {}",
                    chat.chat_id,
                    chat.exchanges,
                    chat.updated_at.format("%Y-%m-%d %H:%M"),
                    chat.title.as_deref().unwrap_or("(untitled)"),
                );
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
        },
    }

    Ok(())
}

/// Typewriter rendering of a stream: tokens inline, tool lifecycle on its
/// own lines.
fn print_event(event: &StreamEvent) {
    match event {
        StreamEvent::TokenChunk { content } => {
            print!("{content}");
            let _ = std::io::stdout().flush();
        }
        StreamEvent::ToolStart { display_name, .. } => {
            println!("[{display_name}…]");
        }
        StreamEvent::ToolEnd { duration_ms, .. } => {
            println!("[done in {duration_ms}ms]");
        }
        StreamEvent::ToolError { error, .. } => {
            println!("[tool failed: {error}]");
        }
        StreamEvent::TitleGenerated { title } => {
            tracing::debug!(%title, "Title generated");
        }
        StreamEvent::ChatCreated { chat_id } => {
            tracing::debug!(%chat_id, "Conversation created");
        }
        StreamEvent::Done => {}
        StreamEvent::Error { message } => {
            eprintln!("\nerror: {message}");
        }
    }
}
