use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "chatgate")]
#[command(author, version, about = "Streaming conversational inference gateway", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the HTTP streaming API
    Serve {
        /// Override server.host
        #[arg(long)]
        host: Option<String>,

        /// Override server.port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Send one message and stream the reply to stdout
    Chat {
        prompt: String,

        #[arg(long, default_value = "default")]
        session_id: String,

        /// Start the session from an empty history
        #[arg(short = 'n', long)]
        new_context: bool,

        #[arg(long)]
        max_tokens: Option<u32>,

        #[arg(short, long)]
        temperature: Option<f32>,
    },

    /// Chat in a loop within one session
    Interactive {
        #[arg(long, default_value = "default")]
        session_id: String,
    },
}
