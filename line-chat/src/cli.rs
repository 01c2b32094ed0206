use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::session::SessionConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat server, accepting TCP connections.
    Server(ServerArgs),
    /// Connect to a server and participate in the chat.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:3333")]
    pub listen: SocketAddr,

    /// Messages that may queue up for one client before it is dropped as too slow.
    #[arg(long, default_value_t = 64)]
    pub outbound_capacity: usize,

    /// Milliseconds a single write to a client may take.
    #[arg(long, default_value_t = 5000)]
    pub write_timeout_ms: u64,
}

impl ServerArgs {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            outbound_capacity: self.outbound_capacity,
            write_timeout: Duration::from_millis(self.write_timeout_ms),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Which server to connect to.
    #[arg(long, default_value = "localhost:3333")]
    pub server: String,

    /// Display name. Asked for on stdin when omitted.
    #[arg(long)]
    pub name: Option<String>,
}
