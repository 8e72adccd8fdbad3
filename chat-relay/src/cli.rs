use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

use crate::{
    registry::CollisionPolicy,
    relay::{DEFAULT_OUTBOUND_CAPACITY, RelayConfig},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, fanning every message out to the other participants.
    Relay(RelayArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RelayArgs {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, env = "CHAT_RELAY_LISTEN", default_value = "0.0.0.0:50051")]
    pub listen: SocketAddr,

    /// Messages queued per recipient before it is treated as too slow.
    #[arg(long, default_value_t = DEFAULT_OUTBOUND_CAPACITY)]
    pub outbound_capacity: usize,

    /// What to do when a second connection claims an identity already in use.
    #[arg(long, value_enum, default_value_t = CollisionPolicy::Replace)]
    pub on_collision: CollisionPolicy,

    /// Keep recipients registered after a failed send instead of evicting them.
    #[arg(long)]
    pub keep_failed_recipients: bool,
}

impl RelayArgs {
    pub fn config(&self) -> RelayConfig {
        RelayConfig {
            outbound_capacity: self.outbound_capacity,
            collision_policy: self.on_collision,
            evict_failed_recipients: !self.keep_failed_recipients,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Name other participants see on your messages.
    #[arg(long)]
    pub name: String,

    /// Address of the relay to connect to.
    #[arg(long, env = "CHAT_RELAY_SERVER", default_value = "127.0.0.1:50051")]
    pub server: SocketAddr,
}
