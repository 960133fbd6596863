use std::net::{IpAddr, SocketAddr};

use clap::Parser;

/// `repl-daemon server` — the only entry point this binary has.
#[derive(Debug, Parser)]
#[command(name = "repl-daemon", about = "Per-session code execution sandbox daemon")]
pub struct Cli {
    /// Address to bind the HTTP listener to.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Port to bind the HTTP listener to.
    #[arg(long, default_value_t = 8000)]
    pub port: u16,
}

impl Cli {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}
