//! Server configuration and command line

use std::path::PathBuf;

use clap::Parser;

/// How many successive ports to try when the requested one is taken.
pub const PORT_SEARCH_SPAN: u16 = 100;

/// Command-line options
#[derive(Debug, Parser)]
#[command(name = "dvr-server", version, about = "Playback server for TPS-format DVR recordings")]
pub struct Options {
    /// Port to listen on (the next 100 are tried on conflict)
    #[arg(long, default_value_t = 8000)]
    pub port: u16,

    /// Initial recording volume path (may be empty)
    #[arg(long, default_value = "")]
    pub path: String,

    /// Verbose logging
    #[arg(long)]
    pub debug: bool,

    /// Do not open the browser UI after the listener is up
    #[arg(long)]
    pub no_browser: bool,
}

/// Resolved server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host address to bind to
    pub host: String,

    /// First port to try
    pub port: u16,

    /// Working directory; holds `settings.toml` and the index cache
    pub workdir: PathBuf,

    /// Verbose logging enabled
    pub debug: bool,

    /// Open the browser once listening
    pub open_browser: bool,
}

impl ServerConfig {
    pub fn from_options(opts: &Options, workdir: PathBuf) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: opts.port,
            workdir,
            debug: opts.debug,
            open_browser: !opts.no_browser,
        }
    }

    pub fn socket_addr(&self, port: u16) -> String {
        format!("{}:{}", self.host, port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            workdir: PathBuf::from("."),
            debug: false,
            open_browser: true,
        }
    }
}
