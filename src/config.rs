//! Startup configuration.
//!
//! ynit takes all of its configuration from command-line flags; there is no
//! config file. Parsing happens once in `main` and the resulting `Config` is
//! handed to every component that needs it — nothing re-reads a mutable
//! global afterward.

use std::path::PathBuf;

use clap::Parser;

/// Syslog wire format accepted by the built-in syslog sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Rfc3164,
    Rfc5424,
    Rfc6587,
    Auto,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rfc3164" => Ok(LogFormat::Rfc3164),
            "rfc5424" => Ok(LogFormat::Rfc5424),
            "rfc6587" => Ok(LogFormat::Rfc6587),
            "auto" => Ok(LogFormat::Auto),
            other => Err(format!("unknown log format {other:?}")),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "ynit", about = "Minimal PID-1 init for containers")]
struct Cli {
    /// Directory searched for init scripts.
    #[arg(long, default_value = "/etc/ynit")]
    confdir: String,

    /// Enable informational logging to stderr.
    #[arg(long)]
    debug: bool,

    /// Bind the optional syslog sink to this TCP address:port.
    #[arg(long, default_value = "")]
    tcp: String,

    /// Bind the optional syslog sink to this UDP address:port.
    #[arg(long, default_value = "")]
    udp: String,

    /// Bind the optional syslog sink to this UNIX datagram socket path.
    #[arg(long, default_value = "")]
    unix: String,

    /// Syslog wire format: rfc3164, rfc5424, rfc6587, or auto.
    #[arg(long = "log-format", default_value = "rfc3164")]
    log_format: String,
}

#[derive(Debug, Clone)]
pub struct SyslogConfig {
    pub tcp: Option<String>,
    pub udp: Option<String>,
    pub unix: Option<String>,
    pub format: LogFormat,
}

impl SyslogConfig {
    pub fn enabled(&self) -> bool {
        self.tcp.is_some() || self.udp.is_some() || self.unix.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub confdir: PathBuf,
    pub debug: bool,
    pub syslog: SyslogConfig,
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}

pub fn load_config() -> Config {
    let cli = Cli::parse();

    let confdir = cli.confdir.trim_end_matches('/').to_string();
    let format = cli
        .log_format
        .parse()
        .unwrap_or_else(|_| LogFormat::Rfc3164);

    Config {
        confdir: PathBuf::from(confdir),
        debug: cli.debug,
        syslog: SyslogConfig {
            tcp: non_empty(cli.tcp),
            udp: non_empty(cli.udp),
            unix: non_empty(cli.unix),
            format,
        },
    }
}
