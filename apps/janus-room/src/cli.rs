use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser};
use janus_client::IceServer;

use crate::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "janus-room",
    about = "Publish into a Janus video room and optionally subscribe to a peer",
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "JANUS_URL",
        default_value = "http://127.0.0.1:8088/janus",
        help = "Root URL of the gateway's HTTP API"
    )]
    pub url: String,

    #[arg(long, env = "JANUS_ROOM", default_value_t = 1234, help = "Video room to join")]
    pub room: u64,

    #[arg(
        long,
        env = "JANUS_DISPLAY",
        default_value = "janus-room",
        help = "Display name announced when joining"
    )]
    pub display: String,

    #[arg(long, help = "Also subscribe to the first publisher already in the room")]
    pub subscribe: bool,

    #[arg(
        long = "duration-secs",
        value_name = "SECS",
        default_value_t = 600,
        help = "How long to exchange media before tearing down"
    )]
    pub duration_secs: u64,

    #[arg(
        long = "ice-server",
        value_name = "URL",
        help = "STUN/TURN server URL; repeat for several"
    )]
    pub ice_servers: Vec<String>,

    #[arg(
        long = "ice-username",
        env = "JANUS_ICE_USERNAME",
        requires = "ice_credential",
        help = "Username for the turn: and turns: servers"
    )]
    pub ice_username: Option<String>,

    #[arg(
        long = "ice-credential",
        env = "JANUS_ICE_CREDENTIAL",
        requires = "ice_username",
        hide_env_values = true,
        help = "Credential for the turn: and turns: servers"
    )]
    pub ice_credential: Option<String>,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

impl Cli {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    /// STUN servers never authenticate, so credentials only go to TURN urls.
    pub fn ice_servers(&self) -> Vec<IceServer> {
        self.ice_servers
            .iter()
            .map(|url| {
                let mut server = IceServer::new(url);
                if url.starts_with("turn:") || url.starts_with("turns:") {
                    server.username = self.ice_username.clone();
                    server.credential = self.ice_credential.clone();
                }
                server
            })
            .collect()
    }
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "JANUS_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "JANUS_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}
