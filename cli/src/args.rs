use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Command to run
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Cmd {
    /// Run the server. Needs root, normally through sudo.
    Serve {
        /// Configuration toml file for the server
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Directory holding one subdirectory per user
        root: Option<PathBuf>,

        /// IPv4 address to listen on
        ip: Option<String>,

        /// Port to listen on
        port: Option<u16>,

        /// File receiving the binary transfer audit log
        #[arg(short, long)]
        transfer_log: Option<PathBuf>,
    },
    /// Print a transfer audit log.
    Logs { logs: PathBuf },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positional_arguments_mirror_classic_command_line() {
        let cli = Cli::try_parse_from(["jailshare", "serve", "/srv/share", "0.0.0.0", "9000"]).unwrap();
        assert_eq!(
            cli.cmd,
            Cmd::Serve {
                config: None,
                root: Some(PathBuf::from("/srv/share")),
                ip: Some("0.0.0.0".to_string()),
                port: Some(9000),
                transfer_log: None,
            }
        );
    }

    #[test]
    fn port_must_be_numeric() {
        assert!(Cli::try_parse_from(["jailshare", "serve", "/srv", "0.0.0.0", "http"]).is_err());
    }
}
