use std::fs::DirBuilder;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail, ensure};
use tracing::info;

use super::parse;

fn expand_home(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home_dir) = home::home_dir() {
            return home_dir.join(stripped);
        }
    }
    path.to_path_buf()
}

fn resolve(config_root: &Path, path: &Path) -> PathBuf {
    let path = expand_home(path);
    if path.is_relative() {
        config_root.join(path)
    } else {
        path
    }
}

/// Resolve the shared root, creating it world-accessible when it is missing.
fn resolve_root(config_root: &Path, path: &Path) -> Result<PathBuf> {
    let root = resolve(config_root, path);
    match root.try_exists() {
        Ok(true) => {}
        Ok(false) => {
            DirBuilder::new()
                .recursive(true)
                .mode(0o777)
                .create(&root)
                .with_context(|| format!("Unable to create root at \"{}\"", root.display()))?;
            info!(root = %root.display(), "Created server root");
        }
        err => {
            err.context(format!(
                "Could not verify whether root exists at path \"{}\"",
                root.display()
            ))?;
        }
    }
    if !root.is_dir() {
        bail!("Server root at \"{}\" is not a directory", root.display());
    }
    std::fs::canonicalize(&root)
        .with_context(|| format!("Unable to canonicalize root \"{}\"", root.display()))
}

#[derive(Clone, Debug, PartialEq)]
pub struct ServerConfig {
    /// Canonical directory holding one subdirectory per user.
    pub root: PathBuf,
    pub addr: SocketAddrV4,
    pub max_clients: usize,
    pub users_file: PathBuf,
    pub transfer_log: Option<PathBuf>,
}

impl ServerConfig {
    pub const IP_DEFAULT: Ipv4Addr = Ipv4Addr::LOCALHOST;
    pub const PORT_DEFAULT: u16 = 8080;
    pub const PORT_MIN: u16 = 1024;
    pub const MAX_CLIENTS_DEFAULT: usize = 10;
    pub const MAX_CLIENTS_LIMIT: usize = 64;
    pub const USERS_FILE_DEFAULT: &'static str = "users.toml";

    pub(crate) fn validate(config_root: &Path, val: parse::ServerConfig) -> Result<Self> {
        let Some(root) = val.root else {
            bail!("A server root directory is required");
        };
        let root = resolve_root(config_root, Path::new(&root))?;

        let ip = match val.ip {
            Some(ip) => ip
                .parse::<Ipv4Addr>()
                .with_context(|| format!("\"{ip}\" is not a valid IPv4 address"))?,
            None => Self::IP_DEFAULT,
        };

        let port = val.port.unwrap_or(i64::from(Self::PORT_DEFAULT));
        ensure!(
            (i64::from(Self::PORT_MIN)..=i64::from(u16::MAX)).contains(&port),
            "Port must be between {} and {} but found {port}",
            Self::PORT_MIN,
            u16::MAX
        );

        let max_clients = val
            .max_clients
            .unwrap_or(Self::MAX_CLIENTS_DEFAULT as i64);
        ensure!(
            (1..=Self::MAX_CLIENTS_LIMIT as i64).contains(&max_clients),
            "max_clients must be between 1 and {} but found {max_clients}",
            Self::MAX_CLIENTS_LIMIT
        );

        // Workers read the registry from inside the root after login.
        let users_file = PathBuf::from(
            val.users_file
                .as_deref()
                .unwrap_or(Self::USERS_FILE_DEFAULT),
        );
        ensure!(
            users_file
                .components()
                .all(|c| matches!(c, Component::Normal(_))),
            "users_file must be a plain path inside the root but found \"{}\"",
            users_file.display()
        );
        let users_file = root.join(users_file);
        let transfer_log = val
            .transfer_log
            .map(|log| resolve(config_root, Path::new(&log)));

        Ok(Self {
            root,
            addr: SocketAddrV4::new(ip, port as u16),
            max_clients: max_clients as usize,
            users_file,
            transfer_log,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Overrides, parse};
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_fill_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let config = parse("root = \"share\"", dir.path(), Overrides::default()).unwrap();
        let root = std::fs::canonicalize(dir.path().join("share")).unwrap();
        assert_eq!(
            config,
            ServerConfig {
                root: root.clone(),
                addr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8080),
                max_clients: 10,
                users_file: root.join("users.toml"),
                transfer_log: None,
            }
        );
    }

    #[test]
    fn command_line_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let text = r#"
            root = "from-file"
            ip = "10.0.0.1"
            port = 9000
            max_clients = 4
            transfer_log = "transfers.bin"
        "#;
        let overrides = Overrides {
            root: Some(dir.path().join("from-cli")),
            ip: Some("0.0.0.0".to_string()),
            port: None,
        };
        let config = parse(text, dir.path(), overrides).unwrap();
        assert!(config.root.ends_with("from-cli"));
        assert!(!dir.path().join("from-file").exists());
        assert_eq!(config.addr, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 9000));
        assert_eq!(config.max_clients, 4);
        assert_eq!(
            config.transfer_log,
            Some(dir.path().join("transfers.bin"))
        );
    }

    #[test]
    fn root_is_required() {
        let dir = tempfile::tempdir().unwrap();
        assert!(parse("port = 9000", dir.path(), Overrides::default()).is_err());
    }

    #[test]
    fn root_must_be_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("file"), b"").unwrap();
        assert!(parse("root = \"file\"", dir.path(), Overrides::default()).is_err());
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cases = [
            "root = \"r\"\nport = 80",
            "root = \"r\"\nport = 70000",
            "root = \"r\"\nmax_clients = 0",
            "root = \"r\"\nmax_clients = 65",
            "root = \"r\"\nip = \"localhost\"",
            "root = \"r\"\nip = \"::1\"",
            "root = \"r\"\nunknown = 1",
            "root = \"r\"\nusers_file = \"/etc/users.toml\"",
            "root = \"r\"\nusers_file = \"../users.toml\"",
        ];
        for text in cases {
            assert!(
                parse(text, dir.path(), Overrides::default()).is_err(),
                "{text}"
            );
        }
    }
}
