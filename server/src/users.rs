//! Registry of the users allowed to log in, kept as TOML under the server
//! root, plus provisioning of new accounts.
use std::fmt::Display;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::Command;

use nix::unistd::{User, chown};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::errors::UserError;
use crate::privileges::Privileges;

pub const MAX_USERS: usize = 25;
const MAX_NAME: usize = 32;

/// Three-digit octal permission string such as `750`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Mode(u32);

impl Mode {
    pub fn parse(text: &str) -> Option<Self> {
        if text.len() != 3 || !text.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
            return None;
        }
        u32::from_str_radix(text, 8).ok().map(Self)
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:03o}", self.0)
    }
}

impl TryFrom<String> for Mode {
    type Error = UserError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or(UserError::InvalidPermissions(value))
    }
}

impl From<Mode> for String {
    fn from(mode: Mode) -> Self {
        mode.to_string()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserRecord {
    pub name: String,
    pub permissions: Mode,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct UserFile {
    users: Vec<UserRecord>,
}

#[derive(Debug)]
pub struct UserDb {
    path: PathBuf,
    users: Vec<UserRecord>,
}

pub fn validate_username(name: &str) -> Result<(), UserError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if valid_start && valid_rest && name.len() <= MAX_NAME {
        Ok(())
    } else {
        Err(UserError::InvalidName(name.to_string()))
    }
}

impl UserDb {
    /// Load the registry at `path`. A missing file is an empty registry.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, UserError> {
        let mut db = Self {
            path: path.into(),
            users: Vec::new(),
        };
        db.reload()?;
        Ok(db)
    }

    /// Re-read the file so changes made by the supervisor become visible.
    pub fn reload(&mut self) -> Result<(), UserError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(UserError::Read(e)),
        };
        let mut file: UserFile = toml::from_str(&text)?;
        if file.users.len() > MAX_USERS {
            warn!(
                count = file.users.len(),
                "User registry holds too many users, ignoring the excess"
            );
            file.users.truncate(MAX_USERS);
        }
        self.users = file.users;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Point the registry at a new location for the same file, as seen after
    /// the process changed its root directory.
    pub fn relocate(&mut self, path: impl Into<PathBuf>) {
        self.path = path.into();
    }

    pub fn users(&self) -> &[UserRecord] {
        &self.users
    }

    pub fn contains(&self, name: &str) -> bool {
        self.users.iter().any(|user| user.name == name)
    }

    pub fn add(&mut self, record: UserRecord) -> Result<(), UserError> {
        validate_username(&record.name)?;
        if self.contains(&record.name) {
            return Err(UserError::Exists(record.name));
        }
        if self.users.len() >= MAX_USERS {
            return Err(UserError::Full(MAX_USERS));
        }
        self.users.push(record);
        if let Err(e) = self.save() {
            self.users.pop();
            return Err(e);
        }
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<Option<UserRecord>, UserError> {
        let Some(index) = self.users.iter().position(|user| user.name == name) else {
            return Ok(None);
        };
        let record = self.users.remove(index);
        self.save()?;
        Ok(Some(record))
    }

    fn save(&self) -> Result<(), UserError> {
        let text = toml::to_string(&UserFile {
            users: self.users.clone(),
        })?;
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(&self.path)
            .map_err(UserError::Write)?;
        file.write_all(text.as_bytes()).map_err(UserError::Write)
    }

    /// Provision a new user: a system account, a home directory under
    /// `root` with `permissions`, and a registry entry. Partial work is
    /// rolled back when a later step fails.
    #[instrument(skip(self, root, privileges))]
    pub fn create_user(
        &mut self,
        name: &str,
        permissions: &str,
        root: &Path,
        privileges: &Privileges,
    ) -> Result<(), UserError> {
        validate_username(name)?;
        let mode = Mode::parse(permissions)
            .ok_or_else(|| UserError::InvalidPermissions(permissions.to_string()))?;
        self.reload()?;
        if self.contains(name) {
            return Err(UserError::Exists(name.to_string()));
        }
        if self.users.len() >= MAX_USERS {
            return Err(UserError::Full(MAX_USERS));
        }

        let home = root.join(name);
        let _root = privileges.escalate()?;
        run_tool(
            Command::new("useradd")
                .arg("--no-create-home")
                .arg("--home-dir")
                .arg(&home)
                .args(["--shell", "/usr/sbin/nologin", name]),
            "useradd",
        )?;
        if let Err(e) = self.finish_user(name, mode, &home) {
            warn!("Rolling back creation of `{name}`: {e}");
            let _ = fs::remove_dir(&home);
            if let Err(e) = run_tool(Command::new("userdel").arg(name), "userdel") {
                warn!("Rollback left the system account behind: {e}");
            }
            return Err(e);
        }
        info!(home = %home.display(), %mode, "User created");
        Ok(())
    }

    fn finish_user(&mut self, name: &str, mode: Mode, home: &Path) -> Result<(), UserError> {
        fs::create_dir(home).map_err(UserError::Home)?;
        fs::set_permissions(home, fs::Permissions::from_mode(mode.bits()))
            .map_err(UserError::Home)?;
        let account = User::from_name(name)
            .map_err(UserError::Lookup)?
            .ok_or_else(|| UserError::NoAccount(name.to_string()))?;
        chown(home, Some(account.uid), Some(account.gid)).map_err(UserError::Chown)?;
        self.add(UserRecord {
            name: name.to_string(),
            permissions: mode,
        })
    }
}

fn run_tool(command: &mut Command, tool: &'static str) -> Result<(), UserError> {
    let status = command
        .status()
        .map_err(|err| UserError::Spawn { tool, err })?;
    if status.success() {
        Ok(())
    } else {
        Err(UserError::Tool { tool, status })
    }
}
