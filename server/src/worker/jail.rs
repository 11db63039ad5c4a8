//! Lexical path confinement for a logged-in session.
//!
//! Paths are tracked in the session's view of the tree, where `/` is the
//! server root and `/<user>` the user's home. Each resolved path is also
//! rendered as seen by this process (after `chroot`, identical to the view)
//! and as a host path, which is what lock keys and supervisor requests use.
use std::path::{Component, Path, PathBuf};

use crate::errors::PathError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    /// Strictly inside the user's home. Every operation that touches data.
    Home,
    /// Anywhere under the root. Navigation and listing.
    Root,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolved {
    /// Path in the session's view, always absolute.
    pub view: PathBuf,
    /// Path usable for system calls in this process.
    pub local: PathBuf,
    /// Path on the host, shared by every process.
    pub host: PathBuf,
}

#[derive(Debug)]
pub struct Jail {
    host_root: PathBuf,
    fs_root: PathBuf,
    home: PathBuf,
    cwd: PathBuf,
}

impl Jail {
    /// A jail for a process whose root directory has been changed to
    /// `host_root`.
    pub fn chrooted(host_root: impl Into<PathBuf>, username: &str) -> Self {
        Self::new(host_root, "/", username)
    }

    /// `fs_root` is where the server root appears to this process.
    pub fn new(host_root: impl Into<PathBuf>, fs_root: impl Into<PathBuf>, username: &str) -> Self {
        let home = Path::new("/").join(username);
        Self {
            host_root: host_root.into(),
            fs_root: fs_root.into(),
            cwd: home.clone(),
            home,
        }
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    fn render(&self, view: PathBuf) -> Resolved {
        let relative = view.strip_prefix("/").unwrap_or(view.as_path()).to_path_buf();
        Resolved {
            local: self.fs_root.join(&relative),
            host: self.host_root.join(&relative),
            view,
        }
    }

    /// Resolve a relative path typed by the client against the current
    /// directory and check it stays within `scope`.
    pub fn resolve(&self, input: &str, scope: Scope) -> Result<Resolved, PathError> {
        if input.is_empty() {
            return Err(PathError::Empty);
        }
        let path = Path::new(input);
        if path.has_root() {
            return Err(PathError::Absolute(input.to_string()));
        }
        let mut view = self.cwd.clone();
        for component in path.components() {
            match component {
                Component::Normal(part) => view.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !view.pop() {
                        return Err(PathError::Escapes(input.to_string()));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(PathError::Absolute(input.to_string()));
                }
            }
        }
        let permitted = match scope {
            Scope::Home => view.starts_with(&self.home) && view != self.home,
            Scope::Root => true,
        };
        if permitted {
            Ok(self.render(view))
        } else {
            Err(PathError::Escapes(input.to_string()))
        }
    }

    /// Move the current directory. The caller checks the target exists.
    pub fn enter(&mut self, target: &Resolved) {
        self.cwd = target.view.clone();
    }
}
