use serde::Deserialize;

use crate::Overrides;

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub(super) root: Option<String>,
    pub(super) ip: Option<String>,
    pub(super) port: Option<i64>,
    pub(super) max_clients: Option<i64>,
    pub(super) users_file: Option<String>,
    pub(super) transfer_log: Option<String>,
}

impl ServerConfig {
    pub(super) fn apply(&mut self, overrides: Overrides) {
        if let Some(root) = overrides.root {
            self.root = Some(root.to_string_lossy().into_owned());
        }
        if let Some(ip) = overrides.ip {
            self.ip = Some(ip);
        }
        if let Some(port) = overrides.port {
            self.port = Some(i64::from(port));
        }
    }
}
