//! Server configuration: listen address and the client list (UUID,
//! email, level, flow) the user validator needs. CLI/wizard/file-watch
//! surfaces are out of scope; this only covers the JSON shape and the
//! glue that turns it into a running [`UserValidator`].

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::pump::PumpTimeouts;
use crate::user::{Flow, MemoryUser, UserValidator};

#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerSettings,
    pub users: Vec<UserConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServerSettings {
    pub listen: String,
    pub port: u16,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

fn default_idle_timeout_secs() -> u64 {
    300
}

/// One client entry. `flow` follows the wire values `user.rs::Flow`
/// accepts: absent/empty for no flow, `"xtls-rprx-vision"` for Vision.
#[derive(Debug, Serialize, Deserialize)]
pub struct UserConfig {
    pub uuid: String,
    pub email: Option<String>,
    #[serde(default)]
    pub level: u32,
    #[serde(default)]
    pub flow: Option<String>,
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let addr_str = format!("{}:{}", self.server.listen, self.server.port);
        Ok(addr_str.parse()?)
    }

    pub fn pump_timeouts(&self) -> PumpTimeouts {
        PumpTimeouts {
            connection_idle: Duration::from_secs(self.server.idle_timeout_secs),
            ..Default::default()
        }
    }

    /// Builds the runtime user table from the configured client list.
    /// Rejects an unparseable UUID or unsupported flow string up front,
    /// rather than silently dropping the user and only finding out at
    /// connect time.
    pub async fn build_validator(&self) -> Result<Arc<UserValidator>> {
        let validator = UserValidator::new();
        for user in &self.users {
            let uuid = Uuid::parse_str(&user.uuid)
                .map_err(|e| anyhow!("user {} has an invalid uuid: {e}", user.uuid))?;
            let flow = Flow::parse(user.flow.as_deref())
                .ok_or_else(|| anyhow!("user {} has an unsupported flow {:?}", user.uuid, user.flow))?;
            let email = user
                .email
                .clone()
                .unwrap_or_else(|| format!("{}@unspecified", user.uuid));
            validator
                .add(MemoryUser::new(uuid, email, user.level, flow))
                .await
                .map_err(|e| anyhow!("user {} could not be added: {e}", user.uuid))?;
        }
        Ok(validator)
    }

    pub fn default() -> Self {
        Self {
            server: ServerSettings {
                listen: "0.0.0.0".to_string(),
                port: 443,
                idle_timeout_secs: default_idle_timeout_secs(),
            },
            users: vec![UserConfig {
                uuid: Uuid::new_v4().to_string(),
                email: Some("user@example.com".to_string()),
                level: 0,
                flow: Some("xtls-rprx-vision".to_string()),
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_serialization_roundtrips() {
        let config = Config::default();
        let json = config.to_json().unwrap();
        let parsed = Config::from_json(&json).unwrap();

        assert_eq!(config.server.listen, parsed.server.listen);
        assert_eq!(config.server.port, parsed.server.port);
        assert_eq!(config.users.len(), parsed.users.len());
    }

    #[tokio::test]
    async fn build_validator_loads_configured_users() {
        let config = Config::default();
        let validator = config.build_validator().await.unwrap();
        assert_eq!(validator.count().await, 1);
    }

    #[tokio::test]
    async fn build_validator_rejects_unsupported_flow() {
        let mut config = Config::default();
        config.users[0].flow = Some("xtls-rprx-splice".to_string());
        assert!(config.build_validator().await.is_err());
    }
}
