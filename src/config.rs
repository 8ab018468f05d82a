//! Session configuration

use crate::error::{Result, SessionError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// ICE server entry as entered by the user
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceServerConfig {
    /// Either "stun" or "turn"
    #[serde(rename = "type")]
    pub kind: String,
    /// Server URL; the scheme is added from `kind` when missing
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            kind: "stun".into(),
            url: url.into(),
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            kind: "turn".into(),
            url: url.into(),
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    /// URL with a `stun:`/`turn:` scheme, added from `kind` when absent
    pub fn url_with_scheme(&self) -> String {
        if self.url.starts_with("turn:")
            || self.url.starts_with("turns:")
            || self.url.starts_with("stun:")
            || self.url.starts_with("stuns:")
        {
            self.url.clone()
        } else {
            let scheme = if self.kind == "turn" { "turn:" } else { "stun:" };
            format!("{}{}", scheme, self.url)
        }
    }

    fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(SessionError::Config("ICE server URL cannot be empty".into()));
        }
        match self.kind.as_str() {
            "stun" => Ok(()),
            "turn" if self.username.is_none() || self.credential.is_none() => Err(
                SessionError::Config("TURN servers require username and credential".into()),
            ),
            "turn" => Ok(()),
            other => Err(SessionError::Config(format!(
                "unknown ICE server type '{other}'"
            ))),
        }
    }
}

/// Configuration for one session controller
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub ice_servers: Vec<IceServerConfig>,

    /// Label of the multiplexed data channel
    pub data_channel_label: String,

    /// Deadline for the offer/answer exchange to reach Connected; `None` waits forever
    pub negotiation_timeout_secs: Option<u64>,

    /// How long a dropped connection may take to recover before it is reported as failed
    pub grace_period_secs: u64,

    /// Sender name attached to outgoing chat messages; defaults to the role label
    pub display_name: Option<String>,

    /// Capacity of the session event broadcast
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                IceServerConfig::stun("stun:stun.l.google.com:19302"),
                IceServerConfig::stun("stun:stun1.l.google.com:19302"),
            ],
            data_channel_label: "session-data".to_string(),
            negotiation_timeout_secs: Some(30),
            grace_period_secs: 10,
            display_name: None,
            event_capacity: 256,
        }
    }
}

impl SessionConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: SessionConfig =
            toml::from_str(s).map_err(|e| SessionError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SessionError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        for server in &self.ice_servers {
            server.validate()?;
        }
        if self.data_channel_label.is_empty() {
            return Err(SessionError::Config(
                "data channel label cannot be empty".into(),
            ));
        }
        if self.negotiation_timeout_secs == Some(0) {
            return Err(SessionError::Config(
                "negotiation timeout must be positive".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(SessionError::Config("event capacity must be positive".into()));
        }
        Ok(())
    }

    pub fn negotiation_timeout(&self) -> Option<Duration> {
        self.negotiation_timeout_secs.map(Duration::from_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.grace_period(), Duration::from_secs(10));
        assert_eq!(config.negotiation_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_url_scheme_is_added() {
        assert_eq!(
            IceServerConfig::stun("stun.example.org:3478").url_with_scheme(),
            "stun:stun.example.org:3478"
        );
        assert_eq!(
            IceServerConfig::turn("turn.example.org", "u", "p").url_with_scheme(),
            "turn:turn.example.org"
        );
        assert_eq!(
            IceServerConfig::stun("stun:already.example.org").url_with_scheme(),
            "stun:already.example.org"
        );
    }

    #[test]
    fn test_turn_requires_credentials() {
        let mut config = SessionConfig::default();
        config.ice_servers.push(IceServerConfig {
            kind: "turn".into(),
            url: "turn.example.org".into(),
            username: Some("user".into()),
            credential: None,
        });
        assert!(matches!(config.validate(), Err(SessionError::Config(_))));
    }

    #[test]
    fn test_from_toml() {
        let config = SessionConfig::from_toml_str(
            r#"
            data_channel_label = "clinic"
            negotiation_timeout_secs = 5
            display_name = "Dr. Lee"

            [[ice_servers]]
            type = "turn"
            url = "turn.example.org:3478"
            username = "alice"
            credential = "secret"
            "#,
        )
        .unwrap();
        assert_eq!(config.data_channel_label, "clinic");
        assert_eq!(config.negotiation_timeout_secs, Some(5));
        assert_eq!(config.grace_period_secs, 10);
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.display_name.as_deref(), Some("Dr. Lee"));
    }

    #[test]
    fn test_from_toml_rejects_invalid() {
        let err = SessionConfig::from_toml_str("event_capacity = 0").unwrap_err();
        assert!(matches!(err, SessionError::Config(_)));
    }
}
