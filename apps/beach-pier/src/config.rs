use std::time::Duration;

use rand::seq::SliceRandom;

/// Tunables for the channel service. The defaults match what shipped browser
/// clients expect: a keep-alive comfortably under common proxy idle cutoffs
/// and a session grace period long enough to ride out a back-channel reconnect.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// URL prefix the channel endpoints are mounted under.
    pub base: String,
    /// Optional host prefixes handed to clients for subdomain sharding.
    pub host_prefixes: Vec<String>,
    /// Idle interval after which a bound back channel receives a `["noop"]`.
    pub keep_alive_interval: Duration,
    /// How long a session may sit without any back channel before it closes.
    pub session_timeout_interval: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            base: "/channel".to_string(),
            host_prefixes: Vec::new(),
            keep_alive_interval: Duration::from_secs(20),
            session_timeout_interval: Duration::from_secs(30),
        }
    }
}

impl ChannelConfig {
    /// Normalize the base path: leading slash enforced, trailing slash stripped.
    pub fn normalized(mut self) -> Self {
        if !self.base.starts_with('/') {
            self.base.insert(0, '/');
        }
        while self.base.len() > 1 && self.base.ends_with('/') {
            self.base.pop();
        }
        self
    }

    pub(crate) fn pick_host_prefix(&self) -> Option<String> {
        self.host_prefixes
            .choose(&mut rand::thread_rng())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_path_is_normalized() {
        let config = ChannelConfig {
            base: "channel/".to_string(),
            ..ChannelConfig::default()
        }
        .normalized();
        assert_eq!(config.base, "/channel");

        let config = ChannelConfig {
            base: "/nested/chan///".to_string(),
            ..ChannelConfig::default()
        }
        .normalized();
        assert_eq!(config.base, "/nested/chan");
    }

    #[test]
    fn host_prefix_comes_from_configured_list() {
        let config = ChannelConfig::default();
        assert_eq!(config.pick_host_prefix(), None);

        let config = ChannelConfig {
            host_prefixes: vec!["chan".to_string()],
            ..ChannelConfig::default()
        };
        assert_eq!(config.pick_host_prefix().as_deref(), Some("chan"));
    }
}
