//! Provisioner settings.
//!
//! Layered from lowest to highest priority: built-in defaults, an optional
//! `flotilla.toml`, then `FLOTILLA_*` environment variables.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, CoreResult};

pub const ENV_APPLIANCE: &str = "FLOTILLA_APPLIANCE";
pub const ENV_BOOT_IMAGE: &str = "FLOTILLA_BOOT_IMAGE";
pub const ENV_NODE_DEBUG: &str = "FLOTILLA_NODE_DEBUG";
pub const ENV_ZONE: &str = "FLOTILLA_ZONE";
pub const ENV_SSH_USER: &str = "FLOTILLA_SSH_USER";
pub const ENV_KEY_NAME: &str = "FLOTILLA_KEY_NAME";

const DEFAULT_SSH_USER: &str = "core";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Appliance image reference. Required to launch nodes.
    pub appliance: Option<String>,
    /// Boot image id; auto-discovered when unset.
    pub boot_image: Option<String>,
    /// Keep nodes that fail health checks alive on destroy, together with
    /// the shared security group and identity they depend on.
    pub node_debug: bool,
    /// Zone override; otherwise the compute API is asked.
    pub zone: Option<String>,
    /// Unprivileged login user on the node OS.
    pub ssh_user: String,
    /// Key pair installed on new instances.
    pub key_name: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            appliance: None,
            boot_image: None,
            node_debug: false,
            zone: None,
            ssh_user: DEFAULT_SSH_USER.to_string(),
            key_name: None,
        }
    }
}

impl Settings {
    /// Load settings from an optional file and the process environment.
    pub fn load(path: Option<&Path>) -> CoreResult<Self> {
        let mut settings = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok());
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        debug!(path = %path.display(), "settings file loaded");
        Ok(settings)
    }

    /// Overlay environment variables, read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v: &String| !v.trim().is_empty());

        if let Some(v) = non_empty(ENV_APPLIANCE) {
            self.appliance = Some(v);
        }
        if let Some(v) = non_empty(ENV_BOOT_IMAGE) {
            self.boot_image = Some(v);
        }
        if let Some(v) = lookup(ENV_NODE_DEBUG) {
            self.node_debug = parse_flag(&v);
        }
        if let Some(v) = non_empty(ENV_ZONE) {
            self.zone = Some(v);
        }
        if let Some(v) = non_empty(ENV_SSH_USER) {
            self.ssh_user = v;
        }
        if let Some(v) = non_empty(ENV_KEY_NAME) {
            self.key_name = Some(v);
        }
    }

    /// The appliance image, which has no implicit default.
    pub fn appliance(&self) -> CoreResult<&str> {
        self.appliance
            .as_deref()
            .ok_or(CoreError::Missing(ENV_APPLIANCE))
    }
}

fn parse_flag(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "" | "0" | "false" | "no" | "off"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let s = Settings::default();
        assert_eq!(s.ssh_user, "core");
        assert!(!s.node_debug);
        assert!(s.appliance.is_none());
    }

    #[test]
    fn appliance_is_required() {
        let s = Settings::default();
        assert!(matches!(s.appliance(), Err(CoreError::Missing(ENV_APPLIANCE))));
    }

    #[test]
    fn env_overrides() {
        let mut s = Settings::default();
        s.apply_env(env(&[
            (ENV_APPLIANCE, "registry.example/flotilla:1.2"),
            (ENV_BOOT_IMAGE, "ami-123"),
            (ENV_NODE_DEBUG, "1"),
            (ENV_ZONE, "us-west-2a"),
        ]));
        assert_eq!(s.appliance().unwrap(), "registry.example/flotilla:1.2");
        assert_eq!(s.boot_image.as_deref(), Some("ami-123"));
        assert!(s.node_debug);
        assert_eq!(s.zone.as_deref(), Some("us-west-2a"));
    }

    #[test]
    fn debug_flag_values() {
        for (value, expected) in [("true", true), ("yes", true), ("0", false), ("false", false), ("", false)] {
            let mut s = Settings::default();
            s.apply_env(env(&[(ENV_NODE_DEBUG, value)]));
            assert_eq!(s.node_debug, expected, "value {value:?}");
        }
    }

    #[test]
    fn file_then_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flotilla.toml");
        std::fs::write(
            &path,
            r#"
appliance = "from-file"
zone = "eu-west-1b"
ssh_user = "admin"
"#,
        )
        .unwrap();

        let mut s = Settings::from_file(&path).unwrap();
        assert_eq!(s.appliance.as_deref(), Some("from-file"));
        assert_eq!(s.ssh_user, "admin");
        assert!(!s.node_debug);

        s.apply_env(env(&[(ENV_APPLIANCE, "from-env")]));
        assert_eq!(s.appliance.as_deref(), Some("from-env"));
        assert_eq!(s.zone.as_deref(), Some("eu-west-1b"));
    }

    #[test]
    fn bad_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flotilla.toml");
        std::fs::write(&path, "node_debug = \"maybe\"").unwrap();
        assert!(matches!(Settings::from_file(&path), Err(CoreError::Parse(_))));
    }
}
