/// Terminal configuration
/// Values come from the host's settings layer, either as a JSON settings object
/// or as plain key/value reads. Missing or malformed entries keep their defaults.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

const MIN_CADENCE_MS: u64 = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TerminalConfig {
    /// Preferred shell; tried before `$SHELL` and the platform fallback
    pub shell_path: Option<String>,
    pub max_tabs: usize,
    /// Poll cadence while any tab has the agent running
    pub fast_poll_ms: u64,
    /// Poll cadence while no tab has the agent running
    pub slow_poll_ms: u64,
    /// Silence after which a processing agent is considered idle-but-running
    pub quiet_window_ms: u64,
    pub paste_submit_delay_ms: u64,
    /// How long a launch/banner detection is trusted over a poll that misses the agent
    pub launch_grace_ms: u64,
    pub agent_signature: String,
    pub agent_launch_prefixes: Vec<String>,
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            shell_path: None,
            max_tabs: 5,
            fast_poll_ms: 1000,
            slow_poll_ms: 3000,
            quiet_window_ms: 2000,
            paste_submit_delay_ms: 100,
            launch_grace_ms: 5000,
            agent_signature: "claude".to_string(),
            agent_launch_prefixes: vec!["claude".to_string()],
            cols: 80,
            rows: 24,
        }
    }
}

impl TerminalConfig {
    /// Build a config from flat settings reads (`"maxTabs" -> "5"`)
    pub fn from_settings(settings: &HashMap<String, String>) -> Self {
        let mut config = Self::default();

        if let Some(shell) = settings.get("shellPath") {
            let shell = shell.trim();
            if !shell.is_empty() {
                config.shell_path = Some(shell.to_string());
            }
        }

        read_number(settings, "maxTabs", &mut config.max_tabs);
        read_number(settings, "fastPollMs", &mut config.fast_poll_ms);
        read_number(settings, "slowPollMs", &mut config.slow_poll_ms);
        read_number(settings, "quietWindowMs", &mut config.quiet_window_ms);
        read_number(settings, "pasteSubmitDelayMs", &mut config.paste_submit_delay_ms);
        read_number(settings, "launchGraceMs", &mut config.launch_grace_ms);
        read_number(settings, "cols", &mut config.cols);
        read_number(settings, "rows", &mut config.rows);

        if let Some(signature) = settings.get("agentSignature") {
            let signature = signature.trim();
            if !signature.is_empty() {
                config.agent_signature = signature.to_string();
            }
        }

        if let Some(prefixes) = settings.get("agentLaunchPrefixes") {
            let parsed: Vec<String> = prefixes
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
            if !parsed.is_empty() {
                config.agent_launch_prefixes = parsed;
            }
        }

        config
    }

    /// Build a config from the host's settings object. A malformed object
    /// falls back to defaults as a whole.
    pub fn from_json(settings: &serde_json::Value) -> Self {
        match Self::deserialize(settings) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("invalid terminal settings, using defaults: {e}");
                Self::default()
            }
        }
    }

    pub fn fast_poll(&self) -> Duration {
        Duration::from_millis(self.fast_poll_ms.max(MIN_CADENCE_MS))
    }

    pub fn slow_poll(&self) -> Duration {
        Duration::from_millis(self.slow_poll_ms.max(MIN_CADENCE_MS))
    }

    pub fn quiet_window(&self) -> Duration {
        Duration::from_millis(self.quiet_window_ms)
    }

    pub fn paste_submit_delay(&self) -> Duration {
        Duration::from_millis(self.paste_submit_delay_ms)
    }

    pub fn launch_grace(&self) -> Duration {
        Duration::from_millis(self.launch_grace_ms)
    }
}

fn read_number<T: std::str::FromStr>(settings: &HashMap<String, String>, key: &str, slot: &mut T) {
    let Some(raw) = settings.get(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => log::debug!("ignoring invalid terminal setting {key}={raw:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_settings_keep_defaults() {
        let config: TerminalConfig =
            serde_json::from_str(r#"{ "maxTabs": 3, "shellPath": "/bin/zsh" }"#).unwrap();
        assert_eq!(config.max_tabs, 3);
        assert_eq!(config.shell_path.as_deref(), Some("/bin/zsh"));
        assert_eq!(config.fast_poll_ms, 1000);
        assert_eq!(config.agent_signature, "claude");
    }

    #[test]
    fn key_value_settings_ignore_garbage() {
        let mut settings = HashMap::new();
        settings.insert("maxTabs".to_string(), "seven".to_string());
        settings.insert("slowPollMs".to_string(), " 4000 ".to_string());
        settings.insert("agentLaunchPrefixes".to_string(), "claude, cc ,".to_string());
        settings.insert("shellPath".to_string(), "   ".to_string());

        let config = TerminalConfig::from_settings(&settings);
        assert_eq!(config.max_tabs, 5);
        assert_eq!(config.slow_poll(), Duration::from_millis(4000));
        assert_eq!(config.agent_launch_prefixes, vec!["claude", "cc"]);
        assert_eq!(config.shell_path, None);
    }

    #[test]
    fn malformed_json_object_falls_back_to_defaults() {
        let config = TerminalConfig::from_json(&serde_json::json!({ "maxTabs": "many" }));
        assert_eq!(config, TerminalConfig::default());

        let config = TerminalConfig::from_json(&serde_json::json!({ "agentLaunchPrefixes": ["claude", "ccr"] }));
        assert_eq!(config.agent_launch_prefixes, vec!["claude", "ccr"]);
    }

    #[test]
    fn cadences_are_clamped() {
        let config = TerminalConfig {
            fast_poll_ms: 0,
            ..TerminalConfig::default()
        };
        assert_eq!(config.fast_poll(), Duration::from_millis(MIN_CADENCE_MS));
    }
}
