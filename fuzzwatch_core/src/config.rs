use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct InputSettings {
    /// Echo every raw input line to stdout before parsing it.
    #[serde(default = "default_tee")]
    pub tee: bool,
}

fn default_tee() -> bool {
    true
}

impl Default for InputSettings {
    fn default() -> Self {
        Self { tee: default_tee() }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct OutputSettings {
    /// Summary destination. Dumps go to stdout when unset.
    pub path: Option<PathBuf>,
    #[serde(default = "default_pretty")]
    pub pretty: bool,
    /// Seconds between time-based dumps; `0` turns them off.
    #[serde(default = "default_dump_interval_secs")]
    pub dump_interval_secs: u64,
}

fn default_pretty() -> bool {
    true
}

pub fn default_dump_interval_secs() -> u64 {
    180
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            path: None,
            pretty: default_pretty(),
            dump_interval_secs: default_dump_interval_secs(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TriageSettings {
    #[serde(default)]
    pub sink_mode: bool,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzwatchConfig {
    #[serde(default)]
    pub input: InputSettings,
    #[serde(default)]
    pub output: OutputSettings,
    #[serde(default)]
    pub triage: TriageSettings,
}

impl FuzzwatchConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: FuzzwatchConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    /// `value` is the content of the sink-mode environment variable, if set.
    /// Any non-empty value of the sink-mode variable turns sink mode on.
    /// An unset or empty variable leaves the configured value alone.
    pub fn apply_sink_mode_env(&mut self, value: Option<&str>) {
        if value.is_some_and(|v| !v.is_empty()) {
            self.triage.sink_mode = true;
        }
    }

    pub fn dump_interval(&self) -> Option<Duration> {
        match self.output.dump_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_tee_to_stdout_with_periodic_dumps() {
        let config = FuzzwatchConfig::default();
        assert!(config.input.tee);
        assert!(config.output.path.is_none());
        assert!(!config.triage.sink_mode);
        assert_eq!(config.dump_interval(), Some(Duration::from_secs(180)));
    }

    #[test]
    fn parses_kebab_case_sections() {
        let config: FuzzwatchConfig = toml::from_str(
            r#"
            [input]
            tee = false

            [output]
            path = "/work/result.json"
            dump-interval-secs = 0

            [triage]
            sink-mode = true
            "#,
        )
        .unwrap();

        assert!(!config.input.tee);
        assert_eq!(config.output.path, Some(PathBuf::from("/work/result.json")));
        assert!(config.output.pretty, "unspecified fields keep their defaults");
        assert_eq!(config.dump_interval(), None);
        assert!(config.triage.sink_mode);
    }

    #[test]
    fn rejects_unknown_fields() {
        let result: Result<FuzzwatchConfig, _> = toml::from_str("[output]\nfile = \"x.json\"\n");
        assert!(result.is_err(), "typos in config keys should be caught");
    }

    #[test]
    fn load_from_file_reports_bad_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fuzzwatch.toml");
        std::fs::write(&path, "[output\n").unwrap();
        let err = FuzzwatchConfig::load_from_file(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse TOML"));
    }

    #[test]
    fn sink_mode_env_needs_non_empty_value() {
        let mut config = FuzzwatchConfig::default();
        config.apply_sink_mode_env(Some(""));
        assert!(!config.triage.sink_mode);
        config.apply_sink_mode_env(None);
        assert!(!config.triage.sink_mode);
        config.apply_sink_mode_env(Some("on"));
        assert!(config.triage.sink_mode);
    }
}
