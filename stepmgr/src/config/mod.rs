//! Controller settings consumed by the step manager.
//!
//! The surrounding controller parses its full configuration elsewhere;
//! this module carries just the slice of it the step manager reads.
//!
//! The expected YAML structure is:
//! ```yaml
//! controller_uid: 64030
//! switch_type: "switch/none"
//! front_end: false
//! fast_schedule: true
//! max_tasks_per_node: 128
//! enforce_partition_limits: false
//! resv_port_range: [12000, 12999]
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

// ── Private YAML deserialization type ─────────────────────────────────────────

/// File layout with per-field defaults so partial configs are accepted.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    controller_uid: u32,
    #[serde(default = "default_switch_type")]
    switch_type: String,
    #[serde(default)]
    front_end: bool,
    #[serde(default = "default_true")]
    fast_schedule: bool,
    #[serde(default = "default_max_tasks")]
    max_tasks_per_node: u32,
    #[serde(default)]
    enforce_partition_limits: bool,
    #[serde(default = "default_port_range")]
    resv_port_range: (u16, u16),
}

fn default_switch_type() -> String {
    String::from("switch/none")
}

fn default_true() -> bool {
    true
}

fn default_max_tasks() -> u32 {
    128
}

fn default_port_range() -> (u16, u16) {
    (12000, 12999)
}

// ── Public configuration ──────────────────────────────────────────────────────

/// Settings the step manager reads on every operation.
#[derive(Debug, Clone)]
pub struct StepmgrConfig {
    /// Uid the controller daemon runs as; always authorised.
    pub controller_uid: u32,
    /// Loaded interconnect plugin, e.g. `"switch/none"` or
    /// `"switch/elan"`.  The `ARBITRARY` task distribution is illegal
    /// under elan and silently downgraded to block.
    pub switch_type: String,
    /// Front-end deployment: one batch host fronts all compute nodes,
    /// and step info reports the job's allocation instead of the
    /// step's.
    pub front_end: bool,
    /// When set, configured node CPU counts are authoritative;
    /// otherwise the counts nodes registered with are used.
    pub fast_schedule: bool,
    /// Upper bound on tasks a single node may host in one step.
    pub max_tasks_per_node: u32,
    /// Reject step time limits above the partition maximum.
    pub enforce_partition_limits: bool,
    /// Inclusive port range steps may reserve from.
    pub resv_port_range: (u16, u16),

    loaded: bool,
}

impl Default for StepmgrConfig {
    fn default() -> Self {
        Self {
            controller_uid: 0,
            switch_type: default_switch_type(),
            front_end: false,
            fast_schedule: true,
            max_tasks_per_node: default_max_tasks(),
            enforce_partition_limits: false,
            resv_port_range: default_port_range(),
            loaded: false,
        }
    }
}

impl StepmgrConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `path` and replace the current settings.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or the YAML is
    /// structurally invalid.
    pub fn load_from_file(&mut self, path: &Path) -> Result<()> {
        info!("Loading step manager configuration from: {}", path.display());

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot open configuration file: {}", path.display()))?;

        let file: ConfigFile = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML file: {}", path.display()))?;

        self.controller_uid = file.controller_uid;
        self.switch_type = file.switch_type;
        self.front_end = file.front_end;
        self.fast_schedule = file.fast_schedule;
        self.max_tasks_per_node = file.max_tasks_per_node;
        self.enforce_partition_limits = file.enforce_partition_limits;
        self.resv_port_range = file.resv_port_range;
        self.loaded = true;

        info!(
            switch_type = %self.switch_type,
            front_end = self.front_end,
            fast_schedule = self.fast_schedule,
            max_tasks_per_node = self.max_tasks_per_node,
            "step manager configuration loaded"
        );
        Ok(())
    }

    /// `true` after a successful [`load_from_file`](Self::load_from_file).
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn yaml_tempfile(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn defaults_are_sane() {
        let cfg = StepmgrConfig::default();
        assert_eq!(cfg.switch_type, "switch/none");
        assert!(!cfg.front_end);
        assert!(cfg.fast_schedule);
        assert_eq!(cfg.max_tasks_per_node, 128);
        assert!(!cfg.is_loaded());
    }

    #[test]
    fn load_full_yaml() {
        let yaml = r#"
controller_uid: 64030
switch_type: "switch/elan"
front_end: true
fast_schedule: false
max_tasks_per_node: 64
enforce_partition_limits: true
resv_port_range: [20000, 20100]
"#;
        let f = yaml_tempfile(yaml);
        let mut cfg = StepmgrConfig::new();
        cfg.load_from_file(f.path()).unwrap();

        assert!(cfg.is_loaded());
        assert_eq!(cfg.controller_uid, 64030);
        assert_eq!(cfg.switch_type, "switch/elan");
        assert!(cfg.front_end);
        assert!(!cfg.fast_schedule);
        assert_eq!(cfg.max_tasks_per_node, 64);
        assert!(cfg.enforce_partition_limits);
        assert_eq!(cfg.resv_port_range, (20000, 20100));
    }

    #[test]
    fn missing_fields_use_defaults() {
        let f = yaml_tempfile("controller_uid: 12\n");
        let mut cfg = StepmgrConfig::new();
        cfg.load_from_file(f.path()).unwrap();
        assert_eq!(cfg.controller_uid, 12);
        assert_eq!(cfg.switch_type, "switch/none");
        assert_eq!(cfg.max_tasks_per_node, 128);
    }

    #[test]
    fn missing_file_returns_error() {
        let mut cfg = StepmgrConfig::new();
        let result = cfg.load_from_file(Path::new("/nonexistent/stepmgr.yaml"));
        assert!(result.is_err());
        assert!(!cfg.is_loaded());
    }

    #[test]
    fn malformed_yaml_returns_error() {
        let f = yaml_tempfile("switch_type: [not: a: string:::");
        let mut cfg = StepmgrConfig::new();
        assert!(cfg.load_from_file(f.path()).is_err());
        assert!(!cfg.is_loaded());
    }
}
