use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::paths::Paths;
use crate::sandbox::network::HostPattern;
use crate::sandbox::policy::{
    DEFAULT_ASK_TIMEOUT_MS, FilesystemOptions, NetworkMode, NetworkOptions, SandboxOptions,
    expand_path,
};
use crate::sandbox::{DEFAULT_FILTER_CACHE_CAPACITY, DEFAULT_VIOLATION_CAPACITY};

/// List-valued keys edited with `config add` / `config remove`.
pub const LIST_KEYS: &[&str] = &[
    "sandbox.filesystem.allow_write",
    "sandbox.filesystem.allow_read",
    "sandbox.filesystem.deny_write",
    "sandbox.filesystem.deny_read",
    "sandbox.network.allowed_hosts",
    "sandbox.network.denied_hosts",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Resolved XDG-compliant paths (not serialized)
    #[serde(skip)]
    pub paths: Paths,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Enable shell command sandboxing (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Sandbox level: "auto" | "full" | "standard" | "minimal" | "none"
    #[serde(default = "default_sandbox_level")]
    pub level: String,

    /// Shell used to run wrapped commands
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Explicit path to the apply helper (overrides lookup)
    #[serde(default)]
    pub apply_helper: Option<String>,

    /// Timeout for `shellfence run` in seconds (default: 120)
    #[serde(default = "default_sandbox_timeout")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub filesystem: SandboxFilesystemConfig,

    #[serde(default)]
    pub network: SandboxNetworkConfig,

    #[serde(default)]
    pub cache: SandboxCacheConfig,

    #[serde(default)]
    pub violations: SandboxViolationsConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxFilesystemConfig {
    /// Additional writable paths
    #[serde(default)]
    pub allow_write: Vec<String>,

    /// Readable roots. Empty means the whole filesystem.
    #[serde(default)]
    pub allow_read: Vec<String>,

    #[serde(default)]
    pub deny_write: Vec<String>,

    #[serde(default)]
    pub deny_read: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxNetworkConfig {
    /// Network mode: "allow-list" | "deny-list" | "disabled"
    #[serde(default)]
    pub mode: NetworkMode,

    #[serde(default)]
    pub allowed_hosts: Vec<String>,

    #[serde(default)]
    pub denied_hosts: Vec<String>,

    /// Upper bound on an interactive host decision
    #[serde(default = "default_ask_timeout_ms")]
    pub ask_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxCacheConfig {
    /// Compiled filters kept in memory (default: 32)
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxViolationsConfig {
    /// Entries kept in memory (default: 1000)
    #[serde(default = "default_violation_capacity")]
    pub capacity: usize,

    /// Append every violation to state_dir/violations.jsonl
    #[serde(default = "default_true")]
    pub persist: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_true() -> bool {
    true
}
fn default_sandbox_level() -> String {
    "auto".to_string()
}
fn default_shell() -> String {
    "/bin/bash".to_string()
}
fn default_sandbox_timeout() -> u64 {
    120
}
fn default_ask_timeout_ms() -> u64 {
    DEFAULT_ASK_TIMEOUT_MS
}
fn default_cache_capacity() -> usize {
    DEFAULT_FILTER_CACHE_CAPACITY
}
fn default_violation_capacity() -> usize {
    DEFAULT_VIOLATION_CAPACITY
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            level: default_sandbox_level(),
            shell: default_shell(),
            apply_helper: None,
            timeout_secs: default_sandbox_timeout(),
            filesystem: SandboxFilesystemConfig::default(),
            network: SandboxNetworkConfig::default(),
            cache: SandboxCacheConfig::default(),
            violations: SandboxViolationsConfig::default(),
        }
    }
}

impl Default for SandboxNetworkConfig {
    fn default() -> Self {
        Self {
            mode: NetworkMode::default(),
            allowed_hosts: Vec::new(),
            denied_hosts: Vec::new(),
            ask_timeout_ms: default_ask_timeout_ms(),
        }
    }
}

impl Default for SandboxCacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
        }
    }
}

impl Default for SandboxViolationsConfig {
    fn default() -> Self {
        Self {
            capacity: default_violation_capacity(),
            persist: default_true(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl SandboxConfig {
    /// Caller options equivalent to this config section.
    pub fn to_options(&self) -> SandboxOptions {
        fn list(items: &[String]) -> Option<Vec<String>> {
            (!items.is_empty()).then(|| items.to_vec())
        }

        let fs = &self.filesystem;
        let net = &self.network;
        SandboxOptions {
            filesystem: FilesystemOptions {
                allow_write: list(&fs.allow_write),
                allow_read: list(&fs.allow_read),
                deny_write: list(&fs.deny_write),
                deny_read: list(&fs.deny_read),
            },
            network: NetworkOptions {
                mode: Some(net.mode),
                allowed_hosts: list(&net.allowed_hosts),
                denied_hosts: list(&net.denied_hosts),
                ask_timeout_ms: Some(net.ask_timeout_ms),
            },
            ask_callback: None,
            replace: false,
        }
    }

    /// Apply helper override with `$VAR` / `${VAR}` expanded.
    pub fn apply_helper_path(&self) -> Option<PathBuf> {
        self.apply_helper
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|s| PathBuf::from(expand_env(s)))
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(Paths::resolve()?)
    }

    /// Load config.toml under `paths`, writing the template on first run.
    pub fn load_from(paths: Paths) -> Result<Self> {
        paths.ensure_dirs()?;
        let path = paths.config_file();

        if !path.exists() {
            // Create default config file on first run
            let config = Config {
                paths,
                ..Config::default()
            };
            config.save_with_template()?;
            return Ok(config);
        }

        let content = fs::read_to_string(&path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.paths = paths;

        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = self.paths.config_file();

        // Create parent directories
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;

        Ok(())
    }

    /// Save config with a helpful template (for first-time setup)
    pub fn save_with_template(&self) -> Result<()> {
        let path = self.paths.config_file();

        // Create parent directories
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&path, DEFAULT_CONFIG_TEMPLATE)?;
        eprintln!("Created default config at {}", path.display());

        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let paths = Paths::resolve()?;
        Ok(paths.config_file())
    }

    fn list(&self, key: &str) -> Option<&Vec<String>> {
        let fs = &self.sandbox.filesystem;
        let net = &self.sandbox.network;
        match key {
            "sandbox.filesystem.allow_write" => Some(&fs.allow_write),
            "sandbox.filesystem.allow_read" => Some(&fs.allow_read),
            "sandbox.filesystem.deny_write" => Some(&fs.deny_write),
            "sandbox.filesystem.deny_read" => Some(&fs.deny_read),
            "sandbox.network.allowed_hosts" => Some(&net.allowed_hosts),
            "sandbox.network.denied_hosts" => Some(&net.denied_hosts),
            _ => None,
        }
    }

    fn list_mut(&mut self, key: &str) -> Result<&mut Vec<String>> {
        let fs = &mut self.sandbox.filesystem;
        let net = &mut self.sandbox.network;
        Ok(match key {
            "sandbox.filesystem.allow_write" => &mut fs.allow_write,
            "sandbox.filesystem.allow_read" => &mut fs.allow_read,
            "sandbox.filesystem.deny_write" => &mut fs.deny_write,
            "sandbox.filesystem.deny_read" => &mut fs.deny_read,
            "sandbox.network.allowed_hosts" => &mut net.allowed_hosts,
            "sandbox.network.denied_hosts" => &mut net.denied_hosts,
            _ => anyhow::bail!("Not a list key: {} (expected one of {})", key, LIST_KEYS.join(", ")),
        })
    }

    /// Append a path or host pattern to a list key. Entries are validated the
    /// way the sandbox validates them at startup. Returns `false` if the
    /// entry was already present.
    pub fn add_entry(&mut self, key: &str, value: &str) -> Result<bool> {
        if key.starts_with("sandbox.network.") {
            HostPattern::parse(value).map_err(|e| anyhow::anyhow!("{}: {}", key, e))?;
        } else {
            let field = key.rsplit('.').next().unwrap_or(key);
            let path = expand_path(value, field)?;
            if key == "sandbox.filesystem.allow_write" && path.parent().is_none() {
                anyhow::bail!("allow_write may not contain the filesystem root");
            }
        }

        let list = self.list_mut(key)?;
        if list.iter().any(|v| v == value) {
            return Ok(false);
        }
        list.push(value.to_string());
        Ok(true)
    }

    /// Remove an entry from a list key. Returns whether it was present.
    pub fn remove_entry(&mut self, key: &str, value: &str) -> Result<bool> {
        let list = self.list_mut(key)?;
        let before = list.len();
        list.retain(|v| v != value);
        Ok(list.len() != before)
    }

    pub fn get_value(&self, key: &str) -> Result<String> {
        if let Some(list) = self.list(key) {
            return Ok(list.join("\n"));
        }

        let parts: Vec<&str> = key.split('.').collect();
        let sandbox = &self.sandbox;

        match parts.as_slice() {
            ["sandbox", "enabled"] => Ok(sandbox.enabled.to_string()),
            ["sandbox", "level"] => Ok(sandbox.level.clone()),
            ["sandbox", "shell"] => Ok(sandbox.shell.clone()),
            ["sandbox", "apply_helper"] => Ok(sandbox.apply_helper.clone().unwrap_or_default()),
            ["sandbox", "timeout_secs"] => Ok(sandbox.timeout_secs.to_string()),
            ["sandbox", "network", "mode"] => Ok(serde_json::to_value(sandbox.network.mode)?
                .as_str()
                .unwrap_or_default()
                .to_string()),
            ["sandbox", "network", "ask_timeout_ms"] => {
                Ok(sandbox.network.ask_timeout_ms.to_string())
            }
            ["sandbox", "cache", "capacity"] => Ok(sandbox.cache.capacity.to_string()),
            ["sandbox", "violations", "capacity"] => Ok(sandbox.violations.capacity.to_string()),
            ["sandbox", "violations", "persist"] => Ok(sandbox.violations.persist.to_string()),
            ["logging", "level"] => Ok(self.logging.level.clone()),
            ["logging", "json"] => Ok(self.logging.json.to_string()),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
    }

    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let parts: Vec<&str> = key.split('.').collect();
        let sandbox = &mut self.sandbox;

        match parts.as_slice() {
            ["sandbox", "enabled"] => sandbox.enabled = value.parse()?,
            ["sandbox", "level"] => match value {
                "auto" | "full" | "standard" | "minimal" | "none" => {
                    sandbox.level = value.to_string()
                }
                _ => anyhow::bail!("Invalid sandbox level: {}", value),
            },
            ["sandbox", "shell"] => sandbox.shell = value.to_string(),
            ["sandbox", "apply_helper"] => {
                sandbox.apply_helper = (!value.is_empty()).then(|| value.to_string())
            }
            ["sandbox", "timeout_secs"] => sandbox.timeout_secs = value.parse()?,
            ["sandbox", "network", "mode"] => {
                sandbox.network.mode = serde_json::from_value(serde_json::Value::String(
                    value.to_string(),
                ))
                .map_err(|_| anyhow::anyhow!("Invalid network mode: {}", value))?
            }
            ["sandbox", "network", "ask_timeout_ms"] => {
                let ms: u64 = value.parse()?;
                if ms == 0 {
                    anyhow::bail!("ask_timeout_ms must be greater than zero");
                }
                sandbox.network.ask_timeout_ms = ms;
            }
            ["sandbox", "cache", "capacity"] => sandbox.cache.capacity = value.parse()?,
            ["sandbox", "violations", "capacity"] => sandbox.violations.capacity = value.parse()?,
            ["sandbox", "violations", "persist"] => sandbox.violations.persist = value.parse()?,
            ["logging", "level"] => self.logging.level = value.to_string(),
            ["logging", "json"] => self.logging.json = value.parse()?,
            _ => anyhow::bail!("Unknown config key: {}", key),
        }

        Ok(())
    }
}

fn expand_env(s: &str) -> String {
    if let Some(var_name) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        std::env::var(var_name).unwrap_or_else(|_| s.to_string())
    } else if let Some(var_name) = s.strip_prefix('$') {
        std::env::var(var_name).unwrap_or_else(|_| s.to_string())
    } else {
        s.to_string()
    }
}

/// Default config template with helpful comments (used for first-time setup)
const DEFAULT_CONFIG_TEMPLATE: &str = r#"# shellfence configuration
# Auto-created on first run. Edit as needed.

[sandbox]
enabled = true
level = "auto"                          # auto | full | standard | minimal | none
shell = "/bin/bash"
timeout_secs = 120                      # `shellfence run` only
# apply_helper = "/usr/local/libexec/shellfence-apply"

[sandbox.filesystem]
# /tmp, /dev/null and the temp dir are always writable.
# Credential dirs (~/.ssh, ~/.aws, ...) are always denied.
allow_write = []
# allow_read = ["/usr", "/etc"]         # default: whole filesystem
# deny_write = ["~/project/.git/hooks"]
# deny_read = ["~/.config/gh"]

[sandbox.network]
mode = "allow-list"                     # allow-list | deny-list | disabled
allowed_hosts = ["github.com", "*.github.com", "crates.io", "*.crates.io"]
# denied_hosts = ["*.pastebin.com"]
ask_timeout_ms = 30000

[sandbox.cache]
capacity = 32

[sandbox.violations]
capacity = 1000
persist = true

[logging]
level = "info"
# json = true
"#;
