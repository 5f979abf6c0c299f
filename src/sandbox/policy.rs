use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use super::error::{Result, SandboxError};
use super::network::{AskHandle, HostPattern};

/// Default bound on how long an ask-callback may keep a request suspended.
pub const DEFAULT_ASK_TIMEOUT_MS: u64 = 30_000;

/// How the network proxy treats hosts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkMode {
    /// Only allowed hosts pass; undecided hosts go to the ask-callback or are denied.
    #[default]
    AllowList,
    /// Everything passes except denied hosts.
    DenyList,
    /// No proxy is installed; network is not mediated.
    Disabled,
}

/// Filesystem operation class evaluated by the policy model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsOp {
    Read,
    Write,
}

/// Path-scoped filesystem rules. Deny rules always win over allow rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilesystemPolicy {
    /// Writable roots (always includes the process-wide defaults).
    pub allow_write: Vec<PathBuf>,

    /// Readable roots. Writable roots are implicitly readable.
    pub allow_read: Vec<PathBuf>,

    /// Sub-paths never writable, even inside a writable root.
    pub deny_write: Vec<PathBuf>,

    /// Sub-paths never readable, even inside a readable root.
    pub deny_read: Vec<PathBuf>,
}

impl FilesystemPolicy {
    /// Effective policy for a single call: `dir` becomes writable for that
    /// call only. `self` is left untouched.
    pub fn with_working_dir(&self, dir: &Path) -> FilesystemPolicy {
        let mut effective = self.clone();
        let dir = normalize_path(dir);
        if !effective.allow_write.contains(&dir) {
            effective.allow_write.push(dir);
        }
        effective
    }

    /// Order-independent form used for fingerprinting. Precedence is fixed
    /// (deny beats allow), so sorting loses nothing.
    pub fn canonical(&self) -> FilesystemPolicy {
        fn sorted(paths: &[PathBuf]) -> Vec<PathBuf> {
            let mut out: Vec<PathBuf> = paths.iter().map(|p| normalize_path(p)).collect();
            out.sort();
            out.dedup();
            out
        }

        FilesystemPolicy {
            allow_write: sorted(&self.allow_write),
            allow_read: sorted(&self.allow_read),
            deny_write: sorted(&self.deny_write),
            deny_read: sorted(&self.deny_read),
        }
    }

    /// Evaluate the rules for one path using prefix matching.
    pub fn permits(&self, op: FsOp, path: &Path) -> bool {
        let path = normalize_path(path);
        match op {
            FsOp::Write => {
                under_any(&path, &self.allow_write) && !under_any(&path, &self.deny_write)
            }
            FsOp::Read => {
                (under_any(&path, &self.allow_read) || under_any(&path, &self.allow_write))
                    && !under_any(&path, &self.deny_read)
            }
        }
    }
}

/// Network rules for one generation.
#[derive(Debug, Clone)]
pub struct NetworkPolicy {
    pub mode: NetworkMode,
    pub allowed_hosts: Vec<String>,
    pub denied_hosts: Vec<String>,
    pub ask_timeout: Duration,
    pub ask_callback: Option<AskHandle>,
}

impl NetworkPolicy {
    pub fn is_mediated(&self) -> bool {
        self.mode != NetworkMode::Disabled
    }
}

/// Canonical immutable policy snapshot. Shared behind `Arc`; a change always
/// builds a new value.
#[derive(Debug, Clone)]
pub struct SandboxRuntimeConfig {
    pub filesystem: FilesystemPolicy,
    pub network: NetworkPolicy,
}

/// Caller-facing filesystem options. `None` means "not specified".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilesystemOptions {
    #[serde(default)]
    pub allow_write: Option<Vec<String>>,
    #[serde(default)]
    pub allow_read: Option<Vec<String>>,
    #[serde(default)]
    pub deny_write: Option<Vec<String>>,
    #[serde(default)]
    pub deny_read: Option<Vec<String>>,
}

/// Caller-facing network options. `None` means "not specified".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkOptions {
    #[serde(default)]
    pub mode: Option<NetworkMode>,
    #[serde(default)]
    pub allowed_hosts: Option<Vec<String>>,
    #[serde(default)]
    pub denied_hosts: Option<Vec<String>>,
    #[serde(default)]
    pub ask_timeout_ms: Option<u64>,
}

/// Sandbox options as supplied by the host application, either in full
/// (`initialize`) or as a partial update (`update_config`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxOptions {
    #[serde(default)]
    pub filesystem: FilesystemOptions,

    #[serde(default)]
    pub network: NetworkOptions,

    #[serde(skip)]
    pub ask_callback: Option<AskHandle>,

    /// When merging, lists in this value replace the previous lists instead
    /// of being unioned with them.
    #[serde(default)]
    pub replace: bool,
}

impl SandboxOptions {
    /// Merge a partial update into these options.
    ///
    /// Lists are unioned (existing order kept, duplicates dropped) unless
    /// `partial.replace` is set. Scalars and the ask-callback are overwritten
    /// only when the partial provides them.
    pub fn merge(&self, partial: &SandboxOptions) -> SandboxOptions {
        let replace = partial.replace;
        let fs = &self.filesystem;
        let update = &partial.filesystem;
        let net = &self.network;
        let net_update = &partial.network;

        SandboxOptions {
            filesystem: FilesystemOptions {
                allow_write: merge_list(&fs.allow_write, &update.allow_write, replace),
                allow_read: merge_list(&fs.allow_read, &update.allow_read, replace),
                deny_write: merge_list(&fs.deny_write, &update.deny_write, replace),
                deny_read: merge_list(&fs.deny_read, &update.deny_read, replace),
            },
            network: NetworkOptions {
                mode: net_update.mode.or(net.mode),
                allowed_hosts: merge_list(&net.allowed_hosts, &net_update.allowed_hosts, replace),
                denied_hosts: merge_list(&net.denied_hosts, &net_update.denied_hosts, replace),
                ask_timeout_ms: net_update.ask_timeout_ms.or(net.ask_timeout_ms),
            },
            ask_callback: partial
                .ask_callback
                .clone()
                .or_else(|| self.ask_callback.clone()),
            replace: false,
        }
    }
}

fn merge_list(
    base: &Option<Vec<String>>,
    update: &Option<Vec<String>>,
    replace: bool,
) -> Option<Vec<String>> {
    let Some(update) = update else {
        return base.clone();
    };

    let mut out: Vec<String> = match base {
        Some(base) if !replace => base.clone(),
        _ => Vec::new(),
    };
    for item in update {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    Some(out)
}

/// Process-wide rules merged into every policy regardless of caller options.
#[derive(Debug, Clone, Default)]
pub struct ProcessDefaults {
    /// Always writable (temp directories, `/dev/null`).
    pub write_paths: Vec<PathBuf>,

    /// Readable roots when the caller does not restrict reads.
    pub read_roots: Vec<PathBuf>,

    /// Always unreadable (credential directories).
    pub deny_read: Vec<PathBuf>,

    /// Always unwritable (credentials, shell startup files, our own state).
    pub deny_write: Vec<PathBuf>,
}

impl ProcessDefaults {
    /// Defaults for this process. `protected` are directories shellfence
    /// itself owns (state, runtime); sandboxed commands may never write there.
    pub fn detect(protected: &[PathBuf]) -> Self {
        let mut write_paths = vec![PathBuf::from("/tmp"), PathBuf::from("/dev/null")];
        let temp = normalize_path(&std::env::temp_dir());
        if !write_paths.contains(&temp) {
            write_paths.push(temp);
        }
        #[cfg(target_os = "macos")]
        write_paths.push(PathBuf::from("/private/tmp"));

        let mut deny_write = default_credential_paths();
        deny_write.extend(default_startup_files());
        deny_write.extend(protected.iter().map(|p| normalize_path(p)));

        Self {
            write_paths,
            read_roots: vec![PathBuf::from("/")],
            deny_read: default_credential_paths(),
            deny_write,
        }
    }
}

/// Credential directories denied by default.
fn default_credential_paths() -> Vec<PathBuf> {
    let home = dirs_home();
    vec![
        home.join(".ssh"),
        home.join(".aws"),
        home.join(".gnupg"),
        home.join(".docker"),
        home.join(".kube"),
        home.join(".npmrc"),
        home.join(".pypirc"),
        home.join(".netrc"),
    ]
}

/// Shell startup files a command could use to persist code outside the sandbox.
fn default_startup_files() -> Vec<PathBuf> {
    let home = dirs_home();
    vec![
        home.join(".bashrc"),
        home.join(".bash_profile"),
        home.join(".zshrc"),
        home.join(".profile"),
        home.join(".gitconfig"),
    ]
}

fn dirs_home() -> PathBuf {
    directories::BaseDirs::new()
        .map(|b| b.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("~"))
}

/// Build a canonical `SandboxRuntimeConfig` from caller options.
///
/// Rejects relative paths, `..` components, `/` as a writable root, malformed
/// host patterns, and a zero ask timeout.
pub fn build_runtime_config(
    options: &SandboxOptions,
    defaults: &ProcessDefaults,
) -> Result<SandboxRuntimeConfig> {
    let fs = &options.filesystem;

    let mut allow_write = expand_all(fs.allow_write.as_deref(), "allow_write")?;
    if allow_write.iter().any(|p| p.parent().is_none()) {
        return Err(SandboxError::ConfigMerge(
            "allow_write may not contain the filesystem root".to_string(),
        ));
    }
    for path in &defaults.write_paths {
        if !allow_write.contains(path) {
            allow_write.push(path.clone());
        }
    }

    let allow_read = match fs.allow_read.as_deref() {
        Some(list) => expand_all(Some(list), "allow_read")?,
        None => defaults.read_roots.clone(),
    };

    let mut deny_read = defaults.deny_read.clone();
    deny_read.extend(expand_all(fs.deny_read.as_deref(), "deny_read")?);

    let mut deny_write = defaults.deny_write.clone();
    deny_write.extend(expand_all(fs.deny_write.as_deref(), "deny_write")?);

    let net = &options.network;
    let allowed_hosts = validate_hosts(net.allowed_hosts.as_deref())?;
    let denied_hosts = validate_hosts(net.denied_hosts.as_deref())?;

    let ask_timeout_ms = net.ask_timeout_ms.unwrap_or(DEFAULT_ASK_TIMEOUT_MS);
    if ask_timeout_ms == 0 {
        return Err(SandboxError::ConfigMerge(
            "ask_timeout_ms must be greater than zero".to_string(),
        ));
    }

    Ok(SandboxRuntimeConfig {
        filesystem: FilesystemPolicy {
            allow_write,
            allow_read,
            deny_write,
            deny_read,
        },
        network: NetworkPolicy {
            mode: net.mode.unwrap_or_default(),
            allowed_hosts,
            denied_hosts,
            ask_timeout: Duration::from_millis(ask_timeout_ms),
            ask_callback: options.ask_callback.clone(),
        },
    })
}

fn expand_all(raw: Option<&[String]>, field: &str) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in raw.unwrap_or_default() {
        let path = expand_path(entry, field)?;
        if !out.contains(&path) {
            out.push(path);
        }
    }
    Ok(out)
}

/// Expand `~` and validate that a configured path stays within absolute,
/// lexically resolved roots.
pub fn expand_path(raw: &str, field: &str) -> Result<PathBuf> {
    let expanded = shellexpand::tilde(raw.trim());
    let path = PathBuf::from(expanded.as_ref());

    if !path.is_absolute() {
        return Err(SandboxError::ConfigMerge(format!(
            "{}: path must be absolute: {}",
            field, raw
        )));
    }
    if path.components().any(|c| c == Component::ParentDir) {
        return Err(SandboxError::ConfigMerge(format!(
            "{}: path may not contain '..': {}",
            field, raw
        )));
    }
    Ok(normalize_path(&path))
}

/// Validate a per-call working directory with the rules applied to
/// configured write roots: absolute, no `..`, not the filesystem root.
pub fn validate_working_dir(dir: &Path) -> Result<PathBuf> {
    let path = expand_path(&dir.to_string_lossy(), "working_dir")?;
    if path.parent().is_none() {
        return Err(SandboxError::ConfigMerge(format!(
            "working_dir may not be the filesystem root: {}",
            dir.display()
        )));
    }
    Ok(path)
}

fn validate_hosts(raw: Option<&[String]>) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for host in raw.unwrap_or_default() {
        let pattern = HostPattern::parse(host)
            .map_err(|e| SandboxError::ConfigMerge(format!("invalid host pattern: {}", e)))?;
        let text = pattern.as_str().to_string();
        if !out.contains(&text) {
            out.push(text);
        }
    }
    Ok(out)
}

/// Lexical normalization: drops `.` and resolves `..` without touching disk.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn under_any(path: &Path, roots: &[PathBuf]) -> bool {
    roots.iter().any(|root| path.starts_with(root))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> ProcessDefaults {
        ProcessDefaults {
            write_paths: vec![PathBuf::from("/tmp")],
            read_roots: vec![PathBuf::from("/")],
            deny_read: vec![PathBuf::from("/home/user/.ssh")],
            deny_write: vec![PathBuf::from("/home/user/.bashrc")],
        }
    }

    fn strings(items: &[&str]) -> Option<Vec<String>> {
        Some(items.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_allow_write_always_includes_defaults() {
        let options = SandboxOptions {
            filesystem: FilesystemOptions {
                allow_write: strings(&["/data"]),
                ..Default::default()
            },
            ..Default::default()
        };
        let config = build_runtime_config(&options, &defaults()).unwrap();

        assert!(config.filesystem.allow_write.contains(&PathBuf::from("/data")));
        assert!(config.filesystem.allow_write.contains(&PathBuf::from("/tmp")));
    }

    #[test]
    fn test_write_outside_tmp_denied() {
        let config = build_runtime_config(&SandboxOptions::default(), &defaults()).unwrap();
        let fs = &config.filesystem;

        assert!(fs.permits(FsOp::Write, Path::new("/tmp/build/out.o")));
        assert!(!fs.permits(FsOp::Write, Path::new("/etc/passwd")));
        assert!(!fs.permits(FsOp::Write, Path::new("/tmpfoo/x")));
        assert!(!fs.permits(FsOp::Write, Path::new("/tmp/../etc/passwd")));
    }

    #[test]
    fn test_deny_read_wins_over_allow() {
        let config = build_runtime_config(&SandboxOptions::default(), &defaults()).unwrap();
        let fs = &config.filesystem;

        assert!(fs.permits(FsOp::Read, Path::new("/usr/bin/env")));
        assert!(!fs.permits(FsOp::Read, Path::new("/home/user/.ssh/id_ed25519")));
    }

    #[test]
    fn test_deny_write_wins_inside_working_dir() {
        let config = build_runtime_config(&SandboxOptions::default(), &defaults()).unwrap();
        let fs = config.filesystem.with_working_dir(Path::new("/home/user"));

        assert!(fs.permits(FsOp::Write, Path::new("/home/user/notes.txt")));
        assert!(!fs.permits(FsOp::Write, Path::new("/home/user/.bashrc")));
    }

    #[test]
    fn test_working_dir_does_not_touch_base_policy() {
        let config = build_runtime_config(&SandboxOptions::default(), &defaults()).unwrap();
        let effective = config.filesystem.with_working_dir(Path::new("/work/a"));

        assert!(effective.permits(FsOp::Write, Path::new("/work/a/file")));
        assert!(!config.filesystem.permits(FsOp::Write, Path::new("/work/a/file")));
    }

    #[test]
    fn test_caller_allow_read_replaces_default_root() {
        let options = SandboxOptions {
            filesystem: FilesystemOptions {
                allow_read: strings(&["/usr"]),
                ..Default::default()
            },
            ..Default::default()
        };
        let config = build_runtime_config(&options, &defaults()).unwrap();

        assert!(config.filesystem.permits(FsOp::Read, Path::new("/usr/lib/x")));
        assert!(!config.filesystem.permits(FsOp::Read, Path::new("/etc/hosts")));
        // Writable roots stay readable
        assert!(config.filesystem.permits(FsOp::Read, Path::new("/tmp/x")));
    }

    #[test]
    fn test_relative_path_rejected() {
        let options = SandboxOptions {
            filesystem: FilesystemOptions {
                allow_write: strings(&["build/out"]),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = build_runtime_config(&options, &defaults()).unwrap_err();
        assert!(matches!(err, SandboxError::ConfigMerge(_)));
    }

    #[test]
    fn test_parent_dir_escape_rejected() {
        let options = SandboxOptions {
            filesystem: FilesystemOptions {
                allow_write: strings(&["/tmp/../etc"]),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(build_runtime_config(&options, &defaults()).is_err());
    }

    #[test]
    fn test_working_dir_validation() {
        assert_eq!(
            validate_working_dir(Path::new("/work/./repo")).unwrap(),
            PathBuf::from("/work/repo")
        );
        assert!(validate_working_dir(Path::new("/tmp/..")).is_err());
        assert!(validate_working_dir(Path::new("/tmp/../etc")).is_err());
        assert!(validate_working_dir(Path::new("/")).is_err());
        assert!(validate_working_dir(Path::new("/.")).is_err());
        assert!(validate_working_dir(Path::new("work")).is_err());
    }

    #[test]
    fn test_root_write_rejected() {
        let options = SandboxOptions {
            filesystem: FilesystemOptions {
                allow_write: strings(&["/"]),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(build_runtime_config(&options, &defaults()).is_err());
    }

    #[test]
    fn test_invalid_host_rejected() {
        let options = SandboxOptions {
            network: NetworkOptions {
                allowed_hosts: strings(&["https://example.com/path"]),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(build_runtime_config(&options, &defaults()).is_err());
    }

    #[test]
    fn test_zero_ask_timeout_rejected() {
        let options = SandboxOptions {
            network: NetworkOptions {
                ask_timeout_ms: Some(0),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(build_runtime_config(&options, &defaults()).is_err());
    }

    #[test]
    fn test_merge_unions_lists() {
        let base = SandboxOptions {
            filesystem: FilesystemOptions {
                allow_write: strings(&["/srv/cache"]),
                ..Default::default()
            },
            network: NetworkOptions {
                allowed_hosts: strings(&["example.com"]),
                ..Default::default()
            },
            ..Default::default()
        };
        let partial = SandboxOptions {
            filesystem: FilesystemOptions {
                allow_write: strings(&["/data", "/srv/cache"]),
                ..Default::default()
            },
            ..Default::default()
        };

        let merged = base.merge(&partial);
        assert_eq!(
            merged.filesystem.allow_write,
            strings(&["/srv/cache", "/data"])
        );
        assert_eq!(merged.network.allowed_hosts, strings(&["example.com"]));
    }

    #[test]
    fn test_merge_replace_overrides_lists() {
        let base = SandboxOptions {
            filesystem: FilesystemOptions {
                allow_write: strings(&["/srv/cache"]),
                ..Default::default()
            },
            ..Default::default()
        };
        let partial = SandboxOptions {
            filesystem: FilesystemOptions {
                allow_write: strings(&["/data"]),
                ..Default::default()
            },
            replace: true,
            ..Default::default()
        };

        let merged = base.merge(&partial);
        assert_eq!(merged.filesystem.allow_write, strings(&["/data"]));
        assert!(!merged.replace);
    }

    #[test]
    fn test_merge_overwrites_scalars_only_when_present() {
        let base = SandboxOptions {
            network: NetworkOptions {
                mode: Some(NetworkMode::DenyList),
                ask_timeout_ms: Some(5_000),
                ..Default::default()
            },
            ..Default::default()
        };
        let partial = SandboxOptions {
            network: NetworkOptions {
                ask_timeout_ms: Some(1_000),
                ..Default::default()
            },
            ..Default::default()
        };

        let merged = base.merge(&partial);
        assert_eq!(merged.network.mode, Some(NetworkMode::DenyList));
        assert_eq!(merged.network.ask_timeout_ms, Some(1_000));
    }

    #[test]
    fn test_canonical_is_order_independent() {
        let a = FilesystemPolicy {
            allow_write: vec![PathBuf::from("/b"), PathBuf::from("/a"), PathBuf::from("/a/")],
            ..Default::default()
        };
        let b = FilesystemPolicy {
            allow_write: vec![PathBuf::from("/a"), PathBuf::from("/b")],
            ..Default::default()
        };
        assert_eq!(a.canonical(), b.canonical());
    }

    #[test]
    fn test_network_mode_serialization() {
        let json = serde_json::to_string(&NetworkMode::AllowList).unwrap();
        assert_eq!(json, "\"allow-list\"");
        let mode: NetworkMode = serde_json::from_str("\"deny-list\"").unwrap();
        assert_eq!(mode, NetworkMode::DenyList);
    }

    #[test]
    fn test_default_credentials_denied() {
        let defaults = ProcessDefaults::detect(&[]);
        let home = dirs_home();
        assert!(defaults.deny_read.contains(&home.join(".ssh")));
        assert!(defaults.deny_write.contains(&home.join(".bashrc")));
        assert!(defaults.write_paths.contains(&PathBuf::from("/tmp")));
    }
}
