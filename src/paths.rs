//! XDG Base Directory Specification compliant path resolution.
//!
//! Every directory is resolved through a three-level fallback:
//! 1. shellfence-specific env var (SHELLFENCE_CONFIG_DIR, SHELLFENCE_STATE_DIR)
//! 2. XDG env var (XDG_CONFIG_HOME, etc.) via `etcetera`
//! 3. Platform default (~/.config, etc.)
//!
//! All paths are absolute. Relative paths from env vars are ignored per XDG spec.

use anyhow::{Context, Result};
#[cfg(unix)]
use libc::getuid;
use std::path::{Path, PathBuf};

use crate::sandbox::child::APPLY_HELPER_NAME;

/// Resolved directory paths.
///
/// Created once at startup, threaded through Config.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Config directory: config.toml lives here
    pub config_dir: PathBuf,

    /// State directory: compiled filters, violation log
    pub state_dir: PathBuf,

    /// Runtime directory: apply-helper link.
    /// None if no suitable runtime directory is available.
    pub runtime_dir: Option<PathBuf>,
}

impl Paths {
    /// Resolve all paths using real environment variables.
    pub fn resolve() -> Result<Self> {
        Self::resolve_with_env(|key| std::env::var(key))
    }

    /// Resolve paths with a custom env var lookup (for testing).
    pub fn resolve_with_env<F>(env_fn: F) -> Result<Self>
    where
        F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
    {
        use etcetera::BaseStrategy;

        let strategy = etcetera::choose_base_strategy()
            .map_err(|e| anyhow::anyhow!("Failed to determine base directories: {}", e))?;

        let config_dir = env_or(&env_fn, "SHELLFENCE_CONFIG_DIR", || {
            strategy.config_dir().join("shellfence")
        });

        let state_dir = env_or(&env_fn, "SHELLFENCE_STATE_DIR", || {
            let base_state = strategy.state_dir().unwrap_or_else(|| strategy.data_dir());
            base_state.join("shellfence")
        });

        let runtime_dir = resolve_runtime_dir(&env_fn);

        Ok(Self {
            config_dir,
            state_dir,
            runtime_dir,
        })
    }

    /// Paths rooted in one directory (tests, embedded use).
    pub fn in_dir(root: &Path) -> Self {
        Self {
            config_dir: root.join("config"),
            state_dir: root.join("state"),
            runtime_dir: Some(root.join("run")),
        }
    }

    /// Config file: config_dir/config.toml
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// Compiled filter artifacts: state_dir/filters
    pub fn filters_dir(&self) -> PathBuf {
        self.state_dir.join("filters")
    }

    /// Violation log: state_dir/violations.jsonl
    pub fn violation_log(&self) -> PathBuf {
        self.state_dir.join("violations.jsonl")
    }

    /// Runtime directory, falling back to state_dir
    pub fn runtime_or_state(&self) -> &Path {
        self.runtime_dir.as_deref().unwrap_or(&self.state_dir)
    }

    /// Apply-helper symlink (in runtime_dir, falls back to state_dir)
    pub fn helper_link(&self) -> PathBuf {
        self.runtime_or_state().join(APPLY_HELPER_NAME)
    }

    /// Directories sandboxed commands must never write to.
    pub fn protected_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = vec![self.config_dir.clone(), self.state_dir.clone()];
        if let Some(runtime) = &self.runtime_dir {
            dirs.push(runtime.clone());
        }
        dirs
    }

    /// Create all directories with appropriate permissions.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.config_dir, &self.state_dir] {
            create_dir_with_mode(dir)?;
        }

        if let Some(ref runtime) = self.runtime_dir {
            create_dir_with_mode(runtime)?;
        }

        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::resolve().unwrap_or_else(|_| {
            // Fallback when XDG resolution fails
            let home = etcetera::home_dir().unwrap_or_else(|_| PathBuf::from("."));
            Self {
                config_dir: home.join(".config").join("shellfence"),
                state_dir: home.join(".local").join("state").join("shellfence"),
                runtime_dir: None,
            }
        })
    }
}

/// Resolve an env var with fallback. Ignores empty and relative paths per XDG spec.
fn env_or<F>(env_fn: &F, var: &str, default: impl FnOnce() -> PathBuf) -> PathBuf
where
    F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
{
    env_fn(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .filter(|p| p.is_absolute()) // XDG spec: ignore relative paths
        .unwrap_or_else(default)
}

/// Resolve runtime directory.
fn resolve_runtime_dir<F>(env_fn: &F) -> Option<PathBuf>
where
    F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
{
    if let Ok(dir) = env_fn("XDG_RUNTIME_DIR")
        && !dir.is_empty()
    {
        let path = PathBuf::from(&dir);
        if path.is_absolute() {
            return Some(path.join("shellfence"));
        }
    }

    // Fallback: $TMPDIR/shellfence-$UID on Unix
    #[cfg(unix)]
    {
        let uid = unsafe { getuid() };
        let tmpdir = env_fn("TMPDIR").unwrap_or_else(|_| "/tmp".to_string());
        Some(PathBuf::from(tmpdir).join(format!("shellfence-{}", uid)))
    }

    #[cfg(not(unix))]
    {
        None
    }
}

/// Create a directory with mode 0700 per XDG spec.
pub(crate) fn create_dir_with_mode(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Helper: build an env_fn from a HashMap
    fn make_env(
        map: HashMap<&str, &str>,
    ) -> impl Fn(&str) -> std::result::Result<String, std::env::VarError> {
        move |key: &str| {
            map.get(key)
                .map(|v| v.to_string())
                .ok_or(std::env::VarError::NotPresent)
        }
    }

    #[test]
    fn default_paths_are_xdg_compliant() {
        let paths = Paths::resolve_with_env(make_env(HashMap::new())).unwrap();

        assert!(paths.config_dir.ends_with("shellfence"), "config_dir: {:?}", paths.config_dir);
        assert!(paths.state_dir.ends_with("shellfence"), "state_dir: {:?}", paths.state_dir);
        assert!(paths.config_dir.is_absolute());
    }

    #[test]
    fn shellfence_env_vars_override_xdg() {
        let mut env: HashMap<&str, &str> = HashMap::new();
        env.insert("SHELLFENCE_CONFIG_DIR", "/custom/config");
        env.insert("SHELLFENCE_STATE_DIR", "/custom/state");

        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        assert_eq!(paths.config_dir, PathBuf::from("/custom/config"));
        assert_eq!(paths.state_dir, PathBuf::from("/custom/state"));
    }

    #[test]
    fn relative_and_empty_paths_are_ignored() {
        let mut env: HashMap<&str, &str> = HashMap::new();
        env.insert("SHELLFENCE_CONFIG_DIR", "relative/path");
        env.insert("SHELLFENCE_STATE_DIR", "");

        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        assert!(paths.config_dir.is_absolute());
        assert!(paths.state_dir.is_absolute());
    }

    #[test]
    fn runtime_dir_prefers_xdg() {
        let mut env: HashMap<&str, &str> = HashMap::new();
        env.insert("XDG_RUNTIME_DIR", "/run/user/1000");

        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        assert_eq!(paths.runtime_dir, Some(PathBuf::from("/run/user/1000/shellfence")));
        assert_eq!(paths.helper_link(), PathBuf::from("/run/user/1000/shellfence/shellfence-apply"));
    }

    #[test]
    fn convenience_accessors() {
        let paths = Paths::in_dir(Path::new("/x"));

        assert_eq!(paths.config_file(), PathBuf::from("/x/config/config.toml"));
        assert_eq!(paths.filters_dir(), PathBuf::from("/x/state/filters"));
        assert_eq!(paths.violation_log(), PathBuf::from("/x/state/violations.jsonl"));
        assert_eq!(paths.protected_dirs().len(), 3);
    }

    #[test]
    fn ensure_dirs_creates_private_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::in_dir(tmp.path());
        paths.ensure_dirs().unwrap();

        assert!(paths.state_dir.is_dir());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&paths.state_dir).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }
}
