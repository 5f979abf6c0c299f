//! Wrapped command rendering and apply-helper lookup.
//!
//! A wrapped command is a plain shell string the external spawner runs:
//!
//! ```text
//! HTTP_PROXY=... NO_PROXY=... <helper> <artifact> <shell> -c '<command>'
//! ```
//!
//! The helper is this binary reached under the name `shellfence-apply`
//! (argv[0] dispatch); it installs the compiled filter and execs the shell.

use std::path::{Path, PathBuf};
use tracing::debug;

use super::child::APPLY_HELPER_NAME;
use super::error::{Result, SandboxError};

/// Environment override for the helper location.
pub const APPLY_HELPER_ENV: &str = "SHELLFENCE_APPLY_HELPER";

/// Hosts that bypass the proxy. Landlock and Seatbelt still pin outbound TCP
/// to the proxy port, so this only avoids proxying loopback traffic.
const NO_PROXY: &str = "localhost,127.0.0.1,::1";

/// Proxy credentials for one wrapped command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEnv {
    pub port: u16,
    /// Attribution token sent as the Basic auth user name.
    pub token: String,
}

impl ProxyEnv {
    pub fn url(&self) -> String {
        format!("http://{}:x@127.0.0.1:{}", self.token, self.port)
    }
}

/// Locate the apply helper.
///
/// Order: explicit setting, `SHELLFENCE_APPLY_HELPER`, a `shellfence-apply`
/// next to the current executable, and finally a `shellfence-apply` symlink
/// to the current executable created at `link`.
pub fn resolve_apply_helper(explicit: Option<&Path>, link: &Path) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return existing_helper(path);
    }

    if let Some(env) = std::env::var_os(APPLY_HELPER_ENV).filter(|v| !v.is_empty()) {
        return existing_helper(Path::new(&env));
    }

    let exe = std::env::current_exe()?;
    if let Some(dir) = exe.parent() {
        let sibling = dir.join(APPLY_HELPER_NAME);
        if sibling.is_file() {
            debug!("using apply helper {}", sibling.display());
            return Ok(sibling);
        }
    }

    ensure_link(link, &exe)?;
    debug!("using apply helper link {} -> {}", link.display(), exe.display());
    Ok(link.to_path_buf())
}

fn existing_helper(path: &Path) -> Result<PathBuf> {
    if !path.is_absolute() {
        return Err(SandboxError::FilterApply(format!(
            "apply helper path must be absolute: {}",
            path.display()
        )));
    }
    if !path.is_file() {
        return Err(SandboxError::FilterApply(format!(
            "apply helper not found: {}",
            path.display()
        )));
    }
    Ok(path.to_path_buf())
}

/// Point `link` at `target`, replacing a stale link.
#[cfg(unix)]
fn ensure_link(link: &Path, target: &Path) -> Result<()> {
    if let Ok(current) = std::fs::read_link(link) {
        if current == target {
            return Ok(());
        }
        std::fs::remove_file(link)?;
    } else if link.exists() {
        return Err(SandboxError::FilterApply(format!(
            "{} exists and is not a symlink",
            link.display()
        )));
    }

    if let Some(parent) = link.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

#[cfg(not(unix))]
fn ensure_link(_link: &Path, _target: &Path) -> Result<()> {
    Err(SandboxError::PlatformUnsupported(
        "apply helper links need a unix platform".to_string(),
    ))
}

/// Render the final invocation. Every dynamic piece is shell-quoted; the
/// original command travels as a single argument to `<shell> -c`.
pub fn render(
    helper: &Path,
    artifact: &Path,
    shell: &str,
    command: &str,
    proxy: Option<&ProxyEnv>,
) -> String {
    let mut parts: Vec<String> = Vec::new();

    if let Some(proxy) = proxy {
        let url = proxy.url();
        for name in ["HTTP_PROXY", "HTTPS_PROXY", "http_proxy", "https_proxy"] {
            parts.push(format!("{}={}", name, shell_words::quote(&url)));
        }
        for name in ["NO_PROXY", "no_proxy"] {
            parts.push(format!("{}={}", name, shell_words::quote(NO_PROXY)));
        }
    }

    parts.push(shell_words::quote(&helper.to_string_lossy()).into_owned());
    parts.push(shell_words::quote(&artifact.to_string_lossy()).into_owned());
    parts.push(shell_words::quote(shell).into_owned());
    parts.push("-c".to_string());
    parts.push(shell_words::quote(command).into_owned());

    parts.join(" ")
}
