use std::io;
use thiserror::Error;

/// Failures inside the sandbox engine.
///
/// None of these escape the manager's public entry points: each one degrades
/// the affected operation to "sandboxing inactive" and is logged instead.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Sandboxing is permanently inactive for this process.
    #[error("sandboxing is not supported on this platform: {0}")]
    PlatformUnsupported(String),

    /// The restriction program could not be built for a policy.
    #[error("failed to compile filter: {0}")]
    FilterCompile(String),

    /// The restriction program could not be installed or located.
    #[error("failed to apply filter: {0}")]
    FilterApply(String),

    /// The local network proxy could not bind its listener.
    #[error("failed to start network proxy: {0}")]
    ProxyStart(#[source] io::Error),

    /// A caller-supplied option was rejected; the previous generation stays active.
    #[error("invalid sandbox configuration: {0}")]
    ConfigMerge(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}

pub type Result<T, E = SandboxError> = std::result::Result<T, E>;
