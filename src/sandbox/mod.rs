//! Shell sandbox: kernel-enforced filesystem and network restrictions for
//! commands issued by an autonomous agent.
//!
//! Uses the argv[0] re-exec pattern: a wrapped command starts this binary as
//! `shellfence-apply`, which installs the compiled filter into its own
//! process and then execs the shell running the real command.
//!
//! Platform enforcement:
//! - Linux: Landlock LSM (filesystem, outbound TCP) + seccomp-bpf
//! - macOS: Seatbelt SBPL profiles via sandbox-exec
//!
//! Network access is mediated by a local HTTP(S) proxy with allow/deny host
//! rules and an optional interactive decision callback.

pub mod cache;
pub mod child;
pub mod detect;
pub mod error;
pub mod executor;
pub mod filter;
#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "macos")]
pub mod macos;
pub mod manager;
pub mod network;
pub mod policy;
pub mod seatbelt;
pub mod violations;
pub mod wrap;

pub use cache::{DEFAULT_FILTER_CACHE_CAPACITY, FilterCache, FilterLease};
pub use child::{APPLY_HELPER_NAME, apply_main};
pub use detect::{PlatformInfo, SandboxCapabilities, SandboxLevel, detect_capabilities};
pub use error::SandboxError;
pub use executor::{CommandOutput, run_wrapped};
pub use filter::{CompiledFilter, FilterBackend, FilterSpec, Fingerprint};
pub use manager::{Generation, ManagerSettings, SandboxManager, SandboxState};
pub use network::{AskCallback, AskHandle, ChannelAskCallback, HostRequest, PendingDecision};
pub use policy::{
    FilesystemOptions, FilesystemPolicy, FsOp, NetworkMode, NetworkOptions, NetworkPolicy,
    SandboxOptions, SandboxRuntimeConfig,
};
pub use violations::{DEFAULT_VIOLATION_CAPACITY, ViolationEntry, ViolationKind, ViolationStore};
