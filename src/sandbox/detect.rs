use serde::Serialize;
use std::fmt;

/// Enforcement strength available on this machine, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxLevel {
    /// Nothing can be enforced; commands run unwrapped.
    None,
    /// seccomp only: IPC escapes blocked, filesystem not restricted.
    Minimal,
    /// Filesystem restrictions (Landlock or Seatbelt) plus seccomp.
    Standard,
    /// Standard plus kernel-pinned outbound TCP (Landlock ABI v4+, Seatbelt).
    Full,
}

impl SandboxLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxLevel::None => "none",
            SandboxLevel::Minimal => "minimal",
            SandboxLevel::Standard => "standard",
            SandboxLevel::Full => "full",
        }
    }
}

impl fmt::Display for SandboxLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OS / virtualization variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    /// WSL1 translates syscalls itself; neither Landlock nor seccomp exist.
    Wsl1,
    Wsl2,
    MacOs,
    Other,
}

impl Platform {
    pub fn detect() -> Self {
        if cfg!(target_os = "macos") {
            return Platform::MacOs;
        }
        if !cfg!(target_os = "linux") {
            return Platform::Other;
        }
        let version = std::fs::read_to_string("/proc/version").unwrap_or_default();
        classify_linux(&version)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::Wsl1 => "wsl1",
            Platform::Wsl2 => "wsl2",
            Platform::MacOs => "macos",
            Platform::Other => "other",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a Linux kernel from its `/proc/version` banner.
fn classify_linux(proc_version: &str) -> Platform {
    let lower = proc_version.to_ascii_lowercase();
    if !lower.contains("microsoft") {
        return Platform::Linux;
    }
    // WSL2 kernels are "*-microsoft-standard-WSL2"; WSL1 reports "-Microsoft".
    if lower.contains("wsl2") || lower.contains("microsoft-standard") {
        Platform::Wsl2
    } else {
        Platform::Wsl1
    }
}

/// Detected sandbox capabilities of the current platform.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxCapabilities {
    /// Landlock LSM availability and ABI version (Linux only).
    pub landlock_abi: Option<u32>,

    /// Whether seccomp-bpf is available (Linux only).
    pub seccomp_available: bool,

    /// Whether Seatbelt/sandbox-exec is available (macOS only).
    pub seatbelt_available: bool,

    /// The highest enforcement level available.
    pub level: SandboxLevel,
}

impl SandboxCapabilities {
    pub fn none() -> Self {
        Self {
            landlock_abi: None,
            seccomp_available: false,
            seatbelt_available: false,
            level: SandboxLevel::None,
        }
    }
}

/// Platform variant plus what it can enforce.
#[derive(Debug, Clone, Serialize)]
pub struct PlatformInfo {
    pub platform: Platform,
    pub capabilities: SandboxCapabilities,
}

impl PlatformInfo {
    pub fn detect() -> Self {
        let platform = Platform::detect();
        let capabilities = match platform {
            Platform::Wsl1 | Platform::Other => SandboxCapabilities::none(),
            _ => detect_capabilities(),
        };
        Self {
            platform,
            capabilities,
        }
    }

    /// Whether commands can be wrapped at all.
    pub fn is_supported(&self) -> bool {
        !matches!(self.platform, Platform::Wsl1 | Platform::Other)
            && self.capabilities.level > SandboxLevel::None
    }
}

/// Probe the current system for sandbox capabilities.
pub fn detect_capabilities() -> SandboxCapabilities {
    #[cfg(target_os = "linux")]
    {
        detect_linux()
    }

    #[cfg(target_os = "macos")]
    {
        detect_macos()
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        SandboxCapabilities::none()
    }
}

#[cfg(target_os = "linux")]
fn detect_linux() -> SandboxCapabilities {
    let landlock_abi = probe_landlock_abi();
    let seccomp_available = probe_seccomp();

    let level = match (landlock_abi, seccomp_available) {
        (Some(abi), true) if abi >= 4 => SandboxLevel::Full,
        (Some(_), true) => SandboxLevel::Standard,
        (None, true) => SandboxLevel::Minimal,
        _ => SandboxLevel::None,
    };

    SandboxCapabilities {
        landlock_abi,
        seccomp_available,
        seatbelt_available: false,
        level,
    }
}

/// Highest ABI the running kernel reports, via
/// `landlock_create_ruleset(NULL, 0, LANDLOCK_CREATE_RULESET_VERSION)`.
#[cfg(target_os = "linux")]
fn probe_landlock_abi() -> Option<u32> {
    use nix::libc;

    const LANDLOCK_CREATE_RULESET_VERSION: libc::c_uint = 1 << 0;

    // SAFETY: a version query takes no attribute pointer and returns an int.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_landlock_create_ruleset,
            std::ptr::null::<libc::c_void>(),
            0usize,
            LANDLOCK_CREATE_RULESET_VERSION,
        )
    };
    (ret > 0).then_some(ret as u32)
}

#[cfg(target_os = "linux")]
fn probe_seccomp() -> bool {
    std::fs::read_to_string("/proc/self/status")
        .map(|s| s.contains("Seccomp:"))
        .unwrap_or(false)
}

#[cfg(target_os = "macos")]
fn detect_macos() -> SandboxCapabilities {
    let seatbelt_available = std::path::Path::new("/usr/bin/sandbox-exec").exists();

    let level = if seatbelt_available {
        SandboxLevel::Full
    } else {
        SandboxLevel::None
    };

    SandboxCapabilities {
        landlock_abi: None,
        seccomp_available: false,
        seatbelt_available,
        level,
    }
}

impl SandboxCapabilities {
    /// Resolve the effective level given a user's config setting.
    pub fn effective_level(&self, config_level: &str) -> SandboxLevel {
        let requested = match config_level {
            "full" => SandboxLevel::Full,
            "standard" => SandboxLevel::Standard,
            "minimal" => SandboxLevel::Minimal,
            "none" => SandboxLevel::None,
            // "auto" or anything else: use the highest available
            _ => return self.level,
        };
        requested.min(self.level)
    }

    /// Human-readable status lines for the `status` command.
    pub fn status_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();

        #[cfg(target_os = "linux")]
        {
            if let Some(abi) = self.landlock_abi {
                lines.push(format!("  Landlock:  v{:<3}                    ok", abi));
            } else {
                lines.push("  Landlock:  not available           --".to_string());
            }

            if self.seccomp_available {
                lines.push("  Seccomp:   available               ok".to_string());
            } else {
                lines.push("  Seccomp:   not available           --".to_string());
            }
        }

        #[cfg(target_os = "macos")]
        {
            if self.seatbelt_available {
                lines.push("  Seatbelt:  available               ok".to_string());
            } else {
                lines.push("  Seatbelt:  not available           --".to_string());
            }
        }

        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        {
            lines.push("  Platform:  unsupported             --".to_string());
        }

        lines.push(format!("  Level:     {}", self.level));

        lines
    }
}
