//! Filesystem policy → loadable restriction program.
//!
//! A [`FilterSpec`] is the canonical input (filesystem rules, backend, and
//! the proxy port outbound TCP is pinned to). Its fingerprint is the cache
//! key. [`CompiledFilter`] is the immutable artifact the apply helper loads:
//!
//! - Landlock backend: `PathBeneath` rules plus a seccomp BPF program.
//! - Seatbelt backend: an SBPL profile for `sandbox-exec`.
//!
//! Landlock can only grant, never carve out, so roots containing denied
//! sub-paths are split into their non-denied children when compiling.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use super::error::{Result, SandboxError};
use super::policy::{FilesystemPolicy, FsOp};
use super::seatbelt;

/// Bumped whenever the artifact layout or lowering changes.
pub const ARTIFACT_VERSION: u32 = 2;

/// Lowering stops splitting below this depth and drops the subtree.
const MAX_SPLIT_DEPTH: usize = 16;

/// SHA-256 (hex) of a canonical [`FilterSpec`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for logs.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterBackend {
    Landlock,
    Seatbelt,
}

impl FilterBackend {
    pub fn for_platform() -> Option<Self> {
        if cfg!(target_os = "linux") {
            Some(FilterBackend::Landlock)
        } else if cfg!(target_os = "macos") {
            Some(FilterBackend::Seatbelt)
        } else {
            None
        }
    }
}

/// Canonical compile input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterSpec {
    pub filesystem: FilesystemPolicy,
    pub backend: FilterBackend,
    /// When set, outbound TCP is limited to this loopback proxy port.
    pub proxy_port: Option<u16>,
}

impl FilterSpec {
    pub fn new(filesystem: &FilesystemPolicy, backend: FilterBackend, proxy_port: Option<u16>) -> Self {
        Self {
            filesystem: filesystem.canonical(),
            backend,
            proxy_port,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(ARTIFACT_VERSION.to_le_bytes());
        // Canonical JSON: field order is fixed by the struct definitions.
        if let Ok(bytes) = serde_json::to_vec(self) {
            hasher.update(&bytes);
        }
        Fingerprint(
            hasher
                .finalize()
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAccess {
    Read,
    Write,
}

/// One Landlock grant: `access` beneath `path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRule {
    pub path: PathBuf,
    pub access: RuleAccess,
}

/// A classic BPF instruction, stored field by field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BpfInstruction {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum FilterProgram {
    Landlock {
        rules: Vec<PathRule>,
        connect_ports: Option<Vec<u16>>,
        seccomp: Vec<BpfInstruction>,
    },
    Seatbelt {
        profile: String,
    },
}

/// Immutable compiled artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledFilter {
    pub version: u32,
    pub fingerprint: Fingerprint,
    pub spec: FilterSpec,
    pub program: FilterProgram,
}

impl CompiledFilter {
    pub fn compile(spec: &FilterSpec) -> Result<Self> {
        let program = match spec.backend {
            FilterBackend::Landlock => FilterProgram::Landlock {
                rules: lower_landlock_rules(&spec.filesystem),
                connect_ports: spec.proxy_port.map(|port| vec![port]),
                seccomp: compile_seccomp(spec.proxy_port.is_some())?,
            },
            FilterBackend::Seatbelt => FilterProgram::Seatbelt {
                profile: seatbelt::profile(&spec.filesystem, spec.proxy_port),
            },
        };

        Ok(Self {
            version: ARTIFACT_VERSION,
            fingerprint: spec.fingerprint(),
            spec: spec.clone(),
            program,
        })
    }

    /// In-process model of the filter (deny wins).
    pub fn permits(&self, op: FsOp, path: &Path) -> bool {
        self.spec.filesystem.permits(op, path)
    }

    /// Check the artifact was produced by this build for the spec it carries.
    pub fn verify(&self) -> Result<()> {
        if self.version != ARTIFACT_VERSION {
            return Err(SandboxError::FilterApply(format!(
                "artifact version {} (expected {})",
                self.version, ARTIFACT_VERSION
            )));
        }
        let expected = self.spec.fingerprint();
        if expected != self.fingerprint {
            return Err(SandboxError::FilterApply(format!(
                "fingerprint mismatch: artifact {} but spec hashes to {}",
                self.fingerprint.short(),
                expected.short()
            )));
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read(path)?;
        Ok(serde_json::from_slice(&content)?)
    }

    /// Serialize to `path` through a temp file + rename so readers never see
    /// a partial artifact.
    pub fn store(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension(format!("json.{}.tmp", std::process::id()));
        fs::write(&tmp, serde_json::to_vec(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// `<dir>/<fingerprint>.json`
pub fn artifact_path(dir: &Path, fingerprint: &Fingerprint) -> PathBuf {
    dir.join(format!("{}.json", fingerprint.as_str()))
}

/// Lower filesystem rules to Landlock grants.
///
/// Readable roots are `allow_read ∪ allow_write` minus `deny_read`; writable
/// roots are `allow_write` minus `deny_write ∪ deny_read`. Only paths that
/// exist at compile time can be split.
pub fn lower_landlock_rules(policy: &FilesystemPolicy) -> Vec<PathRule> {
    let mut rules = Vec::new();

    let mut read_roots: Vec<&PathBuf> = policy.allow_read.iter().collect();
    read_roots.extend(policy.allow_write.iter());
    let read_roots = outermost(read_roots);
    for root in read_roots {
        for path in split_around(root, &policy.deny_read, 0) {
            push_rule(&mut rules, path, RuleAccess::Read);
        }
    }

    let mut write_denied = policy.deny_write.clone();
    write_denied.extend(policy.deny_read.iter().cloned());
    for root in outermost(policy.allow_write.iter().collect()) {
        for path in split_around(root, &write_denied, 0) {
            push_rule(&mut rules, path, RuleAccess::Write);
        }
    }

    rules
}

fn push_rule(rules: &mut Vec<PathRule>, path: PathBuf, access: RuleAccess) {
    if !rules.iter().any(|r| r.path == path && r.access == access) {
        rules.push(PathRule { path, access });
    }
}

/// Drop roots already covered by another root.
fn outermost(mut roots: Vec<&PathBuf>) -> Vec<&PathBuf> {
    roots.sort();
    roots.dedup();
    let mut out: Vec<&PathBuf> = Vec::new();
    for root in roots {
        if !out.iter().any(|kept| root.starts_with(kept)) {
            out.push(root);
        }
    }
    out
}

/// `root` minus every denied subtree, as a list of grantable paths.
fn split_around(root: &Path, denied: &[PathBuf], depth: usize) -> Vec<PathBuf> {
    if denied.iter().any(|d| root.starts_with(d)) {
        return Vec::new();
    }
    if !denied.iter().any(|d| d.starts_with(root)) {
        return vec![root.to_path_buf()];
    }
    if depth >= MAX_SPLIT_DEPTH || root.is_symlink() {
        return Vec::new();
    }

    let Ok(entries) = fs::read_dir(root) else {
        return Vec::new();
    };
    let mut children: Vec<PathBuf> = entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
    children.sort();

    children
        .iter()
        .flat_map(|child| split_around(child, denied, depth + 1))
        .collect()
}

/// Deny `socket(AF_UNIX, ..)` and `ptrace` with EPERM. With `block_udp`
/// (network pinned to the proxy) datagram sockets on AF_INET/AF_INET6 are
/// denied as well, since Landlock only governs TCP connect.
#[cfg(target_os = "linux")]
fn compile_seccomp(block_udp: bool) -> Result<Vec<BpfInstruction>> {
    use nix::libc;
    use seccompiler::{
        BpfProgram, SeccompAction, SeccompCmpArgLen, SeccompCmpOp, SeccompCondition,
        SeccompFilter, SeccompRule, TargetArch,
    };
    use std::collections::BTreeMap;

    let compile_err = |e: seccompiler::BackendError| SandboxError::FilterCompile(e.to_string());

    let unix_socket = SeccompRule::new(vec![
        SeccompCondition::new(
            0,
            SeccompCmpArgLen::Dword,
            SeccompCmpOp::Eq,
            libc::AF_UNIX as u64,
        )
        .map_err(compile_err)?,
    ])
    .map_err(compile_err)?;

    let mut socket_rules = vec![unix_socket];
    if block_udp {
        for family in [libc::AF_INET, libc::AF_INET6] {
            socket_rules.push(
                SeccompRule::new(vec![
                    SeccompCondition::new(0, SeccompCmpArgLen::Dword, SeccompCmpOp::Eq, family as u64)
                        .map_err(compile_err)?,
                    // Low bits of the type argument; SOCK_NONBLOCK/SOCK_CLOEXEC sit above.
                    SeccompCondition::new(
                        1,
                        SeccompCmpArgLen::Dword,
                        SeccompCmpOp::MaskedEq(0xf),
                        libc::SOCK_DGRAM as u64,
                    )
                    .map_err(compile_err)?,
                ])
                .map_err(compile_err)?,
            );
        }
    }

    let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();
    rules.insert(libc::SYS_socket, socket_rules);
    // An empty rule list matches the syscall unconditionally.
    rules.insert(libc::SYS_ptrace, vec![]);

    let target_arch: TargetArch = std::env::consts::ARCH
        .try_into()
        .map_err(|e: seccompiler::BackendError| {
            SandboxError::FilterCompile(format!("unsupported arch: {}", e))
        })?;

    let filter = SeccompFilter::new(
        rules,
        SeccompAction::Allow,
        SeccompAction::Errno(libc::EPERM as u32),
        target_arch,
    )
    .map_err(compile_err)?;

    let bpf: BpfProgram = filter.try_into().map_err(compile_err)?;
    Ok(bpf
        .iter()
        .map(|ins| BpfInstruction {
            code: ins.code,
            jt: ins.jt,
            jf: ins.jf,
            k: ins.k,
        })
        .collect())
}

#[cfg(not(target_os = "linux"))]
fn compile_seccomp(_block_udp: bool) -> Result<Vec<BpfInstruction>> {
    Err(SandboxError::FilterCompile(
        "seccomp is only available on Linux".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn policy(write: &[&str], read: &[&str], deny_write: &[&str], deny_read: &[&str]) -> FilesystemPolicy {
        let paths = |items: &[&str]| items.iter().map(PathBuf::from).collect::<Vec<_>>();
        FilesystemPolicy {
            allow_write: paths(write),
            allow_read: paths(read),
            deny_write: paths(deny_write),
            deny_read: paths(deny_read),
        }
    }

    #[test]
    fn test_fingerprint_ignores_rule_order() {
        let a = FilterSpec::new(&policy(&["/tmp", "/data"], &["/"], &[], &[]), FilterBackend::Landlock, None);
        let b = FilterSpec::new(&policy(&["/data", "/tmp", "/tmp"], &["/"], &[], &[]), FilterBackend::Landlock, None);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().as_str().len(), 64);
    }

    #[test]
    fn test_fingerprint_changes_with_policy_and_port() {
        let base = policy(&["/tmp"], &["/"], &[], &[]);
        let a = FilterSpec::new(&base, FilterBackend::Landlock, None);
        let b = FilterSpec::new(&base.with_working_dir(Path::new("/work")), FilterBackend::Landlock, None);
        let c = FilterSpec::new(&base, FilterBackend::Landlock, Some(3128));
        let d = FilterSpec::new(&base, FilterBackend::Seatbelt, None);

        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_ne!(a.fingerprint(), d.fingerprint());
    }

    #[test]
    fn test_model_denies_write_outside_tmp() {
        let spec = FilterSpec::new(&policy(&["/tmp"], &["/"], &[], &[]), FilterBackend::Seatbelt, None);
        let filter = CompiledFilter::compile(&spec).unwrap();

        assert!(filter.permits(FsOp::Write, Path::new("/tmp/out.txt")));
        assert!(!filter.permits(FsOp::Write, Path::new("/home/user/out.txt")));
        assert!(filter.permits(FsOp::Read, Path::new("/etc/hosts")));
    }

    #[test]
    fn test_store_load_verify() {
        let tmp = TempDir::new().unwrap();
        let spec = FilterSpec::new(&policy(&["/tmp"], &["/"], &[], &[]), FilterBackend::Seatbelt, Some(8080));
        let filter = CompiledFilter::compile(&spec).unwrap();

        let path = artifact_path(&tmp.path().join("filters"), &filter.fingerprint);
        filter.store(&path).unwrap();
        let loaded = CompiledFilter::load(&path).unwrap();

        assert_eq!(loaded, filter);
        loaded.verify().unwrap();
    }

    #[test]
    fn test_verify_detects_tampering() {
        let spec = FilterSpec::new(&policy(&["/tmp"], &["/"], &[], &[]), FilterBackend::Seatbelt, None);
        let mut filter = CompiledFilter::compile(&spec).unwrap();
        filter.spec.filesystem.allow_write.push(PathBuf::from("/"));
        assert!(filter.verify().is_err());

        let mut filter = CompiledFilter::compile(&spec).unwrap();
        filter.version = ARTIFACT_VERSION + 1;
        assert!(filter.verify().is_err());
    }

    #[test]
    fn test_lowering_splits_around_denied_subtree() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("home");
        fs::create_dir_all(root.join(".ssh")).unwrap();
        fs::create_dir_all(root.join("project/.git")).unwrap();
        fs::write(root.join("notes.txt"), "x").unwrap();

        let p = |rel: &str| root.join(rel);
        let fs_policy = FilesystemPolicy {
            allow_write: vec![p("project")],
            allow_read: vec![root.clone()],
            deny_write: vec![p("project/.git")],
            deny_read: vec![p(".ssh")],
        };

        let rules = lower_landlock_rules(&fs_policy);
        let has = |path: PathBuf, access: RuleAccess| {
            rules.iter().any(|r| r.path == path && r.access == access)
        };

        // The read root is split: .ssh is never granted.
        assert!(!has(root.clone(), RuleAccess::Read));
        assert!(has(p("notes.txt"), RuleAccess::Read));
        assert!(has(p("project"), RuleAccess::Read));
        assert!(!rules.iter().any(|r| r.path.starts_with(p(".ssh"))));

        // The write root is split around .git, which stays readable.
        assert!(!has(p("project"), RuleAccess::Write));
        assert!(!has(p("project/.git"), RuleAccess::Write));
    }

    #[test]
    fn test_lowering_keeps_roots_without_denies() {
        let rules = lower_landlock_rules(&policy(&["/tmp"], &["/usr", "/usr/lib"], &[], &[]));
        assert_eq!(
            rules,
            vec![
                PathRule { path: PathBuf::from("/tmp"), access: RuleAccess::Read },
                PathRule { path: PathBuf::from("/usr"), access: RuleAccess::Read },
                PathRule { path: PathBuf::from("/tmp"), access: RuleAccess::Write },
            ]
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_landlock_compile_includes_seccomp() {
        let spec = FilterSpec::new(&policy(&["/tmp"], &["/usr"], &[], &[]), FilterBackend::Landlock, Some(4000));
        let filter = CompiledFilter::compile(&spec).unwrap();
        match filter.program {
            FilterProgram::Landlock { rules, connect_ports, seccomp } => {
                assert!(!rules.is_empty());
                assert_eq!(connect_ports, Some(vec![4000]));
                assert!(!seccomp.is_empty());
            }
            other => panic!("unexpected program: {:?}", other),
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_pinned_network_adds_datagram_rules() {
        let fs_policy = policy(&["/tmp"], &["/usr"], &[], &[]);
        let seccomp_of = |port: Option<u16>| {
            let spec = FilterSpec::new(&fs_policy, FilterBackend::Landlock, port);
            match CompiledFilter::compile(&spec).unwrap().program {
                FilterProgram::Landlock { seccomp, .. } => seccomp,
                other => panic!("unexpected program: {:?}", other),
            }
        };

        let open = seccomp_of(None);
        let pinned = seccomp_of(Some(4000));
        assert!(pinned.len() > open.len());
        assert_eq!(seccomp_of(Some(4000)), pinned);
    }
}
