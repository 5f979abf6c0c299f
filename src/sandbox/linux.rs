use nix::libc;

use super::filter::{BpfInstruction, PathRule, RuleAccess};

/// Install the restriction into the calling process: NO_NEW_PRIVS, then
/// Landlock, then seccomp.
///
/// seccomp goes last because it may block syscalls Landlock setup needs.
/// A kernel without Landlock is reported and skipped; seccomp still applies.
pub fn apply(
    rules: &[PathRule],
    connect_ports: Option<&[u16]>,
    seccomp: &[BpfInstruction],
) -> Result<(), String> {
    set_no_new_privs()?;

    if let Err(e) = apply_landlock(rules, connect_ports) {
        eprintln!("shellfence-apply: landlock not applied: {}", e);
    }

    apply_seccomp(seccomp)
}

fn set_no_new_privs() -> Result<(), String> {
    // prctl(PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0)
    let ret = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if ret != 0 {
        return Err(format!(
            "PR_SET_NO_NEW_PRIVS failed: {}",
            std::io::Error::last_os_error()
        ));
    }
    Ok(())
}

/// Apply Landlock path and port rules.
///
/// The ruleset is negotiated best-effort from ABI v5 down, so rights the
/// kernel does not know are dropped rather than failing. Paths that vanished
/// since compile time are skipped.
fn apply_landlock(rules: &[PathRule], connect_ports: Option<&[u16]>) -> Result<(), String> {
    use landlock::{
        ABI, Access, AccessFs, AccessNet, NetPort, PathBeneath, PathFd, Ruleset, RulesetAttr,
        RulesetCreatedAttr, RulesetStatus,
    };

    let abi = ABI::V5;
    let read_access = AccessFs::from_read(abi) | AccessFs::IoctlDev;
    let write_access = AccessFs::from_all(abi);
    let file_access = AccessFs::from_file(abi);

    let mut ruleset = Ruleset::default()
        .handle_access(AccessFs::from_all(abi))
        .map_err(|e| format!("Landlock ruleset creation: {}", e))?;
    if connect_ports.is_some() {
        ruleset = ruleset
            .handle_access(AccessNet::ConnectTcp)
            .map_err(|e| format!("Landlock network access: {}", e))?;
    }
    let mut ruleset = ruleset
        .create()
        .map_err(|e| format!("Landlock ruleset create: {}", e))?;

    for rule in rules {
        let Ok(fd) = PathFd::new(&rule.path) else {
            continue;
        };
        let mut access = match rule.access {
            RuleAccess::Read => read_access,
            RuleAccess::Write => write_access,
        };
        if !rule.path.is_dir() {
            access &= file_access;
        }
        // A rejected rule only narrows access; keep going.
        if let Err(e) = (&mut ruleset).add_rule(PathBeneath::new(fd, access)) {
            eprintln!(
                "shellfence-apply: skipping rule for {}: {}",
                rule.path.display(),
                e
            );
        }
    }

    for port in connect_ports.unwrap_or_default() {
        (&mut ruleset)
            .add_rule(NetPort::new(*port, AccessNet::ConnectTcp))
            .map_err(|e| format!("Landlock port rule {}: {}", port, e))?;
    }

    let status = ruleset
        .restrict_self()
        .map_err(|e| format!("Landlock restrict_self: {}", e))?;

    match status.ruleset {
        RulesetStatus::FullyEnforced => {}
        RulesetStatus::PartiallyEnforced => {
            eprintln!("shellfence-apply: Landlock partially enforced (ABI downgrade)");
        }
        RulesetStatus::NotEnforced => {
            return Err("Landlock not enforced by kernel".to_string());
        }
    }

    Ok(())
}

/// Load a precompiled seccomp-bpf program.
fn apply_seccomp(program: &[BpfInstruction]) -> Result<(), String> {
    if program.is_empty() {
        return Ok(());
    }

    let bpf: seccompiler::BpfProgram = program
        .iter()
        .map(|ins| seccompiler::sock_filter {
            code: ins.code,
            jt: ins.jt,
            jf: ins.jf,
            k: ins.k,
        })
        .collect();

    seccompiler::apply_filter(&bpf).map_err(|e| format!("seccomp apply_filter: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::filter::{CompiledFilter, FilterBackend, FilterProgram, FilterSpec};
    use crate::sandbox::policy::FilesystemPolicy;
    use std::path::PathBuf;

    // Applying a filter would restrict the test process itself, so these
    // tests stop at the program the helper would load.

    #[test]
    fn test_seccomp_program_converts() {
        let policy = FilesystemPolicy {
            allow_write: vec![PathBuf::from("/tmp")],
            ..Default::default()
        };
        let spec = FilterSpec::new(&policy, FilterBackend::Landlock, None);
        let FilterProgram::Landlock { seccomp, .. } = CompiledFilter::compile(&spec).unwrap().program
        else {
            panic!("expected a Landlock program");
        };

        let bpf: seccompiler::BpfProgram = seccomp
            .iter()
            .map(|ins| seccompiler::sock_filter {
                code: ins.code,
                jt: ins.jt,
                jf: ins.jf,
                k: ins.k,
            })
            .collect();
        assert!(!bpf.is_empty());
        assert_eq!(bpf.len(), seccomp.len());
    }

    #[test]
    fn test_empty_seccomp_is_noop() {
        assert!(apply_seccomp(&[]).is_ok());
    }
}
