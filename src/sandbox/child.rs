use std::ffi::OsString;
use std::path::PathBuf;

use super::filter::{CompiledFilter, FilterBackend, FilterProgram};

/// argv[0] suffix that routes the binary into [`apply_main`].
pub const APPLY_HELPER_NAME: &str = "shellfence-apply";

/// Exit status when the artifact cannot be trusted or applied.
const EXIT_BAD_ARTIFACT: i32 = 126;

/// Entry point for the apply helper.
///
/// Runs before any runtime or logger exists, so it reports on stderr. Never
/// returns: it installs the restriction into this process and then execs the
/// target, which inherits it.
///
/// argv layout:
///   argv[0] = "shellfence-apply" (already matched by dispatch)
///   argv[1] = compiled filter artifact path
///   argv[2] = program to exec
///   argv[3..] = its arguments
pub fn apply_main() -> ! {
    let args: Vec<OsString> = std::env::args_os().collect();

    if args.len() < 3 {
        eprintln!("{}: usage: {} <artifact> <program> [args...]", APPLY_HELPER_NAME, APPLY_HELPER_NAME);
        std::process::exit(2);
    }

    let artifact = PathBuf::from(&args[1]);
    let filter = match CompiledFilter::load(&artifact).and_then(|f| f.verify().map(|()| f)) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!(
                "{}: refusing to run with artifact {}: {}",
                APPLY_HELPER_NAME,
                artifact.display(),
                e
            );
            std::process::exit(EXIT_BAD_ARTIFACT);
        }
    };

    if let Err(e) = check_backend(&filter.program) {
        refuse(e);
    }
    exec_restricted(&filter, &args[2], &args[3..]);
}

/// Exit with [`EXIT_BAD_ARTIFACT`] without running the target.
fn refuse(reason: impl std::fmt::Display) -> ! {
    eprintln!("{}: refusing to run: {}", APPLY_HELPER_NAME, reason);
    std::process::exit(EXIT_BAD_ARTIFACT);
}

/// The artifact must target the backend this build applies.
fn check_backend(program: &FilterProgram) -> Result<(), String> {
    let wanted = match program {
        FilterProgram::Landlock { .. } => FilterBackend::Landlock,
        FilterProgram::Seatbelt { .. } => FilterBackend::Seatbelt,
    };
    match FilterBackend::for_platform() {
        Some(backend) if backend == wanted => Ok(()),
        Some(backend) => Err(format!(
            "{:?} artifact cannot be applied by the {:?} backend",
            wanted, backend
        )),
        None => Err("no restriction backend on this platform".to_string()),
    }
}

#[cfg(target_os = "linux")]
fn exec_restricted(filter: &CompiledFilter, program: &OsString, args: &[OsString]) -> ! {
    let FilterProgram::Landlock {
        rules,
        connect_ports,
        seccomp,
    } = &filter.program
    else {
        refuse("Seatbelt artifact on Linux");
    };
    if let Err(e) = super::linux::apply(rules, connect_ports.as_deref(), seccomp) {
        refuse(format!("restriction not applied: {}", e));
    }
    exec(program, args)
}

#[cfg(target_os = "macos")]
fn exec_restricted(filter: &CompiledFilter, program: &OsString, args: &[OsString]) -> ! {
    let FilterProgram::Seatbelt { profile } = &filter.program else {
        refuse("Landlock artifact on macOS");
    };
    let err = super::macos::exec_seatbelt(profile, program, args);
    refuse(format!("failed to exec sandbox-exec: {}", err))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn exec_restricted(_filter: &CompiledFilter, _program: &OsString, _args: &[OsString]) -> ! {
    refuse("no restriction backend on this platform")
}

/// Replace this process with `program`.
#[cfg(target_os = "linux")]
fn exec(program: &OsString, args: &[OsString]) -> ! {
    use std::os::unix::process::CommandExt;

    let err = std::process::Command::new(program).args(args).exec();

    // exec() only returns on error
    eprintln!(
        "{}: failed to exec {}: {}",
        APPLY_HELPER_NAME,
        program.to_string_lossy(),
        err
    );
    std::process::exit(127);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::filter::FilterSpec;
    use crate::sandbox::policy::FilesystemPolicy;

    fn program_for(backend: FilterBackend) -> FilterProgram {
        match backend {
            FilterBackend::Landlock => FilterProgram::Landlock {
                rules: Vec::new(),
                connect_ports: None,
                seccomp: Vec::new(),
            },
            FilterBackend::Seatbelt => FilterProgram::Seatbelt {
                profile: "(version 1)".to_string(),
            },
        }
    }

    #[test]
    fn test_native_artifact_is_accepted() {
        let Some(native) = FilterBackend::for_platform() else {
            return;
        };
        assert!(check_backend(&program_for(native)).is_ok());

        let policy = FilesystemPolicy {
            allow_write: vec![std::path::PathBuf::from("/tmp")],
            ..Default::default()
        };
        let filter = CompiledFilter::compile(&FilterSpec::new(&policy, native, None)).unwrap();
        assert!(check_backend(&filter.program).is_ok());
    }

    #[test]
    fn test_foreign_artifact_is_refused() {
        let foreign = match FilterBackend::for_platform() {
            Some(FilterBackend::Landlock) => FilterBackend::Seatbelt,
            _ => FilterBackend::Landlock,
        };
        let err = check_backend(&program_for(foreign)).unwrap_err();
        assert!(!err.is_empty());
    }
}
