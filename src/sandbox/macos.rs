use std::ffi::OsString;
use std::os::unix::process::CommandExt;

const SANDBOX_EXEC: &str = "/usr/bin/sandbox-exec";

/// Exec `program` under `sandbox-exec -p <profile>`. Only returns on
/// failure, with the exec error.
///
/// Seatbelt cannot be installed into the current process by an unprivileged
/// caller, so the restriction is applied by sandbox-exec right before it
/// execs the target.
pub fn exec_seatbelt(profile: &str, program: &OsString, args: &[OsString]) -> std::io::Error {
    std::process::Command::new(SANDBOX_EXEC)
        .arg("-p")
        .arg(profile)
        .arg(program)
        .args(args)
        .exec()
}
