//! Seatbelt (SBPL) profile generation for the macOS backend.
//!
//! SBPL applies the last matching rule, so the profile is laid out as broad
//! process allowances, then read grants, then write grants, and finally the
//! deny rules.

use std::path::{Path, PathBuf};

use super::policy::FilesystemPolicy;

pub fn profile(policy: &FilesystemPolicy, proxy_port: Option<u16>) -> String {
    let mut rules = vec![
        "(version 1)".to_string(),
        "(deny default)".to_string(),
        "(allow process*)".to_string(),
        "(allow signal)".to_string(),
        "(allow mach*)".to_string(),
        "(allow ipc*)".to_string(),
        "(allow sysctl*)".to_string(),
        "(allow pseudo-tty)".to_string(),
        // stat() on any path; path resolution needs it.
        "(allow file-read-metadata)".to_string(),
        "(allow file-write* (subpath \"/dev\"))".to_string(),
    ];

    let mut read_roots: Vec<&PathBuf> = policy.allow_read.iter().collect();
    read_roots.extend(policy.allow_write.iter());
    if read_roots.iter().any(|p| p.parent().is_none()) {
        rules.push("(allow file-read*)".to_string());
    } else {
        for path in read_roots {
            rules.push(format!("(allow file-read* {})", subpath(path)));
        }
    }

    for path in &policy.allow_write {
        rules.push(format!("(allow file-write* {})", subpath(path)));
    }

    for path in &policy.deny_read {
        rules.push(format!("(deny file-read* {})", subpath(path)));
    }
    for path in &policy.deny_write {
        rules.push(format!("(deny file-write* {})", subpath(path)));
    }

    match proxy_port {
        Some(port) => {
            rules.push("(deny network*)".to_string());
            rules.push(format!(
                "(allow network-outbound (remote ip \"localhost:{}\"))",
                port
            ));
        }
        None => rules.push("(allow network*)".to_string()),
    }

    rules.join("\n")
}

fn subpath(path: &Path) -> String {
    format!("(subpath \"{}\")", escape_sbpl_path(&path.to_string_lossy()))
}

fn escape_sbpl_path(path: &str) -> String {
    path.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_policy() -> FilesystemPolicy {
        FilesystemPolicy {
            allow_write: vec![PathBuf::from("/Users/test/project"), PathBuf::from("/tmp")],
            allow_read: vec![PathBuf::from("/")],
            deny_write: vec![PathBuf::from("/Users/test/.zshrc")],
            deny_read: vec![PathBuf::from("/Users/test/.ssh")],
        }
    }

    #[test]
    fn test_profile_starts_with_deny_default() {
        let profile = profile(&test_policy(), None);
        assert!(profile.starts_with("(version 1)\n(deny default)"));
    }

    #[test]
    fn test_root_read_becomes_broad_read() {
        let profile = profile(&test_policy(), None);
        assert!(profile.contains("(allow file-read*)\n"));
        assert!(!profile.contains("(allow file-read* (subpath \"/\"))"));
    }

    #[test]
    fn test_deny_rules_come_after_allows() {
        let profile = profile(&test_policy(), None);
        let write = profile
            .find("(allow file-write* (subpath \"/Users/test/project\"))")
            .unwrap();
        let deny_read = profile
            .find("(deny file-read* (subpath \"/Users/test/.ssh\"))")
            .unwrap();
        let deny_write = profile
            .find("(deny file-write* (subpath \"/Users/test/.zshrc\"))")
            .unwrap();
        assert!(deny_read > write);
        assert!(deny_write > write);
    }

    #[test]
    fn test_restricted_network_only_reaches_proxy() {
        let profile = profile(&test_policy(), Some(41234));
        assert!(profile.contains("(deny network*)"));
        assert!(profile.contains("(allow network-outbound (remote ip \"localhost:41234\"))"));

        let open = super::profile(&test_policy(), None);
        assert!(open.ends_with("(allow network*)"));
    }

    #[test]
    fn test_scoped_reads() {
        let policy = FilesystemPolicy {
            allow_write: vec![PathBuf::from("/tmp")],
            allow_read: vec![PathBuf::from("/usr")],
            ..Default::default()
        };
        let profile = profile(&policy, None);
        assert!(profile.contains("(allow file-read* (subpath \"/usr\"))"));
        assert!(profile.contains("(allow file-read* (subpath \"/tmp\"))"));
        assert!(!profile.contains("(allow file-read*)\n"));
    }

    #[test]
    fn test_escape_sbpl_path() {
        assert_eq!(escape_sbpl_path("/simple/path"), "/simple/path");
        assert_eq!(
            escape_sbpl_path("/path/with \"quotes\""),
            "/path/with \\\"quotes\\\""
        );
    }
}
