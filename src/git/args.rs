//! Argument vetting applied to every argv element before a git child is
//! spawned. Two filters run in order: a byte-level safe-value filter, then a
//! deny-list of flags that reach git's hook and transport machinery.

use crate::errors::{ForgeError, Result};

/// Flags that allow arbitrary command execution through git itself. Matched
/// as prefixes so `--upload-pack=/tmp/x` and `--upload-pack` both trip.
const BROKEN_FLAG_PREFIXES: &[&str] = &[
    "--upload-pack",
    "--receive-pack",
    "--exec",
    "--upload-archive",
];

/// `-c key=value` configuration keys that redirect execution.
const BROKEN_CONFIG_PREFIXES: &[&str] = &["core.sshcommand", "protocol."];

/// System prefixes that must never appear as the right-hand side of a
/// `flag=value` argument.
const FORBIDDEN_VALUE_ROOTS: &[&str] = &["/etc", "/usr", "/var", "/dev", "/proc"];

/// Byte-level safe-value filter.
///
/// Accepts only printable ASCII plus TAB. NUL, CR, LF, other control bytes,
/// bytes above 0x7E, and the shell metacharacters `;`, `|`, `&`, `$`, and
/// backtick are all rejected. The filter is sound by construction: an
/// accepted string cannot terminate, chain, or substitute a shell command
/// even if it were (incorrectly) rendered into a shell line.
pub fn is_safe_value(value: &str) -> bool {
    for &b in value.as_bytes() {
        match b {
            b'\t' => {}
            0x00..=0x1F => return false,
            0x7F.. => return false,
            b';' | b'|' | b'&' | b'$' | b'`' => return false,
            _ => {}
        }
    }
    true
}

/// Apply the safe-value filter, yielding `InvalidArgument` on rejection.
pub fn check_safe_value(value: &str) -> Result<()> {
    if is_safe_value(value) {
        Ok(())
    } else {
        Err(ForgeError::InvalidArgument(format!(
            "unsafe bytes in argument: {:?}",
            value
        )))
    }
}

/// Apply the known-broken-flag filter to one argument, with lookahead for
/// `-c key=value` pairs (`prev` is the previous argument, if any).
fn check_flag(prev: Option<&str>, arg: &str) -> Result<()> {
    let lowered = arg.to_ascii_lowercase();

    for prefix in BROKEN_FLAG_PREFIXES {
        if lowered == *prefix || lowered.starts_with(&format!("{prefix}=")) {
            return Err(ForgeError::CommandInjection(arg.to_string()));
        }
    }

    // `-c core.sshCommand=...` arrives either as one token after `-c`, or
    // inline as `-ccore.sshCommand=...`.
    let config_payload = if prev == Some("-c") {
        Some(lowered.as_str())
    } else {
        lowered.strip_prefix("-c")
    };
    if let Some(payload) = config_payload {
        for prefix in BROKEN_CONFIG_PREFIXES {
            if payload.starts_with(prefix) {
                return Err(ForgeError::CommandInjection(arg.to_string()));
            }
        }
    }

    // Any flag whose value is an absolute path into a system tree.
    if arg.starts_with('-')
        && let Some((_, value)) = arg.split_once('=')
        && FORBIDDEN_VALUE_ROOTS
            .iter()
            .any(|root| value == *root || value.starts_with(&format!("{root}/")))
    {
        return Err(ForgeError::CommandInjection(arg.to_string()));
    }

    Ok(())
}

/// Validate a full argument vector. Returns the first failure; on failure the
/// command must never be spawned.
pub fn check_args<S: AsRef<str>>(args: &[S]) -> Result<()> {
    let mut prev: Option<&str> = None;
    for arg in args {
        let arg = arg.as_ref();
        check_safe_value(arg)?;
        check_flag(prev, arg)?;
        prev = Some(arg);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::quickcheck;

    /// Plain porcelain arguments pass both filters.
    #[test]
    fn accepts_plain_args() {
        assert!(check_args(&["log", "--oneline", "-n", "20"]).is_ok());
        assert!(check_args(&["cat-file", "blob", "HEAD:README.md"]).is_ok());
        assert!(check_args(&["lfs", "ls-files", "--all", "--long"]).is_ok());
    }

    /// Shell metacharacters are rejected wherever they appear.
    #[test]
    fn rejects_shell_metacharacters() {
        assert!(check_args(&["log", "; rm -rf /"]).is_err());
        assert!(check_args(&["log", "a|b"]).is_err());
        assert!(check_args(&["log", "$(whoami)"]).is_err());
        assert!(check_args(&["log", "`id`"]).is_err());
        assert!(check_args(&["log", "a&b"]).is_err());
    }

    /// Control bytes and non-ASCII are rejected; TAB is tolerated.
    #[test]
    fn rejects_control_bytes() {
        assert!(check_args(&["a\0b"]).is_err());
        assert!(check_args(&["a\nb"]).is_err());
        assert!(check_args(&["a\rb"]).is_err());
        assert!(check_args(&["a\x1bb"]).is_err());
        assert!(check_args(&["caf\u{e9}"]).is_err());
        assert!(check_args(&["a\tb"]).is_ok());
    }

    /// The hook/transport flags trip the injection filter in every spelling.
    #[test]
    fn rejects_broken_flags() {
        for arg in [
            "--upload-pack=/tmp/evil",
            "--upload-pack",
            "--receive-pack=/tmp/evil",
            "--exec=/tmp/evil",
            "--upload-archive=/tmp/evil",
            "--Upload-Pack=/tmp/evil",
        ] {
            let err = check_args(&["clone", arg]).unwrap_err();
            assert!(
                matches!(err, ForgeError::CommandInjection(_)),
                "expected injection for {arg}, got {err}"
            );
        }
    }

    /// `-c core.sshCommand` and `-c protocol.*` are rejected split or inline.
    #[test]
    fn rejects_broken_config() {
        assert!(check_args(&["-c", "core.sshCommand=evil", "fetch"]).is_err());
        assert!(check_args(&["-ccore.sshcommand=evil", "fetch"]).is_err());
        assert!(check_args(&["-c", "protocol.ext.allow=always", "fetch"]).is_err());
        // Benign config still passes.
        assert!(check_args(&["-c", "color.ui=false", "log"]).is_ok());
    }

    /// Absolute system paths on a flag's right-hand side are rejected.
    #[test]
    fn rejects_system_path_values() {
        assert!(check_args(&["--output=/etc/passwd"]).is_err());
        assert!(check_args(&["--output=/proc/self/environ"]).is_err());
        assert!(check_args(&["--output=/tmp/fine"]).is_ok());
        // Non-flag positional values are not path-filtered.
        assert!(check_args(&["log", "/usr/share"]).is_ok());
    }

    quickcheck! {
        /// Soundness: any accepted string is free of bytes that could split
        /// a rendered shell line into more than one token or command.
        fn accepted_strings_have_no_shell_bytes(s: String) -> bool {
            if !is_safe_value(&s) {
                return true;
            }
            s.bytes().all(|b| {
                b == b'\t' || ((0x20..=0x7E).contains(&b)
                    && !matches!(b, b';' | b'|' | b'&' | b'$' | b'`'))
            })
        }
    }
}
