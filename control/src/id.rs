//! ID minting and exit-code/command-normalization policy (C9).

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Nanosecond timestamp bumped by a process-wide sequence counter so two
/// ids minted within the same clock tick never collide, even on platforms
/// with coarse `SystemTime` resolution.
fn unique_nanos() -> u128 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let bump = u128::from(SEQUENCE.fetch_add(1, Ordering::Relaxed));
    nanos + bump
}

pub fn mint_sandbox_id() -> String {
    format!("cr-{}", unique_nanos())
}

pub fn mint_execution_id() -> String {
    format!("exec-{}", unique_nanos())
}

pub fn mint_run_id() -> String {
    format!("run-{}", unique_nanos())
}

/// `128 + signal` for `1 <= signal <= 127`, else `130` (the SIGINT exit
/// code), matching POSIX shell exit-status convention for signaled
/// processes.
pub fn signal_to_exit(signal: i32) -> i32 {
    if (1..=127).contains(&signal) {
        128 + signal
    } else {
        130
    }
}

/// Strip a leading `--` sentinel element. Inner argument whitespace is
/// never touched here; only the guest trims `command[0]` for validity
/// checks, and it does so on its own copy, not the argv passed to the
/// child.
pub fn normalize_command(command: Vec<String>) -> Vec<String> {
    match command.split_first() {
        Some((first, rest)) if first == "--" => rest.to_vec(),
        _ => command,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_expected_prefixes_and_are_unique() {
        let a = mint_sandbox_id();
        let b = mint_sandbox_id();
        assert!(a.starts_with("cr-"));
        assert!(b.starts_with("cr-"));
        assert_ne!(a, b);
        assert!(mint_execution_id().starts_with("exec-"));
        assert!(mint_run_id().starts_with("run-"));
    }

    #[test]
    fn signal_to_exit_matches_policy() {
        assert_eq!(signal_to_exit(1), 129);
        assert_eq!(signal_to_exit(2), 130);
        assert_eq!(signal_to_exit(9), 137);
        assert_eq!(signal_to_exit(15), 143);
        assert_eq!(signal_to_exit(127), 255);
        assert_eq!(signal_to_exit(0), 130);
        assert_eq!(signal_to_exit(128), 130);
        assert_eq!(signal_to_exit(-1), 130);
    }

    #[test]
    fn normalize_command_strips_only_leading_sentinel() {
        let stripped = normalize_command(vec!["--".to_string(), "echo".to_string(), "hi".to_string()]);
        assert_eq!(stripped, vec!["echo".to_string(), "hi".to_string()]);

        let untouched = normalize_command(vec!["echo".to_string(), "--".to_string()]);
        assert_eq!(untouched, vec!["echo".to_string(), "--".to_string()]);
    }

    #[test]
    fn normalize_command_preserves_trailing_whitespace_in_args() {
        let cmd = normalize_command(vec![
            "head".to_string(),
            "-c".to_string(),
            "10".to_string(),
            "--".to_string(),
            "/path/result.txt ".to_string(),
        ]);
        assert_eq!(cmd[4], "/path/result.txt ");
    }
}
