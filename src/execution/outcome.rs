//! Classification of failed tool invocations.
//!
//! Network-ish stderr is checked first, so a message that mentions both a
//! connection failure and a missing remote is retried.

use super::ExecutionError;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref TRANSIENT_PATTERNS: Vec<Regex> = [
        r"(?i)could not resolve host",
        r"(?i)temporary failure in name resolution",
        r"(?i)connection (timed out|refused|reset)",
        r"(?i)operation timed out",
        r"(?i)network is unreachable",
        r"(?i)the remote end hung up unexpectedly",
        r"(?i)early eof",
        r"(?i)rpc failed",
        r"(?i)\b(429|502|503|504)\b",
        r"(?i)too many requests",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect();
    static ref PERMANENT_PATTERNS: Vec<Regex> = [
        r"(?i)repository ('[^']*' )?not found",
        r"(?i)does not appear to be a git repository",
        r"(?i)not a git repository",
        r"(?i)could not read from remote repository",
        r"(?i)authentication failed",
        r"(?i)permission denied",
        r"(?i)\b(401|403|404|410)\b",
        r"(?i)does not exist",
        r"(?i)corrupt",
        r"(?i)invalid (url|path)",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect();
}

/// Turn a failed step into a typed error.
///
/// `exit_code` is `None` when the process was killed by a signal.
pub fn classify_failure(step: &str, exit_code: Option<i32>, stderr: &str) -> ExecutionError {
    let Some(code) = exit_code else {
        return ExecutionError::Unexpected(format!("{} killed by signal", step));
    };

    let detail = format!("{} exited with {}: {}", step, code, stderr.trim());
    if TRANSIENT_PATTERNS.iter().any(|re| re.is_match(stderr)) {
        ExecutionError::Transient(detail)
    } else if PERMANENT_PATTERNS.iter().any(|re| re.is_match(stderr)) {
        ExecutionError::Permanent(detail)
    } else {
        ExecutionError::Unexpected(detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_errors_are_transient() {
        let err = classify_failure(
            "clone",
            Some(128),
            "fatal: unable to access 'https://example.org/ds/': Could not resolve host: example.org",
        );
        assert!(matches!(err, ExecutionError::Transient(_)));

        let err = classify_failure("clone", Some(1), "error: RPC failed; curl 56 GnuTLS recv error");
        assert!(matches!(err, ExecutionError::Transient(_)));
    }

    #[test]
    fn test_missing_repository_is_permanent() {
        let err = classify_failure(
            "clone",
            Some(128),
            "remote: Repository not found.\nfatal: repository 'https://example.org/x/' not found",
        );
        assert!(matches!(err, ExecutionError::Permanent(_)));
    }

    #[test]
    fn test_transient_wins_over_permanent() {
        let err = classify_failure(
            "clone",
            Some(128),
            "ssh: connect to host example.org port 22: Connection timed out\n\
             fatal: Could not read from remote repository.",
        );
        assert!(matches!(err, ExecutionError::Transient(_)));
    }

    #[test]
    fn test_unknown_output_and_signals_are_unexpected() {
        assert!(matches!(
            classify_failure("probe", Some(2), "something odd happened"),
            ExecutionError::Unexpected(_)
        ));
        assert_eq!(
            classify_failure("clone", None, ""),
            ExecutionError::Unexpected("clone killed by signal".to_string())
        );
    }
}
