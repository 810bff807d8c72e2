//! # Transient Error Classification
//!
//! Decides whether a failure from the network, an object store or a SQL backend
//! is worth retrying. Anything not recognized here is permanent.

use std::io;

/// Message fragments that identify transient network and service failures
const TRANSIENT_MESSAGE_PATTERNS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection closed",
    "broken pipe",
    "no such host",
    "dns error",
    "failed to lookup address",
    "name resolution",
    "tls handshake timeout",
    "handshake timed out",
    "unexpected eof",
    "timed out",
    "timeout",
    "too many requests",
    "slowdown",
    "slow down",
    "service unavailable",
    "internalerror",
    "temporarily unavailable",
    "too many connections",
    "deadlock",
];

/// SQLSTATE codes treated as transient
///
/// 53300 too_many_connections, 40001 serialization_failure, 40P01 deadlock_detected,
/// 55P03 lock_not_available, 57P03 cannot_connect_now, 08000/08001/08006 connection failures.
const TRANSIENT_SQLSTATE_CODES: &[&str] = &[
    "53300", "40001", "40P01", "55P03", "57P03", "08000", "08001", "08006",
];

/// MySQL server error numbers treated as transient
///
/// 1040 too many connections, 1205 lock wait timeout, 1213 deadlock.
const TRANSIENT_MYSQL_ERRORS: &[u16] = &[1040, 1205, 1213];

/// HTTP 429 and every 5xx are retried
pub fn is_transient_http_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// 4xx other than 429 are final
pub fn is_permanent_http_status(status: u16) -> bool {
    (400..500).contains(&status) && status != 429
}

/// Match an error message against the known transient fragments
pub fn is_transient_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    if lower.contains("nosuchkey") || lower.contains("not found") {
        return false;
    }
    TRANSIENT_MESSAGE_PATTERNS
        .iter()
        .any(|pattern| lower.contains(pattern))
}

pub fn is_transient_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::Interrupted
    ) || is_transient_message(&err.to_string())
}

pub fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Io(io_err) => is_transient_io(io_err),
        sqlx::Error::Tls(tls_err) => is_transient_message(&tls_err.to_string()),
        sqlx::Error::Database(db_err) => {
            if let Some(mysql) = db_err.try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>() {
                if TRANSIENT_MYSQL_ERRORS.contains(&mysql.number()) {
                    return true;
                }
            }
            db_err
                .code()
                .map(|code| TRANSIENT_SQLSTATE_CODES.contains(&code.as_ref()))
                .unwrap_or(false)
                || is_transient_message(db_err.message())
        }
        _ => false,
    }
}

pub fn is_transient_reqwest(err: &reqwest::Error) -> bool {
    if err.is_timeout() || err.is_connect() {
        return true;
    }
    if let Some(status) = err.status() {
        return is_transient_http_status(status.as_u16());
    }
    is_transient_message(&err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_classification() {
        assert!(is_transient_http_status(429));
        assert!(is_transient_http_status(503));
        assert!(!is_transient_http_status(404));
        assert!(is_permanent_http_status(403));
        assert!(!is_permanent_http_status(429));
    }

    #[test]
    fn test_message_classification() {
        assert!(is_transient_message("dial tcp: connection refused"));
        assert!(is_transient_message("net/http: TLS handshake timeout"));
        assert!(is_transient_message("unexpected EOF"));
        assert!(!is_transient_message("NoSuchKey: the key does not exist"));
        assert!(!is_transient_message("access denied"));
    }

    #[test]
    fn test_io_classification() {
        let err = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        assert!(is_transient_io(&err));
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert!(!is_transient_io(&err));
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        assert!(is_transient_sqlx(&sqlx::Error::PoolTimedOut));
        assert!(!is_transient_sqlx(&sqlx::Error::RowNotFound));
    }
}
