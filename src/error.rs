// ─── ProbeError ─────────────────────────────────────────────────────────────

/// Classification of a failed probe or recording attempt.
///
/// Every kind maps to a fixed policy in the supervisor loop: most are counted
/// in the governor window and retried after back-off; `UnknownHost` comments
/// the room out instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The room exists but is not broadcasting.
    NotLive,
    /// The resolver could not make sense of the platform's response.
    ParseFailure,
    /// Connection, TLS, or timeout trouble on the way to the platform.
    NetworkFailure,
    /// The platform demands login state we do not have (or it expired).
    AuthRequired,
    /// The platform is unreachable without a proxy from this network.
    ProxyRequired,
    /// No resolver claims this host.
    UnknownHost,
    /// The muxer process ended with a non-zero exit status.
    RecorderExitNonZero,
}

impl ErrorKind {
    /// Stable string used in logs and counters.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotLive => "not_live",
            Self::ParseFailure => "parse_failure",
            Self::NetworkFailure => "network_failure",
            Self::AuthRequired => "auth_required",
            Self::ProxyRequired => "proxy_required",
            Self::UnknownHost => "unknown_host",
            Self::RecorderExitNonZero => "recorder_exit_non_zero",
        }
    }

    /// Whether this kind feeds the governor's error window.
    ///
    /// `NotLive` is a normal probe outcome and `UnknownHost` removes the room
    /// from rotation entirely, so neither counts against concurrency.
    pub fn counts_toward_governor(&self) -> bool {
        !matches!(self, Self::NotLive | Self::UnknownHost)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure with a human-readable message.
#[derive(Debug, Clone)]
pub struct ProbeError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ProbeError {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
        }
    }

    /// For platform resolvers that report "offline" as an error value.
    #[allow(dead_code)]
    pub fn not_live() -> Self {
        Self::new(ErrorKind::NotLive, "room is offline")
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::ParseFailure, msg)
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NetworkFailure, msg)
    }

    /// For platform resolvers hitting expired login state.
    #[allow(dead_code)]
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthRequired, msg)
    }

    pub fn proxy_required(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProxyRequired, msg)
    }

    pub fn unknown_host(host: &str) -> Self {
        Self::new(
            ErrorKind::UnknownHost,
            format!("no resolver matches host '{host}'"),
        )
    }

    pub fn recorder_exit(code: Option<i32>) -> Self {
        Self::new(
            ErrorKind::RecorderExitNonZero,
            match code {
                Some(c) => format!("muxer exited with status {c}"),
                None => "muxer was killed by a signal".to_string(),
            },
        )
    }
}

impl std::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ProbeError {}

impl From<reqwest::Error> for ProbeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::parse(e.to_string())
        } else {
            Self::network(e.to_string())
        }
    }
}

impl From<std::io::Error> for ProbeError {
    fn from(e: std::io::Error) -> Self {
        Self::network(e.to_string())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn governor_counting_policy() {
        assert!(!ErrorKind::NotLive.counts_toward_governor());
        assert!(!ErrorKind::UnknownHost.counts_toward_governor());
        assert!(ErrorKind::NetworkFailure.counts_toward_governor());
        assert!(ErrorKind::ParseFailure.counts_toward_governor());
        assert!(ErrorKind::AuthRequired.counts_toward_governor());
        assert!(ErrorKind::RecorderExitNonZero.counts_toward_governor());
    }

    #[test]
    fn display_includes_kind_and_message() {
        let e = ProbeError::network("connection reset");
        let s = e.to_string();
        assert!(s.contains("network_failure"));
        assert!(s.contains("connection reset"));
    }

    #[test]
    fn recorder_exit_message() {
        assert!(ProbeError::recorder_exit(Some(1)).message.contains('1'));
        assert!(ProbeError::recorder_exit(None).message.contains("signal"));
    }
}
