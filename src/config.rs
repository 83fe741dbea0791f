//! Every duration constant the handshake layers use, gathered in one place
//! so a caller can shrink timeouts for tests without touching layer code —
//! the same role the teacher's `HandshakeContext` plays for its handshake.

use std::time::Duration;

/// Timer constants for the CMI, CSHP and CSH layers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HandshakeConfig {
    /// CMI's shared client/server timeout waiting for the peer's sentinel.
    pub cmi_timeout: Duration,
    /// CSHP's shared client/server timeout waiting for the next message.
    pub cshp_timeout: Duration,
    /// `T_HELLO_INIT`: initial `wait_for_ready` budget.
    pub hello_init: Duration,
    /// `T_HELLO_INC`: grant per prolongation.
    pub hello_increment: Duration,
    /// `T_PROLONG_THR_INC`: peer-reported waiting threshold above which we
    /// schedule our own prolongation request.
    pub prolong_threshold: Duration,
    /// `T_PROLONG_GAP`: send our request this much before the peer's
    /// declared deadline.
    pub prolong_gap: Duration,
    /// `T_PROLONG_MIN`: floor below which we don't bother scheduling.
    pub prolong_min: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            cmi_timeout: Duration::from_secs(10),
            cshp_timeout: Duration::from_secs(10),
            hello_init: Duration::from_secs(120),
            hello_increment: Duration::from_secs(120),
            prolong_threshold: Duration::from_secs(30),
            prolong_gap: Duration::from_secs(15),
            prolong_min: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_spec_constants() {
        let cfg = HandshakeConfig::default();
        assert_eq!(cfg.hello_init, Duration::from_secs(120));
        assert_eq!(cfg.hello_increment, Duration::from_secs(120));
        assert_eq!(cfg.prolong_threshold, Duration::from_secs(30));
        assert_eq!(cfg.prolong_gap, Duration::from_secs(15));
        assert_eq!(cfg.prolong_min, Duration::from_secs(1));
        assert_eq!(cfg.cmi_timeout, Duration::from_secs(10));
        assert_eq!(cfg.cshp_timeout, Duration::from_secs(10));
    }
}
