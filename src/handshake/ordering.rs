use crate::config::{EncryptionConfig, Security};
use crate::types::Side;

/// Whether a requested handshake must wait until the peer side completes.
///
/// A handshake is deferred iff our turn is second in the configured order,
/// the request is not forced, TLS is enabled on the other side, we are not
/// in the forced-here-but-negotiated-there case (a forced handshake cannot
/// synchronize with one that depends on the peer requesting TLS), and the
/// other side has not already completed its handshake.
pub(crate) fn should_defer(
    side: Side,
    forced: bool,
    cfg: &EncryptionConfig,
    other_side_completed: bool,
) -> bool {
    cfg.handshake_seq.first() != side
        && !forced
        && cfg.security[side.other()].tls_enabled()
        && !(cfg.security[side] == Security::ForceTls
            && cfg.security[side.other()] != Security::ForceTls)
        && !other_side_completed
}
