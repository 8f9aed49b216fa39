use openssl::pkey::{PKey, Private};
use openssl::x509::X509;

use crate::tls::session::TlsSession;

/// Per-side TLS state of a proxied session.
///
/// A present `session` means a handshake completed without fatal error on
/// this side; `handshake_pending` and `session` are mutually exclusive.
/// `certificate_trusted` is meaningful only after the verify pipeline ran.
#[derive(Default)]
pub struct TlsEndpointState {
    pub(crate) session: Option<TlsSession>,
    pub(crate) peer_cert: Option<X509>,
    pub(crate) local_cert_chain: Option<Vec<X509>>,
    pub(crate) local_privkey: Option<PKey<Private>>,
    pub(crate) local_privkey_passphrase: String,
    pub(crate) certificate_trusted: bool,
    pub(crate) handshake_pending: bool,
    pub(crate) server_peer_ca_list: Vec<String>,
}

impl TlsEndpointState {
    /// Store a completed session. Idempotent with respect to call order:
    /// any previously stored session is dropped first.
    pub(crate) fn store_session(&mut self, session: TlsSession) {
        debug_assert!(!self.handshake_pending);
        self.session = Some(session);
    }

    /// Drop the stored session, if any. Returns whether one was present.
    pub(crate) fn clear(&mut self) -> bool {
        self.session.take().is_some()
    }
}
