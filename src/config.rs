use std::time::Duration;

use openssl::x509::X509;

use crate::types::{PerSide, Side};

/// Whether TLS is used on an endpoint, and when.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Security {
    /// plain text, no TLS machinery on this endpoint
    None,
    /// TLS may be negotiated later (STARTTLS-style)
    Accept,
    /// a TLS handshake precedes all protocol communication
    ForceTls,
}

impl Security {
    pub(crate) fn tls_enabled(self) -> bool {
        self > Security::None
    }
}

/// Determines how the certificate chain presented by the peer is validated.
///
/// The *Untrusted* variants allow a configurable set of chain errors to pass
/// with the trusted flag cleared; the *Trusted* variants require a chain that
/// verifies to a configured trust anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyType {
    /// do not verify the peer certificate
    None,
    /// request a certificate, accept untrusted chains
    OptionalUntrusted,
    /// request a certificate, require a trusted chain if one is presented
    OptionalTrusted,
    /// require a certificate, accept untrusted chains
    RequiredUntrusted,
    /// require a certificate with a trusted chain
    RequiredTrusted,
}

impl VerifyType {
    pub(crate) fn accepts_untrusted(self) -> bool {
        matches!(self, Self::OptionalUntrusted | Self::RequiredUntrusted)
    }

    pub(crate) fn requires_trusted(self) -> bool {
        matches!(self, Self::OptionalTrusted | Self::RequiredTrusted)
    }

    pub(crate) fn requires_peer_cert(self) -> bool {
        matches!(self, Self::RequiredUntrusted | Self::RequiredTrusted)
    }
}

/// Which side must complete its TLS handshake first within one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeSeq {
    /// the client-facing handshake runs first
    ClientFirst,
    /// the server-facing handshake runs first
    ServerFirst,
}

impl HandshakeSeq {
    pub(crate) fn first(self) -> Side {
        match self {
            Self::ClientFirst => Side::Client,
            Self::ServerFirst => Side::Server,
        }
    }
}

/// TLS parameters of a proxied session, immutable while the session lives.
///
/// Supplied by the policy layer when the session is set up. Certificate and
/// key *parsing* happens outside this crate; trust anchors arrive as parsed
/// handles.
#[derive(Clone)]
pub struct EncryptionConfig {
    /// whether TLS is used, per side
    pub security: PerSide<Security>,
    /// peer chain validation mode, per side
    pub verify_type: PerSide<VerifyType>,
    /// maximum accepted chain depth, per side
    pub verify_depth: PerSide<u32>,
    /// accept chains whose CRL could not be fetched
    pub permit_missing_crl: PerSide<bool>,
    /// accept any invalid chain with the trusted flag cleared
    pub permit_invalid_certificates: PerSide<bool>,
    /// enable host-name verification against the server peer certificate
    pub server_check_subject: bool,
    /// handshake ordering between the two endpoints
    pub handshake_seq: HandshakeSeq,
    /// per-handshake timeout
    pub handshake_timeout: Duration,
    /// trust anchors used to verify the peer chain, per side
    pub trust_anchors: PerSide<Vec<X509>>,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            security: PerSide::new(Security::None, Security::None),
            verify_type: PerSide::new(VerifyType::RequiredTrusted, VerifyType::RequiredTrusted),
            verify_depth: PerSide::new(4, 4),
            permit_missing_crl: PerSide::new(false, false),
            permit_invalid_certificates: PerSide::new(false, false),
            server_check_subject: false,
            handshake_seq: HandshakeSeq::ClientFirst,
            handshake_timeout: Duration::from_secs(30),
            trust_anchors: PerSide::new(Vec::new(), Vec::new()),
        }
    }
}
