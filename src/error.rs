use crate::types::Side;

/// Errors that terminate a TLS handshake.
///
/// Every variant is fatal for the handshake it occurred in; the owning proxy
/// decides session-level recovery.
#[derive(Debug)]
pub enum HandshakeError {
    /// the TLS library reported a protocol error
    TlsProtocol {
        /// raw error code from the library's error accessor
        code: i32,
        /// human-readable description
        text: String,
    },
    /// the handshake made no progress within the configured timeout
    Timeout,
    /// bytes were buffered above the TLS stream at setup or completion
    BufferInjection(usize),
    /// a configured policy callback was malformed or of an unsupported type
    PolicyInvalid,
    /// the policy rejected the handshake, or accepted a failed chain
    PolicyReject,
    /// no local certificate/key pair was available when one was required
    LocalKeyMissing(Side),
    /// errno surfaced from the underlying stream
    System(std::io::Error),
}

impl HandshakeError {
    /// Raw TLS error code, `0` for everything that is not a library error.
    pub fn tls_code(&self) -> i32 {
        match self {
            HandshakeError::TlsProtocol { code, .. } => *code,
            _ => 0,
        }
    }
}

impl std::fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            HandshakeError::TlsProtocol { code, text } => {
                write!(f, "TLS protocol error {code}: {text}")
            }
            HandshakeError::Timeout => f.write_str("handshake timed out"),
            HandshakeError::BufferInjection(bytes) => write!(
                f,
                "buffers above the SSL stream are not empty; bytes={bytes}"
            ),
            HandshakeError::PolicyInvalid => f.write_str("invalid policy callback configuration"),
            HandshakeError::PolicyReject => f.write_str("rejected by policy"),
            HandshakeError::LocalKeyMissing(side) => {
                write!(f, "no local key/certificate pair for the {side} side")
            }
            HandshakeError::System(err) => write!(f, "stream error: {err}"),
        }
    }
}

impl std::error::Error for HandshakeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HandshakeError::System(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for HandshakeError {
    fn from(err: std::io::Error) -> Self {
        HandshakeError::System(err)
    }
}

impl From<openssl::error::ErrorStack> for HandshakeError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        let code = err.errors().first().map(|e| e.code() as i32).unwrap_or(0);
        HandshakeError::TlsProtocol {
            code,
            text: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_code_is_zero_for_non_library_errors() {
        assert_eq!(HandshakeError::Timeout.tls_code(), 0);
        assert_eq!(HandshakeError::BufferInjection(3).tls_code(), 0);
        assert_eq!(
            HandshakeError::TlsProtocol {
                code: 336151574,
                text: "sslv3 alert certificate unknown".to_owned()
            }
            .tls_code(),
            336151574
        );
    }

    #[test]
    fn display_names_the_side_for_missing_keys() {
        let msg = HandshakeError::LocalKeyMissing(Side::Client).to_string();
        assert!(msg.contains("client"));
    }
}
