use openssl::ssl::{ErrorCode, Ssl, SslRef, SslStream};
use openssl::x509::X509;

use crate::tls::bio::MemoryBio;
use crate::tls::name_oneline;
use crate::types::Side;

/// Outcome of a single accept/connect step against the TLS state machine.
#[derive(Debug)]
pub(crate) enum StepResult {
    /// the handshake completed
    Done,
    /// the library needs more records from the peer
    WantRead,
    /// the library produced records that must reach the peer first
    WantWrite,
    /// the transport closed without a TLS shutdown
    Eof,
    /// errno surfaced from the transport
    Sys(std::io::Error),
    /// the library reported a protocol error
    Tls { code: i32, text: String },
}

/// An active TLS session over an in-memory BIO pair.
///
/// The session never touches the transport itself: the handshake driver (and
/// later the record pump) feeds incoming bytes and drains outgoing bytes
/// around every step.
pub struct TlsSession {
    stream: SslStream<MemoryBio>,
}

impl TlsSession {
    pub(crate) fn new(ssl: Ssl) -> Result<Self, openssl::error::ErrorStack> {
        Ok(Self {
            stream: SslStream::new(ssl, MemoryBio::new())?,
        })
    }

    pub(crate) fn ssl(&self) -> &SslRef {
        self.stream.ssl()
    }

    /// Drive one step of the handshake in the role this side plays:
    /// accept on the client-facing endpoint, connect on the server-facing one.
    pub(crate) fn handshake_step(&mut self, side: Side) -> StepResult {
        let result = match side {
            Side::Client => self.stream.accept(),
            Side::Server => self.stream.connect(),
        };
        match result {
            Ok(()) => StepResult::Done,
            Err(err) => classify(err),
        }
    }

    /// Queue raw bytes received from the peer.
    pub(crate) fn feed_incoming(&mut self, bytes: &[u8]) {
        self.stream.get_mut().feed(bytes);
    }

    /// Take the records the library wants on the wire.
    pub(crate) fn drain_outgoing(&mut self) -> Vec<u8> {
        self.stream.get_mut().take_outgoing()
    }

    /// Encrypt application bytes into outgoing records.
    pub(crate) fn write_app(&mut self, data: &[u8]) -> Result<(), crate::error::HandshakeError> {
        use std::io::Write;
        self.stream.write_all(data).map_err(Into::into)
    }

    /// Decrypt buffered records into application bytes.
    ///
    /// `Ok(None)` means more records are needed, `Ok(Some(0))` is a clean
    /// TLS shutdown from the peer.
    pub(crate) fn read_app(
        &mut self,
        buf: &mut [u8],
    ) -> Result<Option<usize>, crate::error::HandshakeError> {
        match self.stream.ssl_read(buf) {
            Ok(count) => Ok(Some(count)),
            Err(err) => match classify(err) {
                StepResult::WantRead | StepResult::WantWrite => Ok(None),
                StepResult::Eof => Ok(Some(0)),
                StepResult::Tls { code, text } => {
                    if code == ErrorCode::ZERO_RETURN.as_raw() {
                        Ok(Some(0))
                    } else {
                        Err(crate::error::HandshakeError::TlsProtocol { code, text })
                    }
                }
                StepResult::Sys(io) => Err(io.into()),
                StepResult::Done => Ok(None),
            },
        }
    }

    /// Negotiated protocol version.
    pub fn version(&self) -> &str {
        self.ssl().version_str()
    }

    /// Negotiated cipher suite name.
    pub fn cipher(&self) -> Option<&str> {
        self.ssl().current_cipher().map(|c| c.name())
    }

    /// Negotiated compression method. TLS compression is disabled in modern
    /// builds, so this is always absent.
    pub fn compression(&self) -> Option<&str> {
        None
    }

    /// TLS session id as uppercase hex, `"0"` when the peer assigned none.
    pub fn session_id_hex(&self) -> String {
        let id = self.ssl().session().map(|s| s.id().to_vec()).unwrap_or_default();
        if id.is_empty() {
            return "0".to_owned();
        }
        let mut out = String::with_capacity(id.len() * 2);
        for byte in id {
            out.push_str(&format!("{byte:02X}"));
        }
        out
    }

    /// The leaf certificate presented by the peer, if any.
    pub fn peer_certificate(&self) -> Option<X509> {
        self.ssl().peer_certificate()
    }

    /// Log the identity of the peer certificate at debug level.
    pub(crate) fn log_peer_identity(&self, side: Side) {
        if let Some(cert) = self.peer_certificate() {
            let serial = cert
                .serial_number()
                .to_bn()
                .and_then(|bn| bn.to_hex_str().map(|s| s.to_string()))
                .unwrap_or_else(|_| "?".to_owned());
            tracing::debug!(
                "Identified peer; side='{}', peer='{}', issuer='{}', serial='{}', version='{}'",
                side,
                name_oneline(cert.subject_name()),
                name_oneline(cert.issuer_name()),
                serial,
                cert.version() + 1,
            );
        }
    }
}

fn classify(err: openssl::ssl::Error) -> StepResult {
    match err.code() {
        ErrorCode::WANT_READ => StepResult::WantRead,
        ErrorCode::WANT_WRITE => StepResult::WantWrite,
        ErrorCode::SYSCALL => match err.io_error() {
            // errno 0 means the peer closed the transport without a TLS
            // shutdown
            None => StepResult::Eof,
            Some(io) => StepResult::Sys(std::io::Error::new(io.kind(), io.to_string())),
        },
        ErrorCode::ZERO_RETURN => StepResult::Tls {
            code: ErrorCode::ZERO_RETURN.as_raw(),
            text: "TLS connection closed during handshake".to_owned(),
        },
        code => StepResult::Tls {
            code: code.as_raw(),
            text: err
                .ssl_error()
                .map(|stack| stack.to_string())
                .unwrap_or_else(|| format!("TLS error code {}", code.as_raw())),
        },
    }
}
