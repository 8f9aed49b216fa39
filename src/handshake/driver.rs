use std::sync::Arc;

use openssl::ssl::Ssl;
use tokio::time::Instant;

use crate::common::phys::{PhysLayer, PollCond};
use crate::config::HandshakeSeq;
use crate::error::HandshakeError;
use crate::session::SessionCore;
use crate::tls::context::build_context;
use crate::tls::keys;
use crate::tls::session::{StepResult, TlsSession};
use crate::tls::sni::peek_sni_from_client;
use crate::tls::verify::VerifyContext;
use crate::types::Side;

/// How the driver waits for the handshake to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandshakeMode {
    /// the stream is blocking; a stream-level timeout bounds every operation
    Blocking,
    /// the stream is non-blocking; the driver suspends cooperatively and a
    /// separate timer source bounds the whole handshake
    SemiNonBlocking,
}

/// Final status handed to the completion callback.
pub(crate) struct HandshakeStatus {
    pub(crate) side: Side,
    /// raw TLS error code, `0` on success
    pub(crate) error_code: i32,
    pub(crate) error_text: Option<String>,
}

impl HandshakeStatus {
    pub(crate) fn is_success(&self) -> bool {
        self.error_text.is_none()
    }
}

pub(crate) type CompletionCallback = Box<dyn FnOnce(HandshakeStatus) + Send>;

/// One in-flight TLS handshake on one side of a proxied session.
///
/// Owns the library session being driven; the completion callback fires
/// exactly once across all exit paths (success, library error, timeout) and
/// is cleared before invocation so reentry cannot double-fire.
pub(crate) struct TlsHandshake {
    core: Arc<SessionCore>,
    side: Side,
    session: Option<TlsSession>,
    completion_cb: Option<CompletionCallback>,
    error: Option<HandshakeError>,
    completed: bool,
}

impl TlsHandshake {
    pub(crate) fn new(core: Arc<SessionCore>, side: Side) -> Self {
        Self {
            core,
            side,
            session: None,
            completion_cb: None,
            error: None,
            completed: false,
        }
    }

    pub(crate) fn set_callback(&mut self, cb: CompletionCallback) {
        self.completion_cb = Some(cb);
    }

    pub(crate) fn take_session(&mut self) -> Option<TlsSession> {
        self.session.take()
    }

    pub(crate) fn error(&self) -> Option<&HandshakeError> {
        self.error.as_ref()
    }

    /// Whether the handshake reached a terminal state.
    pub(crate) fn is_completed(&self) -> bool {
        self.completed
    }

    /// Invoke the completion callback at most once.
    fn call_callback(&mut self) {
        // cleared before the call so it can never fire twice
        if let Some(cb) = self.completion_cb.take() {
            let status = HandshakeStatus {
                side: self.side,
                error_code: self.error.as_ref().map(|e| e.tls_code()).unwrap_or(0),
                error_text: self.error.as_ref().map(|e| e.to_string()),
            };
            cb(status);
        }
    }

    /// Set up the session: injection guard, SNI, credentials, contexts.
    async fn setup(&mut self, stream: &mut PhysLayer) -> Result<(), HandshakeError> {
        let side = self.side;
        if self.core.decode.handshake.enabled() {
            tracing::debug!("Performing SSL handshake; side='{}'", side);
        }

        // before committing to TLS, every buffer above the TLS stream must
        // be empty, or bytes sent before the handshake could be read in a
        // context believed to be TLS-protected
        let buffered = stream.buffered_bytes();
        if buffered > 0 {
            tracing::error!(
                "Protocol error: possible clear text injection, \
                 buffers above the SSL stream are not empty; bytes={}",
                buffered
            );
            return Err(HandshakeError::BufferInjection(buffered));
        }

        if side == Side::Client && self.core.config.handshake_seq == HandshakeSeq::ClientFirst {
            peek_sni_from_client(&self.core, stream).await;
        }

        let credentials = keys::load_local_credentials(&self.core, side)?;

        let verify = Arc::new(VerifyContext::new(self.core.clone(), side));
        let ctx = build_context(
            &self.core,
            side,
            &verify,
            credentials.as_ref().map(|c| c.chain.as_slice()),
        )?;

        let mut ssl = Ssl::new(&ctx).map_err(|err| {
            tracing::error!("Error allocating SSL struct; side='{}'", side);
            HandshakeError::from(err)
        })?;

        if side == Side::Server {
            let name = self.core.server_name();
            if !name.is_empty() {
                ssl.set_hostname(&name)?;
            }
        }

        if let Some(credentials) = &credentials {
            keys::install_credentials(&mut ssl, credentials)?;
        }

        self.session = Some(TlsSession::new(ssl)?);
        Ok(())
    }

    /// Repeatedly step the TLS state machine, translating `WantRead` and
    /// `WantWrite` into poll conditions and moving records between the
    /// session's BIOs and the stream.
    async fn drive(
        &mut self,
        stream: &mut PhysLayer,
        deadline: Option<Instant>,
    ) -> Result<(), HandshakeError> {
        let side = self.side;
        let mut buf = vec![0u8; 16 * 1024];

        loop {
            let session = self.session.as_mut().expect("setup ran");
            let step = session.handshake_step(side);
            let outgoing = session.drain_outgoing();
            stream.write_all(&outgoing).await?;

            match step {
                StepResult::Done => {
                    let session = self.session.as_ref().expect("setup ran");
                    self.core.set_peer_cert(side, session.peer_certificate());
                    if self.core.decode.handshake.peer_identity_enabled() {
                        session.log_peer_identity(side);
                    }
                    return Ok(());
                }
                StepResult::WantRead => {
                    stream.set_cond(PollCond::In, true);
                    stream.set_cond(PollCond::Out, false);

                    let count = match self.read_suspended(stream, deadline, &mut buf).await? {
                        Some(count) => count,
                        // EAGAIN / EINTR: stay suspended on the prior condition
                        None => continue,
                    };

                    if count == 0 {
                        tracing::error!(
                            "SSL handshake failed, EOF received; side='{}'",
                            side
                        );
                        return Err(HandshakeError::System(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "EOF received during handshake",
                        )));
                    }

                    self.session
                        .as_mut()
                        .expect("setup ran")
                        .feed_incoming(&buf[..count]);
                }
                StepResult::WantWrite => {
                    stream.set_cond(PollCond::In, false);
                    stream.set_cond(PollCond::Out, true);
                    // records were already flushed above; step again
                }
                StepResult::Sys(err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
                    ) =>
                {
                    // suspend on the prior condition
                }
                StepResult::Sys(err) => {
                    tracing::error!(
                        "SSL handshake failed; side='{}', error='{}'",
                        side,
                        err
                    );
                    return Err(HandshakeError::System(err));
                }
                StepResult::Eof => {
                    tracing::error!("SSL handshake failed, EOF received; side='{}'", side);
                    return Err(HandshakeError::System(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "EOF received during handshake",
                    )));
                }
                StepResult::Tls { code, text } => {
                    tracing::error!(
                        "SSL handshake failed; side='{}', error='{}'",
                        side,
                        text
                    );
                    return Err(HandshakeError::TlsProtocol { code, text });
                }
            }
        }
    }

    /// One suspended read. `Ok(None)` means a retryable interruption.
    async fn read_suspended(
        &mut self,
        stream: &mut PhysLayer,
        deadline: Option<Instant>,
        buf: &mut [u8],
    ) -> Result<Option<usize>, HandshakeError> {
        let result = match deadline {
            Some(deadline) => {
                tokio::select! {
                    result = stream.read(buf) => result,
                    _ = tokio::time::sleep_until(deadline) => {
                        return Err(self.timeout())
                    }
                }
            }
            None => stream.read(buf).await,
        };

        match result {
            Ok(count) => Ok(Some(count)),
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => Ok(None),
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => Err(self.timeout()),
            Err(err) => Err(HandshakeError::System(err)),
        }
    }

    fn timeout(&self) -> HandshakeError {
        tracing::error!("SSL handshake timed out; side='{}'", self.side);
        HandshakeError::Timeout
    }

    /// Perform the handshake to completion in the given mode.
    ///
    /// Saves the stream context before reconfiguring the stream and restores
    /// it on every exit path. The completion callback fires exactly once at
    /// the end, whatever the outcome.
    pub(crate) async fn perform(
        &mut self,
        stream: &mut PhysLayer,
        mode: HandshakeMode,
    ) -> Result<(), HandshakeError> {
        let result = self.perform_inner(stream, mode).await;

        if let Err(err) = &result {
            self.error = Some(clone_error(err));
        }
        self.completed = true;
        self.call_callback();
        result
    }

    async fn perform_inner(
        &mut self,
        stream: &mut PhysLayer,
        mode: HandshakeMode,
    ) -> Result<(), HandshakeError> {
        self.setup(stream).await?;

        let timeout = self.core.config.handshake_timeout;
        let result = match mode {
            HandshakeMode::Blocking => {
                // the stream-level timeout bounds each operation; the state
                // machine completes "synchronously" from the caller's view
                let saved = stream.save_context();
                stream.set_timeout(Some(timeout));
                let result = self.drive(stream, None).await;
                stream.restore_context(saved);
                result
            }
            HandshakeMode::SemiNonBlocking => {
                let saved = stream.save_context();
                stream.set_nonblock(true);
                stream.set_cond(PollCond::In, self.side == Side::Client);
                stream.set_cond(PollCond::Out, self.side == Side::Server);
                let deadline = Instant::now() + timeout;
                let result = self.drive(stream, Some(deadline)).await;
                stream.restore_context(saved);
                result
            }
        };
        result?;

        // second injection check: a bug anywhere in the handshake path could
        // still have left plain bytes above the TLS layer
        let buffered = stream.buffered_bytes();
        if buffered > 0 {
            tracing::error!(
                "Internal error, buffers above the SSL stream are not empty \
                 after handshake; bytes={}",
                buffered
            );
            return Err(HandshakeError::BufferInjection(buffered));
        }

        if self.side == Side::Server {
            self.capture_advertised_ca_names();
        }

        self.log_handshake_done();
        Ok(())
    }

    fn log_handshake_done(&self) {
        let session = match &self.session {
            Some(session) => session,
            None => return,
        };
        tracing::info!(
            "SSL handshake done; side='{}', version='{}', cipher='{}', compression='{}', tls_session_id='{}'",
            self.side,
            session.version(),
            session.cipher().unwrap_or("(NONE)"),
            session.compression().unwrap_or("(NONE)"),
            session.session_id_hex(),
        );
    }

    /// Record the DNs the upstream's credential chain asserts as issuers;
    /// policy uses them to pick a client certificate.
    fn capture_advertised_ca_names(&self) {
        let session = match &self.session {
            Some(session) => session,
            None => return,
        };
        let mut names = Vec::new();
        if let Some(chain) = session.ssl().peer_cert_chain() {
            for cert in chain.iter() {
                let issuer = crate::tls::name_oneline(cert.issuer_name());
                if !names.contains(&issuer) {
                    names.push(issuer);
                }
            }
        }
        self.core.set_server_peer_ca_list(names);
    }
}

// HandshakeError carries io errors, which do not implement Clone; the
// completion callback and the return path both need the final status.
fn clone_error(err: &HandshakeError) -> HandshakeError {
    match err {
        HandshakeError::TlsProtocol { code, text } => HandshakeError::TlsProtocol {
            code: *code,
            text: text.clone(),
        },
        HandshakeError::Timeout => HandshakeError::Timeout,
        HandshakeError::BufferInjection(bytes) => HandshakeError::BufferInjection(*bytes),
        HandshakeError::PolicyInvalid => HandshakeError::PolicyInvalid,
        HandshakeError::PolicyReject => HandshakeError::PolicyReject,
        HandshakeError::LocalKeyMissing(side) => HandshakeError::LocalKeyMissing(*side),
        HandshakeError::System(io) => {
            HandshakeError::System(std::io::Error::new(io.kind(), io.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::common::phys::PhysLayer;
    use crate::config::{EncryptionConfig, Security};
    use crate::decode::DecodeLevel;
    use crate::policy::PolicyBridge;
    use crate::session::ProxySession;
    use crate::types::PerSide;

    fn client_only_session() -> (ProxySession, PhysLayer, tokio::io::DuplexStream) {
        // server-first order so setup does not wait on a ClientHello peek
        let config = EncryptionConfig {
            security: PerSide::new(Security::ForceTls, Security::None),
            handshake_seq: HandshakeSeq::ServerFirst,
            ..EncryptionConfig::default()
        };
        let session = ProxySession::new(7, config, PolicyBridge::new(), DecodeLevel::default());
        let (local, remote) = tokio::io::duplex(16 * 1024);
        let phys = PhysLayer::new_memory(local, crate::decode::PhysDecodeLevel::Nothing);
        (session, phys, remote)
    }

    #[tokio::test]
    async fn completion_callback_fires_once_on_setup_failure() {
        // no local credentials are configured, so client-side setup fails
        let (session, mut phys, _remote) = client_only_session();
        let mut handshake = TlsHandshake::new(session.core().clone(), Side::Client);

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        handshake.set_callback(Box::new(move |status| {
            assert!(!status.is_success());
            assert_eq!(status.side, Side::Client);
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        let result = handshake.perform(&mut phys, HandshakeMode::SemiNonBlocking).await;
        assert!(matches!(result, Err(HandshakeError::LocalKeyMissing(Side::Client))));
        assert!(handshake.is_completed());
        assert!(matches!(
            handshake.error(),
            Some(HandshakeError::LocalKeyMissing(Side::Client))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // reentry cannot double-fire: the callback slot is already cleared
        handshake.call_callback();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn buffered_bytes_abort_before_any_setup() {
        let (session, mut phys, _remote) = client_only_session();
        phys.add_buffered(3);

        let mut handshake = TlsHandshake::new(session.core().clone(), Side::Client);
        let result = handshake.perform(&mut phys, HandshakeMode::SemiNonBlocking).await;
        assert!(matches!(result, Err(HandshakeError::BufferInjection(3))));
        assert!(handshake.take_session().is_none());
    }

    #[tokio::test]
    async fn stream_context_is_restored_after_failure() {
        let (session, mut phys, _remote) = client_only_session();
        let saved = phys.save_context();

        let mut handshake = TlsHandshake::new(session.core().clone(), Side::Client);
        let _ = handshake.perform(&mut phys, HandshakeMode::SemiNonBlocking).await;
        assert_eq!(phys.save_context(), saved);
    }
}
