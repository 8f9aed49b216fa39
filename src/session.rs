use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use tracing::Instrument;

use crate::common::phys::PhysLayer;
use crate::config::{EncryptionConfig, HandshakeSeq, Security};
use crate::decode::DecodeLevel;
use crate::endpoint::TlsEndpointState;
use crate::error::HandshakeError;
use crate::handshake::driver::{HandshakeMode, TlsHandshake};
use crate::handshake::ordering;
use crate::hostname::HostNameVerifier;
use crate::policy::{PolicyBridge, PolicyReport, SessionHandle};
use crate::tls::session::TlsSession;
use crate::tls::sni::peek_sni_from_client;
use crate::types::{PerSide, Side};

/// Opens the upstream connection on demand.
///
/// Proxies that normally connect upstream only after parsing the client
/// request (e.g. HTTP CONNECT) install one of these so a server-first
/// handshake order can force the connection open early.
#[async_trait]
pub trait ServerConnector: Send {
    async fn connect(&mut self) -> Result<PhysLayer, std::io::Error>;
}

struct TlsState {
    endpoints: PerSide<TlsEndpointState>,
    server_name: String,
    force_connect_at_handshake: bool,
    host_iface: Option<HostNameVerifier>,
}

impl Default for TlsState {
    fn default() -> Self {
        Self {
            endpoints: PerSide::new(TlsEndpointState::default(), TlsEndpointState::default()),
            server_name: String::new(),
            force_connect_at_handshake: false,
            host_iface: None,
        }
    }
}

/// Shared core of a proxied session: configuration, the policy bridge, and
/// the per-side TLS state. Verify and servername callbacks hold a reference
/// to it for the lifetime of their handshake.
pub(crate) struct SessionCore {
    pub(crate) handle: SessionHandle,
    pub(crate) config: Arc<EncryptionConfig>,
    pub(crate) policy: PolicyBridge,
    pub(crate) decode: DecodeLevel,
    state: Mutex<TlsState>,
    invalid_policy: AtomicBool,
    policy_abort: AtomicBool,
}

impl SessionCore {
    fn new(
        handle: SessionHandle,
        config: Arc<EncryptionConfig>,
        policy: PolicyBridge,
        decode: DecodeLevel,
    ) -> Self {
        Self {
            handle,
            config,
            policy,
            decode,
            state: Mutex::new(TlsState::default()),
            invalid_policy: AtomicBool::new(false),
            policy_abort: AtomicBool::new(false),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, TlsState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn set_peer_cert(&self, side: Side, cert: Option<X509>) {
        self.state().endpoints[side].peer_cert = cert;
    }

    pub(crate) fn peer_cert(&self, side: Side) -> Option<X509> {
        self.state().endpoints[side].peer_cert.clone()
    }

    pub(crate) fn set_certificate_trusted(&self, side: Side, trusted: bool) {
        self.state().endpoints[side].certificate_trusted = trusted;
    }

    pub(crate) fn certificate_trusted(&self, side: Side) -> bool {
        self.state().endpoints[side].certificate_trusted
    }

    pub(crate) fn record_server_name(&self, name: &str) {
        let mut state = self.state();
        state.server_name.clear();
        state.server_name.push_str(name);
    }

    pub(crate) fn server_name(&self) -> String {
        self.state().server_name.clone()
    }

    pub(crate) fn local_cert_chain(&self, side: Side) -> Option<Vec<X509>> {
        self.state().endpoints[side].local_cert_chain.clone()
    }

    pub(crate) fn local_privkey(&self, side: Side) -> Option<PKey<Private>> {
        self.state().endpoints[side].local_privkey.clone()
    }

    pub(crate) fn set_server_peer_ca_list(&self, names: Vec<String>) {
        self.state().endpoints[Side::Server].server_peer_ca_list = names;
    }

    pub(crate) fn session_established(&self, side: Side) -> bool {
        self.state().endpoints[side].session.is_some()
    }

    pub(crate) fn handshake_pending(&self, side: Side) -> bool {
        self.state().endpoints[side].handshake_pending
    }

    pub(crate) fn set_handshake_pending(&self, side: Side, pending: bool) {
        let mut state = self.state();
        debug_assert!(!pending || state.endpoints[side].session.is_none());
        state.endpoints[side].handshake_pending = pending;
    }

    /// Store a completed session, dropping any previous one first so the
    /// outcome is independent of call order.
    fn store_session(&self, side: Side, session: TlsSession) {
        let mut state = self.state();
        state.endpoints[side].store_session(session);
    }

    /// Drop the session on one side. Clearing the server side also removes
    /// the host-name verification interface.
    fn clear_session(&self, side: Side) {
        let mut state = self.state();
        if state.endpoints[side].clear() && side == Side::Server {
            state.host_iface = None;
        }
    }

    /// Register the host-name verification interface when the policy wants
    /// the server certificate's subject checked against the hostname.
    fn register_host_iface(&self) {
        let config = &self.config;
        if !config.security[Side::Server].tls_enabled()
            || !config.server_check_subject
            || !config.verify_type[Side::Server].requires_trusted()
        {
            return;
        }
        let mut state = self.state();
        if state.endpoints[Side::Server].session.is_none() {
            return;
        }
        if let Some(cert) = state.endpoints[Side::Server].peer_cert.clone() {
            state.host_iface = Some(HostNameVerifier::new(cert));
        }
    }
}

impl PolicyReport for SessionCore {
    fn report_invalid_policy(&self) {
        self.invalid_policy.store(true, Ordering::SeqCst);
    }

    fn report_policy_abort(&self) {
        self.policy_abort.store(true, Ordering::SeqCst);
    }
}

/// Policy-visible view of the session's TLS state.
///
/// Callbacks hold a clone and read or write through it: `setup_key`
/// installs minted credentials here, `verify_cert` reads peer facts.
#[derive(Clone)]
pub struct TlsVars {
    core: Arc<SessionCore>,
}

impl TlsVars {
    /// The leaf certificate observed from the peer on one side.
    pub fn peer_certificate(&self, side: Side) -> Option<X509> {
        self.core.peer_cert(side)
    }

    /// Whether the peer chain verified to a trusted root without downgrade.
    pub fn certificate_trusted(&self, side: Side) -> bool {
        self.core.certificate_trusted(side)
    }

    pub fn set_certificate_trusted(&self, side: Side, trusted: bool) {
        self.core.set_certificate_trusted(side, trusted)
    }

    /// The chain the proxy will present on one side; `chain[0]` is the leaf.
    pub fn local_certificate_chain(&self, side: Side) -> Option<Vec<X509>> {
        self.core.local_cert_chain(side)
    }

    pub fn set_local_certificate_chain(&self, side: Side, chain: Option<Vec<X509>>) {
        self.core.state().endpoints[side].local_cert_chain = chain;
    }

    pub fn set_local_private_key(&self, side: Side, key: Option<PKey<Private>>) {
        self.core.state().endpoints[side].local_privkey = key;
    }

    pub fn set_local_privkey_passphrase(&self, side: Side, passphrase: String) {
        self.core.state().endpoints[side].local_privkey_passphrase = passphrase;
    }

    pub fn local_privkey_passphrase(&self, side: Side) -> String {
        self.core.state().endpoints[side].local_privkey_passphrase.clone()
    }

    /// The SNI hostname the client requested, empty if none was seen.
    pub fn server_name(&self) -> String {
        self.core.server_name()
    }

    /// Override the SNI hostname sent on the server-facing handshake.
    ///
    /// Normally the name is recorded from the peeked ClientHello; sessions
    /// that originate their own upstream connections set it directly.
    pub fn set_server_name(&self, name: &str) {
        self.core.record_server_name(name)
    }

    /// Distinguished names advertised as acceptable CAs by the remote side.
    pub fn server_peer_ca_list(&self) -> Vec<String> {
        self.core.state().endpoints[Side::Server].server_peer_ca_list.clone()
    }
}

/// The TLS surface of one proxied connection.
///
/// Owns the two endpoint streams, coordinates handshake ordering between
/// them, and exposes the policy-visible state.
pub struct ProxySession {
    core: Arc<SessionCore>,
    endpoints: PerSide<Option<PhysLayer>>,
    connector: Option<Box<dyn ServerConnector>>,
    nonblocking: bool,
}

impl std::fmt::Debug for ProxySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySession").finish_non_exhaustive()
    }
}

impl ProxySession {
    pub fn new(
        session_id: u64,
        config: EncryptionConfig,
        policy: PolicyBridge,
        decode: DecodeLevel,
    ) -> Self {
        Self {
            core: Arc::new(SessionCore::new(
                SessionHandle(session_id),
                Arc::new(config),
                policy,
                decode,
            )),
            endpoints: PerSide::new(None, None),
            connector: None,
            nonblocking: true,
        }
    }

    /// Policy-visible accessors for this session's TLS state.
    pub fn vars(&self) -> TlsVars {
        TlsVars {
            core: self.core.clone(),
        }
    }

    pub(crate) fn core(&self) -> &Arc<SessionCore> {
        &self.core
    }

    /// Attach the byte stream of one endpoint.
    pub fn set_endpoint(&mut self, side: Side, stream: PhysLayer) {
        self.endpoints[side] = Some(stream);
    }

    pub fn endpoint_mut(&mut self, side: Side) -> Option<&mut PhysLayer> {
        self.endpoints[side].as_mut()
    }

    /// Install the upstream connector used by force-connect.
    pub fn set_connector(&mut self, connector: Box<dyn ServerConnector>) {
        self.connector = Some(connector);
    }

    /// Whether handshakes run semi-non-blocking (the default) or against
    /// deliberately blocking streams.
    pub fn set_nonblocking(&mut self, nonblocking: bool) {
        self.nonblocking = nonblocking;
    }

    /// Request the upstream connection to be force-established when the
    /// client handshake is requested. Only meaningful when the configured
    /// handshake order is server-first; ignored otherwise.
    pub fn set_force_connect_at_handshake(&mut self, value: bool) {
        if self.core.config.handshake_seq == HandshakeSeq::ServerFirst {
            self.core.state().force_connect_at_handshake = value;
        }
    }

    /// Whether a handshake completed and a session is stored on `side`.
    pub fn session_established(&self, side: Side) -> bool {
        self.core.session_established(side)
    }

    /// Whether a requested handshake is waiting for the peer side.
    pub fn handshake_pending(&self, side: Side) -> bool {
        self.core.handshake_pending(side)
    }

    /// The host-name verification interface, present after a qualifying
    /// server-side handshake.
    pub fn hostname_verifier(&self) -> Option<HostNameVerifier> {
        self.core.state().host_iface.clone()
    }

    /// A policy callback was found malformed during this session.
    pub fn invalid_policy_reported(&self) -> bool {
        self.core.invalid_policy.load(Ordering::SeqCst)
    }

    /// A handshake aborted on policy grounds during this session.
    pub fn policy_abort_reported(&self) -> bool {
        self.core.policy_abort.load(Ordering::SeqCst)
    }

    /// Drop the TLS state of one endpoint. Clearing the server side also
    /// unregisters the host-name verification interface.
    pub fn clear_session(&mut self, side: Side) {
        self.core.clear_session(side);
    }

    /// Initial TLS setup of one endpoint stream.
    ///
    /// When TLS is forced on the endpoint a handshake is requested right
    /// away; in server-first order the client's ClientHello is peeked first
    /// so the upstream handshake can present the right SNI.
    pub async fn init_endpoint(&mut self, side: Side) -> Result<(), HandshakeError> {
        if self.core.config.security[side] != Security::ForceTls {
            return Ok(());
        }

        if side == Side::Client && self.core.config.handshake_seq == HandshakeSeq::ServerFirst {
            let core = self.core.clone();
            if let Some(stream) = self.endpoints[Side::Client].as_mut() {
                peek_sni_from_client(&core, stream).await;
            }
        }

        self.request_handshake(side, false).await
    }

    /// Start the client-side handshake and continue through `continuation`.
    ///
    /// In client-first order this is a true continuation-passing startup:
    /// the handshake is driven on the session's task and the continuation
    /// fires on completion. Every other combination falls back to
    /// [`ProxySession::init_endpoint`] followed by the continuation.
    pub fn start_client_handshake_with<F>(mut self, continuation: F) -> tokio::task::JoinHandle<()>
    where
        F: FnOnce(ProxySession, Result<(), HandshakeError>) + Send + 'static,
    {
        tokio::spawn(async move {
            let result = self.start_client_inner().await;
            continuation(self, result);
        })
    }

    async fn start_client_inner(&mut self) -> Result<(), HandshakeError> {
        if !self.core.config.security[Side::Client].tls_enabled() {
            return Ok(());
        }
        if self.core.config.handshake_seq == HandshakeSeq::ClientFirst {
            self.run_handshake(Side::Client).await
        } else {
            self.init_endpoint(Side::Client).await
        }
    }

    /// Request an SSL handshake on one endpoint.
    ///
    /// Depending on the configured handshake order the handshake either runs
    /// now or is registered as pending until the peer side completes; a
    /// forced request always runs now. Completing a handshake triggers the
    /// deferred one on the other side, if any.
    pub async fn request_handshake(
        &mut self,
        side: Side,
        forced: bool,
    ) -> Result<(), HandshakeError> {
        // if already initialized, return right away
        if self.core.session_established(side) {
            return Ok(());
        }

        if side == Side::Client && self.core.state().force_connect_at_handshake {
            tracing::info!(
                "Force-establishing server connection since the configured handshake order requires it;"
            );
            match self.connect_upstream().await {
                Ok(stream) => self.endpoints[Side::Server] = Some(stream),
                Err(err) => {
                    tracing::error!("Server connection failed to establish, giving up;");
                    return Err(err);
                }
            }
        }

        let other_completed = self.core.session_established(side.other());
        if ordering::should_defer(side, forced, &self.core.config, other_completed) {
            tracing::debug!(
                "Delaying SSL handshake after the other endpoint is ready; side='{}'",
                side
            );
            self.core.set_handshake_pending(side, true);
            return Ok(());
        }

        // we are either first in the handshake order or the other endpoint
        // already completed its handshake
        self.run_handshake(side).await?;

        let other = side.other();
        if self.core.handshake_pending(other) {
            tracing::debug!("Starting delayed SSL handshake; side='{}'", other);
            self.core.set_handshake_pending(other, false);
            self.run_handshake(other).await?;
        }

        Ok(())
    }

    async fn connect_upstream(&mut self) -> Result<PhysLayer, HandshakeError> {
        match &mut self.connector {
            Some(connector) => Ok(connector.connect().await?),
            None => Err(HandshakeError::System(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no upstream connector configured",
            ))),
        }
    }

    async fn run_handshake(&mut self, side: Side) -> Result<(), HandshakeError> {
        let core = self.core.clone();
        let stream = self.endpoints[side].as_mut().ok_or_else(|| {
            HandshakeError::System(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "endpoint stream not attached",
            ))
        })?;

        let mode = if self.nonblocking {
            HandshakeMode::SemiNonBlocking
        } else {
            HandshakeMode::Blocking
        };

        let mut handshake = TlsHandshake::new(core.clone(), side);
        let result = handshake
            .perform(stream, mode)
            .instrument(tracing::info_span!(
                "Handshake",
                session = core.handle.0,
                side = %side
            ))
            .await;

        if result.is_ok() {
            if let Some(session) = handshake.take_session() {
                core.store_session(side, session);
                if side == Side::Server {
                    core.register_host_iface();
                }
            }
        }

        result
    }

    /// Exchange application data through the established session on `side`:
    /// encrypt and send `data`, then read the peer's reply.
    ///
    /// This is not the proxy's data path, only enough plumbing for callers
    /// and tests to prove records flow through a stored session.
    pub async fn exchange(
        &mut self,
        side: Side,
        data: &[u8],
        reply: &mut [u8],
    ) -> Result<usize, HandshakeError> {
        // the session is taken out of the shared state for the duration of
        // the exchange so the state lock is never held across an await
        let mut session = self.core.state().endpoints[side].session.take().ok_or_else(|| {
            HandshakeError::System(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no session on this side",
            ))
        })?;

        let result = Self::exchange_inner(
            &mut session,
            self.endpoints[side].as_mut(),
            data,
            reply,
        )
        .await;

        self.core.state().endpoints[side].session = Some(session);
        result
    }

    async fn exchange_inner(
        session: &mut TlsSession,
        stream: Option<&mut PhysLayer>,
        data: &[u8],
        reply: &mut [u8],
    ) -> Result<usize, HandshakeError> {
        let stream = stream.ok_or_else(|| {
            HandshakeError::System(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "endpoint stream not attached",
            ))
        })?;

        session.write_app(data)?;
        let outgoing = session.drain_outgoing();
        stream.write_all(&outgoing).await?;

        let mut buf = vec![0u8; 16 * 1024];
        loop {
            if let Some(count) = session.read_app(reply)? {
                return Ok(count);
            }
            let outgoing = session.drain_outgoing();
            stream.write_all(&outgoing).await?;
            let count = stream.read(&mut buf).await?;
            if count == 0 {
                return Ok(0);
            }
            session.feed_incoming(&buf[..count]);
        }
    }
}
