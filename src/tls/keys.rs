use std::sync::Arc;

use openssl::pkey::{PKey, Private};
use openssl::ssl::SslRef;
use openssl::x509::X509;

use crate::error::HandshakeError;
use crate::policy::{CallbackArgs, Verdict};
use crate::session::SessionCore;
use crate::types::Side;

/// Credentials the proxy will present on one side: `chain[0]` is the leaf,
/// the rest are its signers in wire order.
pub(crate) struct LocalCredentials {
    pub(crate) chain: Vec<X509>,
    pub(crate) key: PKey<Private>,
}

/// Run the `setup_key` policy callback and snapshot the credentials it left
/// in the endpoint state, typically minted on the fly for keybridging.
///
/// The callback sees the *other* side's peer certificate and the SNI name,
/// and must return `Accept`. Missing credentials afterwards are fatal on the
/// client side, where the proxy is the TLS server and must present a
/// certificate; on the server side the handshake simply proceeds without a
/// client certificate.
pub(crate) fn load_local_credentials(
    core: &Arc<SessionCore>,
    side: Side,
) -> Result<Option<LocalCredentials>, HandshakeError> {
    let peer_cert = core.peer_cert(side.other());
    let server_name = core.server_name();

    let verdict = core.policy.invoke(
        side,
        "setup_key",
        CallbackArgs::SetupKey {
            side,
            peer_cert: peer_cert.as_deref(),
            server_name: &server_name,
            handler: core.handle,
        },
        core.as_ref(),
    );

    match verdict {
        Ok(Verdict::Accept) => {}
        Ok(_) => {
            tracing::error!(
                "Error fetching local key/certificate pair; side='{}'",
                side
            );
            return Err(HandshakeError::PolicyReject);
        }
        Err(_) => {
            tracing::error!(
                "Error fetching local key/certificate pair; side='{}'",
                side
            );
            return Err(HandshakeError::PolicyInvalid);
        }
    }

    let chain = core.local_cert_chain(side);
    let key = core.local_privkey(side);

    match (chain, key) {
        (Some(chain), Some(key)) if !chain.is_empty() => {
            Ok(Some(LocalCredentials { chain, key }))
        }
        _ if side == Side::Client => {
            tracing::error!(
                "No local key is set for the client side, either missing keys \
                 or misconfigured keybridge"
            );
            Err(HandshakeError::LocalKeyMissing(side))
        }
        _ => {
            tracing::warn!(
                "No local key is set for the server side, continuing without a client certificate"
            );
            Ok(None)
        }
    }
}

/// Install the leaf certificate and private key on the session.
pub(crate) fn install_credentials(
    ssl: &mut SslRef,
    credentials: &LocalCredentials,
) -> Result<(), HandshakeError> {
    if let Err(stack) = ssl.set_certificate(&credentials.chain[0]) {
        tracing::error!("Unable to set certificate to use in the SSL session;");
        return Err(stack.into());
    }
    if let Err(stack) = ssl.set_private_key(&credentials.key) {
        tracing::error!("Unable to set private key to use in the SSL session;");
        return Err(stack.into());
    }
    Ok(())
}
