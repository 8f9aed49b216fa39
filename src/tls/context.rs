use std::collections::HashSet;
use std::sync::Arc;

use openssl::hash::MessageDigest;
use openssl::ssl::{NameType, SslContext, SslContextBuilder, SslMethod, SslVerifyMode};
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::X509;

use crate::config::VerifyType;
use crate::error::HandshakeError;
use crate::session::SessionCore;
use crate::tls::verify::VerifyContext;
use crate::types::Side;

/// Build the `SslContext` for one side of one handshake.
///
/// The context is per-handshake: the verify callback trampolines into the
/// handshake's own [`VerifyContext`], and the trust store carries the local
/// chain appended on top of the configured anchors.
pub(crate) fn build_context(
    core: &Arc<SessionCore>,
    side: Side,
    verify: &Arc<VerifyContext>,
    local_chain: Option<&[X509]>,
) -> Result<SslContext, HandshakeError> {
    let method = match side {
        // we accept TLS from the client and connect it towards the server
        Side::Client => SslMethod::tls_server(),
        Side::Server => SslMethod::tls_client(),
    };
    let mut builder = SslContextBuilder::new(method)?;

    let mut store = X509StoreBuilder::new()?;
    let mut seen: HashSet<Vec<u8>> = HashSet::new();
    for anchor in core.config.trust_anchors[side].iter() {
        add_cert_once(&mut store, &mut seen, anchor)?;
    }
    if let Some(chain) = local_chain {
        for cert in chain {
            add_cert_once(&mut store, &mut seen, cert)?;
        }
    }
    builder.set_cert_store(store.build());

    // intermediates are presented on the wire in chain order
    if let Some(chain) = local_chain {
        for cert in chain.iter().skip(1) {
            builder.add_extra_chain_cert(cert.clone())?;
        }
    }

    let mode = verify_mode(side, core.config.verify_type[side]);
    let hook = verify.clone();
    builder.set_verify_callback(mode, move |preverify_ok, ctx| {
        hook.library_hook(preverify_ok, ctx)
    });

    if side == Side::Client {
        install_servername_recorder(&mut builder, core.clone());
    }

    Ok(builder.build())
}

/// Minimal accept context for the SNI peek: it only has to parse a
/// ClientHello far enough to fire the servername callback.
pub(crate) fn build_sni_peek_context(
    core: &Arc<SessionCore>,
) -> Result<SslContext, HandshakeError> {
    let mut builder = SslContextBuilder::new(SslMethod::tls_server())?;
    install_servername_recorder(&mut builder, core.clone());
    Ok(builder.build())
}

fn install_servername_recorder(builder: &mut SslContextBuilder, core: Arc<SessionCore>) {
    builder.set_servername_callback(move |ssl, _alert| {
        if let Some(name) = ssl.servername(NameType::HOST_NAME) {
            core.record_server_name(name);
        }
        Ok(())
    });
}

/// Add a certificate to the store being built, once.
///
/// Repeated intermediates are skipped by digest; a duplicate that still
/// reaches the library is a no-op (capturing the error stack drains the
/// library's error queue, so nothing leaks into later calls).
fn add_cert_once(
    store: &mut X509StoreBuilder,
    seen: &mut HashSet<Vec<u8>>,
    cert: &X509,
) -> Result<(), HandshakeError> {
    let digest = cert.digest(MessageDigest::sha256())?;
    if !seen.insert(digest.as_ref().to_vec()) {
        return Ok(());
    }
    if let Err(stack) = store.add_cert(cert.clone()) {
        let duplicate = stack
            .errors()
            .iter()
            .all(|e| e.reason() == Some("cert already in hash table"));
        if !duplicate {
            tracing::error!(
                "Failed to add the complete certificate chain to the SSL session; error='{}'",
                stack
            );
            return Err(stack.into());
        }
    }
    Ok(())
}

fn verify_mode(side: Side, verify_type: VerifyType) -> SslVerifyMode {
    match side {
        Side::Client => match verify_type {
            VerifyType::None => SslVerifyMode::NONE,
            _ if verify_type.requires_peer_cert() => {
                SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT
            }
            _ => SslVerifyMode::PEER,
        },
        Side::Server => match verify_type {
            VerifyType::None => SslVerifyMode::NONE,
            _ => SslVerifyMode::PEER,
        },
    }
}
