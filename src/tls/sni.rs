use std::sync::Arc;

use openssl::ssl::{Ssl, SslStream};

use crate::common::phys::PhysLayer;
use crate::session::SessionCore;
use crate::tls::bio::MemoryBio;
use crate::tls::context::build_sni_peek_context;

/// A single ClientHello fits comfortably in this window.
pub(crate) const SNI_PEEK_BYTES: usize = 1024;

/// Learn the SNI hostname from the client's first ClientHello without
/// consuming it.
///
/// Reads up to 1 KiB from the stream, feeds it to a throwaway accept-mode
/// session over memory BIOs so the library parses the ClientHello and fires
/// the servername callback, then unreads the bytes so the real handshake
/// sees an untouched ClientHello. Best-effort: failures are logged and the
/// hostname stays unset.
pub(crate) async fn peek_sni_from_client(core: &Arc<SessionCore>, stream: &mut PhysLayer) {
    core.record_server_name("");

    let mut buf = vec![0u8; SNI_PEEK_BYTES];
    let bytes_read = match stream.read(&mut buf).await {
        Ok(0) | Err(_) => {
            tracing::error!("Error reading from ssl stream during SNI peek");
            return;
        }
        Ok(n) => n,
    };

    if let Err(err) = throwaway_accept(core, &buf[..bytes_read]) {
        tracing::error!("Error examining ClientHello; error='{}'", err);
    }

    stream.unread(&buf[..bytes_read]);
}

fn throwaway_accept(
    core: &Arc<SessionCore>,
    bytes: &[u8],
) -> Result<(), crate::error::HandshakeError> {
    let ctx = build_sni_peek_context(core)?;
    let ssl = Ssl::new(&ctx)?;
    let mut session = SslStream::new(ssl, MemoryBio::new())?;
    session.get_mut().feed(bytes);
    // one step is enough to parse the ClientHello and fire the servername
    // callback; the session is discarded regardless of the outcome
    let _ = session.accept();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::phys::PhysLayer;
    use crate::config::EncryptionConfig;
    use crate::decode::{DecodeLevel, PhysDecodeLevel};
    use crate::policy::PolicyBridge;
    use crate::session::ProxySession;

    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn peek_replays_bytes_even_without_a_client_hello() {
        let session = ProxySession::new(
            1,
            EncryptionConfig::default(),
            PolicyBridge::new(),
            DecodeLevel::default(),
        );
        let (local, mut remote) = tokio::io::duplex(4096);
        let mut phys = PhysLayer::new_memory(local, PhysDecodeLevel::Nothing);

        // not a ClientHello: the throwaway accept fails, the hostname stays
        // unset, and the real handshake must still see every byte
        remote.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        peek_sni_from_client(session.core(), &mut phys).await;

        assert_eq!(session.vars().server_name(), "");
        let mut buf = [0u8; 16];
        assert_eq!(phys.read(&mut buf).await.unwrap(), 16);
        assert_eq!(&buf, b"GET / HTTP/1.1\r\n");
    }
}
