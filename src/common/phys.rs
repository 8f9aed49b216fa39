use std::collections::VecDeque;
use std::fmt::Write;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::decode::PhysDecodeLevel;

/// Poll conditions requested on a stream while a handshake is suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollCond {
    /// the stream should be polled for readability
    In,
    /// the stream should be polled for writability
    Out,
}

/// Snapshot of the reconfigurable stream state, taken before a handshake
/// reconfigures the stream and restored on every exit path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamContext {
    /// poll-in requested
    pub want_read: bool,
    /// poll-out requested
    pub want_write: bool,
    /// stream is in non-blocking mode
    pub nonblocking: bool,
    /// per-operation timeout, `None` for unlimited
    pub timeout: Option<Duration>,
}

/// The byte stream of one proxy endpoint.
///
/// Carries an unread queue (bytes pushed back *below* the TLS layer, served
/// before the underlying transport) and an account of bytes buffered *above*
/// the TLS layer by upper protocol parsers, which the handshake setup uses
/// as its clear-text injection guard.
pub struct PhysLayer {
    layer: PhysLayerImpl,
    level: PhysDecodeLevel,
    unread: VecDeque<u8>,
    buffered_above: usize,
    ctx: StreamContext,
}

// encapsulates all possible physical layers as an enum
enum PhysLayerImpl {
    Tcp(tokio::net::TcpStream),
    Memory(tokio::io::DuplexStream),
}

impl std::fmt::Debug for PhysLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.layer {
            PhysLayerImpl::Tcp(_) => f.write_str("Tcp"),
            PhysLayerImpl::Memory(_) => f.write_str("Memory"),
        }
    }
}

impl PhysLayer {
    pub fn new_tcp(socket: tokio::net::TcpStream, level: PhysDecodeLevel) -> Self {
        Self::new(PhysLayerImpl::Tcp(socket), level)
    }

    /// An in-memory physical layer, used for in-process transports and tests.
    pub fn new_memory(stream: tokio::io::DuplexStream, level: PhysDecodeLevel) -> Self {
        Self::new(PhysLayerImpl::Memory(stream), level)
    }

    fn new(layer: PhysLayerImpl, level: PhysDecodeLevel) -> Self {
        Self {
            layer,
            level,
            unread: VecDeque::new(),
            buffered_above: 0,
            ctx: StreamContext::default(),
        }
    }

    /// Push bytes back onto the stream below the TLS layer. The next reads
    /// return these bytes before touching the transport.
    pub fn unread(&mut self, bytes: &[u8]) {
        for byte in bytes.iter().rev() {
            self.unread.push_front(*byte);
        }
    }

    /// Record plain bytes held by an upper protocol layer above the TLS
    /// stream. Non-zero at handshake setup or completion means possible
    /// clear-text injection.
    pub fn add_buffered(&mut self, count: usize) {
        self.buffered_above += count;
    }

    /// Bytes currently buffered above the TLS layer.
    pub fn buffered_bytes(&self) -> usize {
        self.buffered_above
    }

    pub(crate) async fn read(&mut self, buffer: &mut [u8]) -> Result<usize, std::io::Error> {
        if !self.unread.is_empty() {
            let count = buffer.len().min(self.unread.len());
            for slot in buffer.iter_mut().take(count) {
                *slot = self.unread.pop_front().unwrap();
            }
            return Ok(count);
        }

        let length = match self.ctx.timeout {
            Some(limit) => tokio::time::timeout(limit, self.read_inner(buffer))
                .await
                .map_err(|_| {
                    std::io::Error::new(std::io::ErrorKind::TimedOut, "stream read timed out")
                })??,
            None => self.read_inner(buffer).await?,
        };

        if self.level.enabled() {
            if let Some(x) = buffer.get(0..length) {
                tracing::info!("PHYS RX - {}", PhysDisplay::new(self.level, x))
            }
        }

        Ok(length)
    }

    async fn read_inner(&mut self, buffer: &mut [u8]) -> Result<usize, std::io::Error> {
        match &mut self.layer {
            PhysLayerImpl::Tcp(x) => x.read(buffer).await,
            PhysLayerImpl::Memory(x) => x.read(buffer).await,
        }
    }

    pub(crate) async fn write_all(&mut self, data: &[u8]) -> Result<(), std::io::Error> {
        if data.is_empty() {
            return Ok(());
        }

        if self.level.enabled() {
            tracing::info!("PHYS TX - {}", PhysDisplay::new(self.level, data));
        }

        match self.ctx.timeout {
            Some(limit) => tokio::time::timeout(limit, self.write_inner(data))
                .await
                .map_err(|_| {
                    std::io::Error::new(std::io::ErrorKind::TimedOut, "stream write timed out")
                })?,
            None => self.write_inner(data).await,
        }
    }

    async fn write_inner(&mut self, data: &[u8]) -> Result<(), std::io::Error> {
        match &mut self.layer {
            PhysLayerImpl::Tcp(x) => x.write_all(data).await,
            PhysLayerImpl::Memory(x) => x.write_all(data).await,
        }
    }

    /// Snapshot the reconfigurable stream state.
    pub fn save_context(&self) -> StreamContext {
        self.ctx
    }

    /// Restore a previously saved snapshot.
    pub fn restore_context(&mut self, ctx: StreamContext) {
        self.ctx = ctx;
    }

    pub(crate) fn set_cond(&mut self, cond: PollCond, value: bool) {
        match cond {
            PollCond::In => self.ctx.want_read = value,
            PollCond::Out => self.ctx.want_write = value,
        }
    }

    pub(crate) fn cond(&self, cond: PollCond) -> bool {
        match cond {
            PollCond::In => self.ctx.want_read,
            PollCond::Out => self.ctx.want_write,
        }
    }

    pub(crate) fn set_nonblock(&mut self, value: bool) {
        self.ctx.nonblocking = value;
    }

    pub(crate) fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.ctx.timeout = timeout;
    }
}

pub(crate) struct PhysDisplay<'a> {
    level: PhysDecodeLevel,
    data: &'a [u8],
}

impl<'a> PhysDisplay<'a> {
    pub(crate) fn new(level: PhysDecodeLevel, data: &'a [u8]) -> Self {
        PhysDisplay { level, data }
    }
}

impl std::fmt::Display for PhysDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} bytes", self.data.len())?;
        if self.level.data_enabled() {
            format_bytes(f, self.data)?;
        }
        Ok(())
    }
}

const BYTES_PER_DECODE_LINE: usize = 18;

pub(crate) fn format_bytes(f: &mut std::fmt::Formatter, bytes: &[u8]) -> std::fmt::Result {
    for chunk in bytes.chunks(BYTES_PER_DECODE_LINE) {
        writeln!(f)?;
        let mut first = true;
        for byte in chunk {
            if !first {
                f.write_char(' ')?;
            }
            first = false;
            write!(f, "{:02X?}", byte)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_pair() -> (PhysLayer, tokio::io::DuplexStream) {
        let (a, b) = tokio::io::duplex(4096);
        (PhysLayer::new_memory(a, PhysDecodeLevel::Nothing), b)
    }

    #[tokio::test]
    async fn unread_bytes_are_served_before_the_transport() {
        let (mut phys, mut remote) = memory_pair();
        remote.write_all(b"transport").await.unwrap();

        phys.unread(b"abc");
        let mut buf = [0u8; 3];
        assert_eq!(phys.read(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf, b"abc");

        let mut buf = [0u8; 9];
        assert_eq!(phys.read(&mut buf).await.unwrap(), 9);
        assert_eq!(&buf, b"transport");
    }

    #[tokio::test]
    async fn unread_preserves_order_across_calls() {
        let (mut phys, _remote) = memory_pair();
        phys.unread(b"cd");
        phys.unread(b"ab");
        let mut buf = [0u8; 4];
        assert_eq!(phys.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"abcd");
    }

    #[tokio::test]
    async fn context_round_trips_through_save_and_restore() {
        let (mut phys, _remote) = memory_pair();
        let saved = phys.save_context();

        phys.set_nonblock(true);
        phys.set_cond(PollCond::In, true);
        phys.set_cond(PollCond::Out, true);
        phys.set_timeout(Some(Duration::from_secs(5)));
        assert_ne!(phys.save_context(), saved);

        phys.restore_context(saved);
        assert_eq!(phys.save_context(), saved);
        assert!(!phys.cond(PollCond::In));
        assert!(!phys.cond(PollCond::Out));
    }

    #[tokio::test]
    async fn read_times_out_when_the_transport_is_silent() {
        let (mut phys, _remote) = memory_pair();
        phys.set_timeout(Some(Duration::from_millis(10)));
        let mut buf = [0u8; 1];
        let err = phys.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn buffered_bytes_tracks_upper_layer_pushback() {
        let (mut phys, _remote) = memory_pair();
        assert_eq!(phys.buffered_bytes(), 0);
        phys.add_buffered(1);
        assert_eq!(phys.buffered_bytes(), 1);
    }
}
