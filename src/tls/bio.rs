use std::collections::VecDeque;

/// In-memory BIO pair backing a TLS session.
///
/// The handshake driver moves records between this buffer and the real
/// stream; the TLS library only ever sees memory. A starved read reports
/// `WouldBlock`, which the library surfaces as `WANT_READ` so the driver can
/// suspend on the right poll condition.
pub(crate) struct MemoryBio {
    incoming: VecDeque<u8>,
    outgoing: Vec<u8>,
    eof: bool,
}

impl MemoryBio {
    pub(crate) fn new() -> Self {
        Self {
            incoming: VecDeque::new(),
            outgoing: Vec::new(),
            eof: false,
        }
    }

    /// Append raw bytes received from the peer.
    pub(crate) fn feed(&mut self, bytes: &[u8]) {
        self.incoming.extend(bytes);
    }

    /// Take every record byte the library produced since the last drain.
    pub(crate) fn take_outgoing(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outgoing)
    }

    pub(crate) fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }
}

impl std::io::Read for MemoryBio {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.incoming.is_empty() {
            if self.eof {
                return Ok(0);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                "no buffered records",
            ));
        }
        let count = buf.len().min(self.incoming.len());
        for slot in buf.iter_mut().take(count) {
            *slot = self.incoming.pop_front().unwrap();
        }
        Ok(count)
    }
}

impl std::io::Write for MemoryBio {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.outgoing.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn starved_read_would_block() {
        let mut bio = MemoryBio::new();
        let mut buf = [0u8; 4];
        let err = bio.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }

    #[test]
    fn fed_bytes_are_read_in_order() {
        let mut bio = MemoryBio::new();
        bio.feed(b"ab");
        bio.feed(b"cd");
        let mut buf = [0u8; 3];
        assert_eq!(bio.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"abc");
        let mut buf = [0u8; 8];
        assert_eq!(bio.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], b'd');
    }

    #[test]
    fn writes_accumulate_until_drained() {
        let mut bio = MemoryBio::new();
        bio.write_all(b"rec1").unwrap();
        bio.write_all(b"rec2").unwrap();
        assert!(bio.has_outgoing());
        assert_eq!(bio.take_outgoing(), b"rec1rec2");
        assert!(!bio.has_outgoing());
    }
}
