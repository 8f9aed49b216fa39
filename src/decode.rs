/// Controls the decoding of handshake progress and physical-layer data in the log output
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DecodeLevel {
    /// Controls logging of handshake progress and peer identity
    pub handshake: HandshakeDecodeLevel,
    /// Controls the logging of physical layer read/write
    pub physical: PhysDecodeLevel,
}

/// Controls how much handshake detail is logged at the DEBUG log level
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HandshakeDecodeLevel {
    /// Decode nothing
    Nothing,
    /// Log state-machine transitions
    Steps,
    /// Log state-machine transitions and the identity of the peer certificate
    PeerIdentity,
}

/// Controls how data transmitted at the physical layer (TCP, in-memory, etc) is logged
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PhysDecodeLevel {
    /// Log nothing
    Nothing,
    /// Log the length of data that is sent and received
    Length,
    /// Log the length and the actual data that is sent and received
    Data,
}

impl DecodeLevel {
    /// decode nothing
    pub fn nothing() -> Self {
        Self {
            handshake: HandshakeDecodeLevel::Nothing,
            physical: PhysDecodeLevel::Nothing,
        }
    }

    /// construct a `DecodeLevel` from its fields
    pub fn new(handshake: HandshakeDecodeLevel, physical: PhysDecodeLevel) -> Self {
        Self {
            handshake,
            physical,
        }
    }
}

impl Default for DecodeLevel {
    fn default() -> Self {
        Self::nothing()
    }
}

impl HandshakeDecodeLevel {
    pub(crate) fn enabled(&self) -> bool {
        !matches!(self, Self::Nothing)
    }

    pub(crate) fn peer_identity_enabled(&self) -> bool {
        matches!(self, Self::PeerIdentity)
    }
}

impl PhysDecodeLevel {
    pub(crate) fn enabled(&self) -> bool {
        !matches!(self, Self::Nothing)
    }

    pub(crate) fn data_enabled(&self) -> bool {
        matches!(self, Self::Data)
    }
}
