//! Relay wire protocol parsing and serialization.
//!
//! Every packet on the relay socket is framed as a 2-byte big-endian size
//! (counting the header itself), a 1-byte flag, and a payload. The high bit
//! of the flag marks an acknowledgement; the low 7 bits carry the packet
//! type. Payload encryption is applied by the caller; this crate only deals
//! in frames and the plaintext layout of control payloads.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, Bytes, BytesMut};

/// Frame header: size(u16) + flag(u8).
pub const PACKET_HEADER_BYTES: usize = 3;
/// Largest frame carrying relay data.
pub const MAX_DATA_PACKET_SIZE: usize = 0x7FFF;
/// Largest control-plane frame.
pub const MAX_CONTROL_PACKET_SIZE: usize = 0x1000;
/// High bit of the flag byte marks an acknowledgement.
pub const ACK_BIT: u8 = 0x80;

/// Wire width of a node identifier.
pub const ID_BYTES: usize = 32;
/// Wire width of a session public key.
pub const SESSION_KEY_BYTES: usize = 32;
/// Wire width of a session nonce.
pub const NONCE_BYTES: usize = 24;
/// Wire width of a challenge signature.
pub const SIGNATURE_BYTES: usize = 64;
/// Authentication tag appended by both encryption variants.
pub const MAC_BYTES: usize = 16;

/// Server challenges are random byte strings within these bounds.
pub const MIN_CHALLENGE_BYTES: usize = 32;
/// Upper challenge bound.
pub const MAX_CHALLENGE_BYTES: usize = 256;

/// Random plaintext padding appended to control packets is below this bound.
pub const MAX_PADDING_BYTES: usize = 256;

/// Largest upstream read that still fits one DATA frame after sealing.
pub const MAX_UPSTREAM_READ_SIZE: usize = MAX_DATA_PACKET_SIZE - PACKET_HEADER_BYTES - MAC_BYTES;

/// Decrypted AUTH|ACK payload: server session pk + assigned port + domain flag.
pub const AUTH_ACK_PLAIN_BYTES: usize = SESSION_KEY_BYTES + 2 + 1;
/// Decrypted CONNECT payload: addr_len + fixed 16-byte address + port.
pub const CONNECT_PLAIN_BYTES: usize = 1 + 16 + 2;

/// Packet types carried in the low 7 bits of the flag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Auth = 0x01,
    Attach = 0x02,
    Ping = 0x03,
    Connect = 0x04,
    Disconnect = 0x05,
    Data = 0x06,
    Err = 0x7F,
}

impl PacketType {
    /// Flag byte for this type, with the ACK bit applied when requested.
    #[inline]
    #[must_use]
    pub fn flag(self, ack: bool) -> u8 {
        (self as u8) | if ack { ACK_BIT } else { 0 }
    }

    /// Frame-size ceiling for this type.
    #[inline]
    #[must_use]
    pub fn max_frame_size(self) -> usize {
        match self {
            Self::Data => MAX_DATA_PACKET_SIZE,
            _ => MAX_CONTROL_PACKET_SIZE,
        }
    }
}

impl TryFrom<u8> for PacketType {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, ParseError> {
        match value {
            0x01 => Ok(Self::Auth),
            0x02 => Ok(Self::Attach),
            0x03 => Ok(Self::Ping),
            0x04 => Ok(Self::Connect),
            0x05 => Ok(Self::Disconnect),
            0x06 => Ok(Self::Data),
            0x7F => Ok(Self::Err),
            other => Err(ParseError::UnknownType(other)),
        }
    }
}

/// Protocol violations that terminate the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Frame size field below the header width.
    UndersizedFrame(usize),
    /// Frame size field above the limit for its type.
    OversizedFrame(usize),
    /// Flag byte carries an unassigned type code.
    UnknownType(u8),
    /// Decrypted payload shorter than its fixed fields.
    TruncatedPayload,
    /// CONNECT address length is not a valid IPv4/IPv6 width.
    BadAddressLength(u8),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UndersizedFrame(n) => write!(f, "frame size {n} below header width"),
            Self::OversizedFrame(n) => write!(f, "frame size {n} above limit"),
            Self::UnknownType(t) => write!(f, "unknown packet type 0x{t:02x}"),
            Self::TruncatedPayload => write!(f, "payload shorter than its fixed fields"),
            Self::BadAddressLength(n) => write!(f, "invalid address length {n}"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Errors that can occur when building a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    /// Payload would push the frame above the limit for its type.
    PayloadTooLarge,
}

impl std::fmt::Display for WriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PayloadTooLarge => write!(f, "payload exceeds frame size limit"),
        }
    }
}

impl std::error::Error for WriteError {}

/// Parse result for incremental parsing.
///
/// - `Complete(T)` - parsing succeeded, contains the parsed value.
/// - `Incomplete(n)` - buffer too small; `n` is the **minimum total bytes**
///   needed. Caller should accumulate more data and retry.
/// - `Invalid(e)` - protocol violation, the connection should be closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseResult<T> {
    Complete(T),
    Incomplete(usize),
    Invalid(ParseError),
}

/// A borrowed view of one complete frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame<'a> {
    pub kind: PacketType,
    pub ack: bool,
    pub payload: &'a [u8],
    /// Total wire length including the header.
    pub frame_len: usize,
}

/// Parse one frame from the start of `buf`.
///
/// The size field is validated before the payload is available, so a frame
/// announcing an out-of-range length is rejected without waiting for it.
#[inline]
pub fn parse_frame(buf: &[u8]) -> ParseResult<Frame<'_>> {
    if buf.len() < 2 {
        return ParseResult::Incomplete(2);
    }
    let size = read_u16(&buf[0..2]) as usize;
    if size < PACKET_HEADER_BYTES {
        return ParseResult::Invalid(ParseError::UndersizedFrame(size));
    }
    if size > MAX_DATA_PACKET_SIZE {
        return ParseResult::Invalid(ParseError::OversizedFrame(size));
    }
    if buf.len() < PACKET_HEADER_BYTES {
        return ParseResult::Incomplete(PACKET_HEADER_BYTES);
    }

    let flag = buf[2];
    let kind = match PacketType::try_from(flag & !ACK_BIT) {
        Ok(kind) => kind,
        Err(e) => return ParseResult::Invalid(e),
    };
    if size > kind.max_frame_size() {
        return ParseResult::Invalid(ParseError::OversizedFrame(size));
    }
    if buf.len() < size {
        return ParseResult::Incomplete(size);
    }

    ParseResult::Complete(Frame {
        kind,
        ack: flag & ACK_BIT != 0,
        payload: &buf[PACKET_HEADER_BYTES..size],
        frame_len: size,
    })
}

/// Append one frame to `buf`.
///
/// # Errors
/// - `PayloadTooLarge` if the frame would exceed the size limit for `kind`.
#[allow(clippy::cast_possible_truncation)]
pub fn write_frame(
    buf: &mut BytesMut,
    kind: PacketType,
    ack: bool,
    payload: &[u8],
) -> Result<(), WriteError> {
    let size = PACKET_HEADER_BYTES + payload.len();
    if size > kind.max_frame_size() {
        return Err(WriteError::PayloadTooLarge);
    }
    buf.extend_from_slice(&(size as u16).to_be_bytes());
    buf.extend_from_slice(&[kind.flag(ack)]);
    buf.extend_from_slice(payload);
    Ok(())
}

/// An owned frame handed out by [`FrameBuffer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedFrame {
    pub kind: PacketType,
    pub ack: bool,
    pub payload: Bytes,
}

/// Reassembly buffer for the relay byte stream.
///
/// Reads from the server may slice frames arbitrarily; bytes are appended
/// here and complete frames drained one at a time. Between calls the buffer
/// holds at most a strict prefix of the next frame.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(MAX_CONTROL_PACKET_SIZE),
        }
    }

    /// Append raw bytes received from the socket.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, if one is buffered.
    ///
    /// # Errors
    /// Returns the protocol violation that makes the stream unrecoverable.
    pub fn try_next(&mut self) -> Result<Option<OwnedFrame>, ParseError> {
        match parse_frame(&self.buf) {
            ParseResult::Complete(frame) => {
                let (kind, ack, frame_len) = (frame.kind, frame.ack, frame.frame_len);
                let mut whole = self.buf.split_to(frame_len);
                whole.advance(PACKET_HEADER_BYTES);
                Ok(Some(OwnedFrame {
                    kind,
                    ack,
                    payload: whole.freeze(),
                }))
            }
            ParseResult::Incomplete(_) => Ok(None),
            ParseResult::Invalid(e) => Err(e),
        }
    }

    /// Bytes currently parked (a strict prefix of the next frame).
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

// ============================================================================
// Control payload formats (plaintext side of the encryption boundary)
// ============================================================================

/// Inner AUTH payload, sealed to the server node.
///
/// Layout: session pk, connection nonce, challenge signature, domain length,
/// domain bytes, then caller-supplied padding.
pub fn write_auth_plain(
    buf: &mut BytesMut,
    session_pk: &[u8; SESSION_KEY_BYTES],
    nonce: &[u8; NONCE_BYTES],
    signature: &[u8; SIGNATURE_BYTES],
    domain: Option<&str>,
    padding: &[u8],
) {
    let domain = domain.map(str::as_bytes).unwrap_or_default();
    debug_assert!(domain.len() <= u8::MAX as usize);
    buf.extend_from_slice(session_pk);
    buf.extend_from_slice(nonce);
    buf.extend_from_slice(signature);
    buf.extend_from_slice(&[domain.len() as u8]);
    buf.extend_from_slice(domain);
    buf.extend_from_slice(padding);
}

/// Inner ATTACH payload, sealed to the server node. Padding stays outside
/// the seal and is appended to the frame as plaintext.
pub fn write_attach_plain(
    buf: &mut BytesMut,
    session_pk: &[u8; SESSION_KEY_BYTES],
    nonce: &[u8; NONCE_BYTES],
    signature: &[u8; SIGNATURE_BYTES],
) {
    buf.extend_from_slice(session_pk);
    buf.extend_from_slice(nonce);
    buf.extend_from_slice(signature);
}

/// Parsed inner AUTH/ATTACH payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakePlain {
    pub session_pk: [u8; SESSION_KEY_BYTES],
    pub nonce: [u8; NONCE_BYTES],
    pub signature: [u8; SIGNATURE_BYTES],
    /// Present only on the AUTH variant; empty string when not advertised.
    pub domain: Option<String>,
}

/// Parse a decrypted AUTH or ATTACH inner payload.
///
/// # Errors
/// - `TruncatedPayload` if the fixed fields do not fit.
pub fn parse_handshake_plain(plain: &[u8], with_domain: bool) -> Result<HandshakePlain, ParseError> {
    let fixed = SESSION_KEY_BYTES + NONCE_BYTES + SIGNATURE_BYTES;
    if plain.len() < fixed + usize::from(with_domain) {
        return Err(ParseError::TruncatedPayload);
    }
    let mut session_pk = [0u8; SESSION_KEY_BYTES];
    session_pk.copy_from_slice(&plain[..SESSION_KEY_BYTES]);
    let mut nonce = [0u8; NONCE_BYTES];
    nonce.copy_from_slice(&plain[SESSION_KEY_BYTES..SESSION_KEY_BYTES + NONCE_BYTES]);
    let mut signature = [0u8; SIGNATURE_BYTES];
    signature.copy_from_slice(&plain[SESSION_KEY_BYTES + NONCE_BYTES..fixed]);

    let domain = if with_domain {
        let len = plain[fixed] as usize;
        if plain.len() < fixed + 1 + len {
            return Err(ParseError::TruncatedPayload);
        }
        let bytes = &plain[fixed + 1..fixed + 1 + len];
        Some(String::from_utf8_lossy(bytes).into_owned())
    } else {
        None
    };

    Ok(HandshakePlain {
        session_pk,
        nonce,
        signature,
        domain,
    })
}

/// Decrypted AUTH|ACK payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthAckPlain {
    pub server_session_pk: [u8; SESSION_KEY_BYTES],
    pub assigned_port: u16,
    pub domain_enabled: bool,
}

/// Serialize an AUTH|ACK payload (server side / tests).
pub fn write_auth_ack_plain(buf: &mut BytesMut, ack: &AuthAckPlain) {
    buf.extend_from_slice(&ack.server_session_pk);
    buf.extend_from_slice(&ack.assigned_port.to_be_bytes());
    buf.extend_from_slice(&[u8::from(ack.domain_enabled)]);
}

/// Parse a decrypted AUTH|ACK payload. Trailing bytes are ignored.
///
/// # Errors
/// - `TruncatedPayload` if shorter than [`AUTH_ACK_PLAIN_BYTES`].
pub fn parse_auth_ack_plain(plain: &[u8]) -> Result<AuthAckPlain, ParseError> {
    if plain.len() < AUTH_ACK_PLAIN_BYTES {
        return Err(ParseError::TruncatedPayload);
    }
    let mut server_session_pk = [0u8; SESSION_KEY_BYTES];
    server_session_pk.copy_from_slice(&plain[..SESSION_KEY_BYTES]);
    let assigned_port = read_u16(&plain[SESSION_KEY_BYTES..SESSION_KEY_BYTES + 2]);
    Ok(AuthAckPlain {
        server_session_pk,
        assigned_port,
        domain_enabled: plain[SESSION_KEY_BYTES + 2] & 0x01 != 0,
    })
}

/// Serialize a CONNECT payload: address length, 16 fixed address bytes
/// (zero-filled past the meaningful prefix), port.
pub fn write_connect_plain(buf: &mut BytesMut, client: SocketAddr) {
    let mut addr = [0u8; 16];
    let addr_len: u8 = match client.ip() {
        IpAddr::V4(ip) => {
            addr[..4].copy_from_slice(&ip.octets());
            4
        }
        IpAddr::V6(ip) => {
            addr.copy_from_slice(&ip.octets());
            16
        }
    };
    buf.extend_from_slice(&[addr_len]);
    buf.extend_from_slice(&addr);
    buf.extend_from_slice(&client.port().to_be_bytes());
}

/// Parse a decrypted CONNECT payload into the downstream client's address.
/// Only the leading `addr_len` address bytes are meaningful; trailing bytes
/// beyond the fixed fields are ignored.
///
/// # Errors
/// - `TruncatedPayload` if shorter than [`CONNECT_PLAIN_BYTES`].
/// - `BadAddressLength` for widths other than 4 or 16.
pub fn parse_connect_plain(plain: &[u8]) -> Result<SocketAddr, ParseError> {
    if plain.len() < CONNECT_PLAIN_BYTES {
        return Err(ParseError::TruncatedPayload);
    }
    let addr_len = plain[0];
    let port = read_u16(&plain[17..19]);
    let ip: IpAddr = match addr_len {
        4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&plain[1..5]);
            Ipv4Addr::from(octets).into()
        }
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&plain[1..17]);
            Ipv6Addr::from(octets).into()
        }
        other => return Err(ParseError::BadAddressLength(other)),
    };
    Ok(SocketAddr::new(ip, port))
}

/// Decrypted ERR payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPlain {
    pub code: u16,
    pub message: String,
}

/// Serialize an ERR payload (server side / tests).
pub fn write_err_plain(buf: &mut BytesMut, code: u16, message: &str) {
    buf.extend_from_slice(&code.to_be_bytes());
    buf.extend_from_slice(message.as_bytes());
}

/// Parse a decrypted ERR payload.
///
/// # Errors
/// - `TruncatedPayload` if the code does not fit.
pub fn parse_err_plain(plain: &[u8]) -> Result<ErrPlain, ParseError> {
    if plain.len() < 2 {
        return Err(ParseError::TruncatedPayload);
    }
    Ok(ErrPlain {
        code: read_u16(&plain[..2]),
        message: String::from_utf8_lossy(&plain[2..]).into_owned(),
    })
}

/// Fold a success flag into a randomised byte: only bit 0 is meaningful,
/// the rest carries caller-supplied noise.
#[inline]
#[must_use]
pub fn encode_success(noise: u8, success: bool) -> u8 {
    if success { noise | 0x01 } else { noise & 0xFE }
}

/// Recover the success flag from a CONNECT|ACK byte.
#[inline]
#[must_use]
pub fn decode_success(byte: u8) -> bool {
    byte & 0x01 != 0
}

#[inline]
fn read_u16(buf: &[u8]) -> u16 {
    debug_assert!(buf.len() >= 2, "read_u16 requires at least 2 bytes");
    u16::from_be_bytes([buf[0], buf[1]])
}
