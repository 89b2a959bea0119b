//! EAP-TTLS outer framing (RFC 5281 Section 9.2)
//!
//! EAP-TTLS reuses the EAP-TLS flags octet, with the low three bits
//! carrying the protocol version. Large TLS messages are split into
//! fragments that each need an acknowledgment from the other side.

use tracing::{debug, warn};

use crate::eap::{EapCode, EapError, EapPacket, EapType};

/// Default outbound fragment size
pub const DEFAULT_FRAGMENT_SIZE: usize = 1398;

/// Largest fragment that keeps the EAP Length field in range: the frame
/// adds the EAP header, type, flags and the 4-byte TLS Message Length
pub const MAX_FRAGMENT_SIZE: usize = u16::MAX as usize - 10;

/// Largest reassembled inbound message accepted
pub const MAX_MESSAGE_SIZE: usize = 65536;

/// EAP-TTLS flags (first byte of Type-Data)
///
/// ```text
///  0 1 2 3 4 5 6 7
/// +-+-+-+-+-+-+-+-+
/// |L M S R R  V   |
/// +-+-+-+-+-+-+-+-+
/// ```
///
/// - L (Length included) = 0x80
/// - M (More fragments) = 0x40
/// - S (Start) = 0x20
/// - V (Version) = 0x07
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlsFlags(u8);

impl TtlsFlags {
    /// Length included flag (L bit)
    pub const LENGTH_INCLUDED: u8 = 0x80;
    /// More fragments flag (M bit)
    pub const MORE_FRAGMENTS: u8 = 0x40;
    /// Start flag (S bit)
    pub const START: u8 = 0x20;
    /// Version bits
    pub const VERSION_MASK: u8 = 0x07;

    pub fn new(length_included: bool, more_fragments: bool, start: bool, version: u8) -> Self {
        let mut flags = version & Self::VERSION_MASK;
        if length_included {
            flags |= Self::LENGTH_INCLUDED;
        }
        if more_fragments {
            flags |= Self::MORE_FRAGMENTS;
        }
        if start {
            flags |= Self::START;
        }
        TtlsFlags(flags)
    }

    /// Create from raw byte, dropping the reserved bits
    pub fn from_u8(value: u8) -> Self {
        TtlsFlags(value & !0x18)
    }

    pub fn as_u8(self) -> u8 {
        self.0
    }

    pub fn length_included(self) -> bool {
        (self.0 & Self::LENGTH_INCLUDED) != 0
    }

    pub fn more_fragments(self) -> bool {
        (self.0 & Self::MORE_FRAGMENTS) != 0
    }

    pub fn start(self) -> bool {
        (self.0 & Self::START) != 0
    }

    pub fn version(self) -> u8 {
        self.0 & Self::VERSION_MASK
    }
}

/// EAP-TTLS Type-Data
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |     Flags     |                Message Length
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///         Message Length          |             Data...
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlsPacket {
    pub flags: TtlsFlags,
    /// Total message length (present if L flag is set)
    pub message_length: Option<u32>,
    pub data: Vec<u8>,
}

impl TtlsPacket {
    pub fn new(flags: TtlsFlags, message_length: Option<u32>, data: Vec<u8>) -> Self {
        TtlsPacket {
            flags,
            message_length,
            data,
        }
    }

    /// The Start packet announcing the server's version
    pub fn start(version: u8) -> Self {
        TtlsPacket::new(TtlsFlags::new(false, false, true, version), None, Vec::new())
    }

    /// Parse from EAP Type-Data
    pub fn from_eap_data(data: &[u8]) -> Result<Self, EapError> {
        let Some(&first) = data.first() else {
            return Err(EapError::PacketTooShort {
                expected: 1,
                actual: 0,
            });
        };

        let flags = TtlsFlags::from_u8(first);
        let (message_length, offset) = if flags.length_included() {
            if data.len() < 5 {
                return Err(EapError::PacketTooShort {
                    expected: 5,
                    actual: data.len(),
                });
            }
            (
                Some(u32::from_be_bytes([data[1], data[2], data[3], data[4]])),
                5,
            )
        } else {
            (None, 1)
        };

        Ok(TtlsPacket {
            flags,
            message_length,
            data: data[offset..].to_vec(),
        })
    }

    pub fn to_eap_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(5 + self.data.len());
        data.push(self.flags.as_u8());
        if let Some(length) = self.message_length {
            data.extend_from_slice(&length.to_be_bytes());
        }
        data.extend_from_slice(&self.data);
        data
    }

    pub fn to_eap_request(&self, identifier: u8) -> EapPacket {
        EapPacket::new(
            EapCode::Request,
            identifier,
            Some(EapType::Ttls),
            self.to_eap_data(),
        )
    }

    pub fn to_eap_response(&self, identifier: u8) -> EapPacket {
        EapPacket::new(
            EapCode::Response,
            identifier,
            Some(EapType::Ttls),
            self.to_eap_data(),
        )
    }
}

/// Transport sub-state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingState {
    /// No fragment exchange in progress
    Idle,
    /// Peer sent a fragment; the next request must acknowledge it
    FragAck,
    /// Server sent a fragment; waiting for the peer's acknowledgment
    WaitFragAck,
}

/// Result of feeding one inbound frame to the framing layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// A complete message for the session
    Message(Vec<u8>),
    /// A fragment was buffered; acknowledge it
    Fragment,
    /// The peer acknowledged our last fragment
    Ack,
}

/// Reassembly and fragmentation for one session
#[derive(Debug)]
pub struct TtlsFraming {
    state: FramingState,
    fragment_size: usize,
    in_buf: Vec<u8>,
    in_expected: Option<usize>,
    out_buf: Vec<u8>,
    out_used: usize,
}

impl TtlsFraming {
    /// `fragment_size` is clamped to `1..=MAX_FRAGMENT_SIZE`
    pub fn new(fragment_size: usize) -> Self {
        if fragment_size > MAX_FRAGMENT_SIZE {
            warn!(
                "EAP-TTLS: Fragment size {} too large, using {}",
                fragment_size, MAX_FRAGMENT_SIZE
            );
        }
        TtlsFraming {
            state: FramingState::Idle,
            fragment_size: fragment_size.clamp(1, MAX_FRAGMENT_SIZE),
            in_buf: Vec::new(),
            in_expected: None,
            out_buf: Vec::new(),
            out_used: 0,
        }
    }

    pub fn state(&self) -> FramingState {
        self.state
    }

    pub fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    /// Feed one inbound EAP-TTLS packet
    pub fn receive(&mut self, packet: &TtlsPacket) -> Result<Received, EapError> {
        if self.state == FramingState::WaitFragAck {
            if !packet.data.is_empty() {
                warn!(
                    "EAP-TTLS: Unexpected payload ({} bytes) in fragment ack",
                    packet.data.len()
                );
                return Err(EapError::UnexpectedFragment);
            }
            debug!("EAP-TTLS: Received fragment ack");
            return Ok(Received::Ack);
        }

        if let Some(length) = packet.message_length {
            let length = length as usize;
            if length > MAX_MESSAGE_SIZE {
                warn!("EAP-TTLS: Announced message length {} too large", length);
                return Err(EapError::MessageTooLarge(length));
            }
            if self.in_buf.is_empty() {
                self.in_expected = Some(length);
            }
        }

        let limit = self.in_expected.unwrap_or(MAX_MESSAGE_SIZE);
        if self.in_buf.len() + packet.data.len() > limit {
            warn!(
                "EAP-TTLS: Fragment overflows announced length ({} + {})",
                self.in_buf.len(),
                packet.data.len()
            );
            self.reset_in();
            return Err(EapError::MessageTooLarge(limit));
        }
        self.in_buf.extend_from_slice(&packet.data);

        if packet.flags.more_fragments() {
            debug!(
                "EAP-TTLS: Received fragment, {} bytes buffered",
                self.in_buf.len()
            );
            self.state = FramingState::FragAck;
            return Ok(Received::Fragment);
        }

        self.state = FramingState::Idle;
        let message = std::mem::take(&mut self.in_buf);
        let expected = self.in_expected.take();
        if let Some(announced) = expected
            && announced != message.len()
        {
            warn!(
                "EAP-TTLS: Reassembled {} bytes, peer announced {}",
                message.len(),
                announced
            );
            return Err(EapError::ReassemblyMismatch {
                announced,
                actual: message.len(),
            });
        }

        Ok(Received::Message(message))
    }

    fn reset_in(&mut self) {
        self.in_buf.clear();
        self.in_expected = None;
        self.state = FramingState::Idle;
    }

    /// Acknowledge a received fragment
    pub fn build_ack(&self, identifier: u8, version: u8) -> EapPacket {
        debug!("EAP-TTLS: Building fragment ack");
        TtlsPacket::new(TtlsFlags::new(false, false, false, version), None, Vec::new())
            .to_eap_request(identifier)
    }

    /// Queue a complete outbound message
    pub fn set_out(&mut self, data: Vec<u8>) {
        self.out_buf = data;
        self.out_used = 0;
    }

    pub fn has_pending_out(&self) -> bool {
        self.out_used < self.out_buf.len()
    }

    /// Build the next outbound frame from the queued message
    ///
    /// An empty queue yields a frame with no data.
    pub fn build_msg(&mut self, identifier: u8, version: u8) -> EapPacket {
        let remaining = self.out_buf.len() - self.out_used;
        let total = self.out_buf.len();
        let more = remaining > self.fragment_size;
        let len = remaining.min(self.fragment_size);
        let length_included = more && self.out_used == 0;

        let data = self.out_buf[self.out_used..self.out_used + len].to_vec();
        self.out_used += len;

        if more {
            debug!(
                "EAP-TTLS: Sending fragment of {} bytes, {} more to send",
                len,
                total - self.out_used
            );
            self.state = FramingState::WaitFragAck;
        } else {
            if total > self.fragment_size {
                debug!("EAP-TTLS: Sending out last fragment ({} bytes)", len);
            }
            self.state = FramingState::Idle;
            self.out_buf.clear();
            self.out_used = 0;
        }

        TtlsPacket::new(
            TtlsFlags::new(length_included, more, false, version),
            length_included.then_some(total as u32),
            data,
        )
        .to_eap_request(identifier)
    }
}

impl Default for TtlsFraming {
    fn default() -> Self {
        Self::new(DEFAULT_FRAGMENT_SIZE)
    }
}
