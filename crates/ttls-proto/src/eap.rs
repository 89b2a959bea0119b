//! EAP (Extensible Authentication Protocol) packet model
//!
//! Structures for the EAP frames defined in RFC 3748. The outer EAP-TTLS
//! exchange and the Phase 2 frames tunneled inside EAP-Message AVPs share
//! this representation.
//!
//! # EAP Packet Format
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Code      |  Identifier   |            Length             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Type      |  Type-Data ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use thiserror::Error;

/// Size of the fixed EAP header (code, identifier, length)
pub const EAP_HEADER_LEN: usize = 4;

/// Code octet of an EAP frame
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EapCode {
    Request = 1,
    Response = 2,
    Success = 3,
    Failure = 4,
}

impl EapCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        [Self::Request, Self::Response, Self::Success, Self::Failure]
            .into_iter()
            .find(|code| *code as u8 == value)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Method types seen on the outer and Phase 2 exchanges
///
/// Unknown types stay representable through [`EapPacket::type_octet`].
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EapType {
    Identity = 1,
    Notification = 2,
    /// Legacy Nak; the data lists the types the peer would accept
    Nak = 3,
    Md5Challenge = 4,
    OneTimePassword = 5,
    GenericTokenCard = 6,
    Tls = 13,
    Ttls = 21,
    Peap = 25,
    MsChapV2 = 26,
    /// EAP-TNC, started inside the tunnel after Phase 2
    Tnc = 38,
    Teap = 55,
}

const EAP_TYPE_NAMES: &[(EapType, &str)] = &[
    (EapType::Identity, "IDENTITY"),
    (EapType::Notification, "NOTIFICATION"),
    (EapType::Nak, "NAK"),
    (EapType::Md5Challenge, "MD5"),
    (EapType::OneTimePassword, "OTP"),
    (EapType::GenericTokenCard, "GTC"),
    (EapType::Tls, "TLS"),
    (EapType::Ttls, "TTLS"),
    (EapType::Peap, "PEAP"),
    (EapType::MsChapV2, "MSCHAPV2"),
    (EapType::Tnc, "TNC"),
    (EapType::Teap, "TEAP"),
];

impl EapType {
    pub fn from_u8(value: u8) -> Option<Self> {
        EAP_TYPE_NAMES
            .iter()
            .map(|(eap_type, _)| *eap_type)
            .find(|eap_type| *eap_type as u8 == value)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Method name as written in user databases ("MD5", "TTLS", ...)
    pub fn name(self) -> &'static str {
        EAP_TYPE_NAMES
            .iter()
            .find(|(eap_type, _)| *eap_type == self)
            .map_or("UNKNOWN", |(_, name)| name)
    }

    /// Case-insensitive inverse of [`EapType::name`]
    ///
    /// Nak is a response-only type and never names a configured method.
    pub fn from_name(name: &str) -> Option<Self> {
        EAP_TYPE_NAMES
            .iter()
            .find(|(eap_type, n)| *eap_type != EapType::Nak && n.eq_ignore_ascii_case(name))
            .map(|(eap_type, _)| *eap_type)
    }
}

/// One EAP frame
///
/// Success and Failure frames carry neither type nor data.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EapPacket {
    pub code: EapCode,
    /// Echoed by the peer; a response must carry the request's value
    pub identifier: u8,
    /// Type octet as received, including types this crate does not know
    pub type_octet: Option<u8>,
    pub data: Vec<u8>,
}

impl EapPacket {
    pub fn new(code: EapCode, identifier: u8, eap_type: Option<EapType>, data: Vec<u8>) -> Self {
        EapPacket {
            code,
            identifier,
            type_octet: eap_type.map(EapType::as_u8),
            data,
        }
    }

    /// Request/Identity with an optional displayable prompt
    pub fn identity_request(identifier: u8, message: &str) -> Self {
        Self::new(
            EapCode::Request,
            identifier,
            Some(EapType::Identity),
            message.as_bytes().to_vec(),
        )
    }

    pub fn identity_response(identifier: u8, identity: &[u8]) -> Self {
        Self::new(
            EapCode::Response,
            identifier,
            Some(EapType::Identity),
            identity.to_vec(),
        )
    }

    /// Response/Nak listing the method types the peer would accept
    pub fn nak(identifier: u8, proposed: &[u8]) -> Self {
        Self::new(
            EapCode::Response,
            identifier,
            Some(EapType::Nak),
            proposed.to_vec(),
        )
    }

    pub fn success(identifier: u8) -> Self {
        Self::new(EapCode::Success, identifier, None, Vec::new())
    }

    pub fn failure(identifier: u8) -> Self {
        Self::new(EapCode::Failure, identifier, None, Vec::new())
    }

    /// The method type, if it is one this crate knows
    pub fn eap_type(&self) -> Option<EapType> {
        self.type_octet.and_then(EapType::from_u8)
    }

    /// Decode one frame
    ///
    /// The header's Length field bounds the frame; trailing bytes are ignored.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EapError> {
        if bytes.len() < EAP_HEADER_LEN {
            return Err(EapError::PacketTooShort {
                expected: EAP_HEADER_LEN,
                actual: bytes.len(),
            });
        }

        let code = EapCode::from_u8(bytes[0]).ok_or(EapError::InvalidCode(bytes[0]))?;
        let identifier = bytes[1];
        let length = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;

        if length < EAP_HEADER_LEN {
            return Err(EapError::InvalidLength(length));
        }
        if bytes.len() < length {
            return Err(EapError::PacketTooShort {
                expected: length,
                actual: bytes.len(),
            });
        }

        let (type_octet, data) = match code {
            EapCode::Request | EapCode::Response => {
                if length < EAP_HEADER_LEN + 1 {
                    return Err(EapError::InvalidLength(length));
                }
                (Some(bytes[4]), bytes[5..length].to_vec())
            }
            EapCode::Success | EapCode::Failure => (None, Vec::new()),
        };

        Ok(EapPacket {
            code,
            identifier,
            type_octet,
            data,
        })
    }

    /// Encode the frame
    ///
    /// The frame must fit the 16-bit Length field; outbound EAP-TTLS frames
    /// are bounded by `framing::MAX_FRAGMENT_SIZE`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let length = self.length();
        debug_assert!(
            u16::try_from(length).is_ok(),
            "EAP frame of {} bytes overflows the Length field",
            length
        );
        let mut bytes = Vec::with_capacity(length);

        bytes.push(self.code.as_u8());
        bytes.push(self.identifier);
        bytes.extend_from_slice(&(length as u16).to_be_bytes());

        if let (EapCode::Request | EapCode::Response, Some(type_octet)) =
            (self.code, self.type_octet)
        {
            bytes.push(type_octet);
            bytes.extend_from_slice(&self.data);
        }

        bytes
    }

    /// Value of the Length field
    pub fn length(&self) -> usize {
        match (self.code, self.type_octet) {
            (EapCode::Request | EapCode::Response, Some(_)) => {
                EAP_HEADER_LEN + 1 + self.data.len()
            }
            _ => EAP_HEADER_LEN,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EapError {
    #[error("Packet too short: expected at least {expected} bytes, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("Invalid EAP code: {0}")]
    InvalidCode(u8),

    #[error("Invalid packet length: {0}")]
    InvalidLength(usize),

    #[error("Unexpected EAP type: {0}")]
    UnexpectedType(u8),

    #[error("Fragment received while waiting for acknowledgment")]
    UnexpectedFragment,

    #[error("Reassembled message length {actual} does not match announced {announced}")]
    ReassemblyMismatch { announced: usize, actual: usize },

    #[error("Reassembled message exceeds {0} bytes")]
    MessageTooLarge(usize),
}

/// EAP-MD5 Challenge helpers (RFC 3748 Section 5.4)
///
/// Used by the built-in MD5-Challenge inner method.
pub mod eap_md5 {
    use super::*;

    /// EAP-MD5 Challenge value size
    pub const MD5_CHALLENGE_SIZE: usize = 16;

    /// EAP-MD5 Response value size (16 bytes MD5 hash)
    pub const MD5_RESPONSE_SIZE: usize = 16;

    /// Create an EAP-MD5 Challenge request
    ///
    /// ```text
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// | Value-Size    | Value (Challenge) ...
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// | Name (optional) ...
    /// +-+-+-+-+-+-+-+-+
    /// ```
    pub fn create_challenge(identifier: u8, challenge: &[u8], name: &str) -> EapPacket {
        let mut data = Vec::with_capacity(1 + challenge.len() + name.len());
        data.push(challenge.len() as u8);
        data.extend_from_slice(challenge);
        data.extend_from_slice(name.as_bytes());

        EapPacket::new(
            EapCode::Request,
            identifier,
            Some(EapType::Md5Challenge),
            data,
        )
    }

    /// Create an EAP-MD5 Response
    pub fn create_response(identifier: u8, response_hash: &[u8; 16], name: &str) -> EapPacket {
        let mut data = Vec::with_capacity(1 + MD5_RESPONSE_SIZE + name.len());
        data.push(MD5_RESPONSE_SIZE as u8);
        data.extend_from_slice(response_hash);
        data.extend_from_slice(name.as_bytes());

        EapPacket::new(
            EapCode::Response,
            identifier,
            Some(EapType::Md5Challenge),
            data,
        )
    }

    /// Extract the 16-byte response value from an EAP-MD5 Response
    pub fn parse_response(packet: &EapPacket) -> Result<[u8; 16], EapError> {
        match packet.type_octet {
            Some(t) if t == EapType::Md5Challenge.as_u8() => {}
            Some(t) => return Err(EapError::UnexpectedType(t)),
            None => return Err(EapError::InvalidLength(packet.length())),
        }

        if packet.data.len() < 1 + MD5_RESPONSE_SIZE {
            return Err(EapError::PacketTooShort {
                expected: 1 + MD5_RESPONSE_SIZE,
                actual: packet.data.len(),
            });
        }

        let value_size = packet.data[0] as usize;
        if value_size != MD5_RESPONSE_SIZE {
            return Err(EapError::InvalidLength(value_size));
        }

        let mut response_hash = [0u8; 16];
        response_hash.copy_from_slice(&packet.data[1..1 + MD5_RESPONSE_SIZE]);
        Ok(response_hash)
    }
}
