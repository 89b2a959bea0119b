//! Diameter-style AVP codec for EAP-TTLS Phase 2 (RFC 5281 Section 10)
//!
//! Phase 2 data travels inside the TLS tunnel as a sequence of AVPs, each
//! padded to a 4-byte boundary.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           AVP Code                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V M r r r r r r|                  AVP Length                   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Vendor-ID (opt)                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    Data ...
//! +-+-+-+-+-+-+-+-+
//! ```
//!
//! The AVP Length covers the header (and Vendor-ID) plus data, but not the
//! trailing padding.

use thiserror::Error;
use tracing::{debug, warn};

/// Vendor-Specific bit
pub const AVP_FLAGS_VENDOR: u8 = 0x80;
/// Mandatory bit
pub const AVP_FLAGS_MANDATORY: u8 = 0x40;

/// Header length without Vendor-ID
pub const AVP_HEADER_LEN: usize = 8;
/// Header length with Vendor-ID
pub const AVP_VENDOR_HEADER_LEN: usize = 12;

/// Largest value the 24-bit AVP Length field can carry
const AVP_MAX_LENGTH: usize = 0x00ff_ffff;

/// Microsoft's SMI enterprise number, used for the MS-CHAP attributes
pub const VENDOR_ID_MICROSOFT: u32 = 311;

/// RADIUS attribute codes carried as AVPs (vendor 0)
pub mod attr {
    pub const USER_NAME: u32 = 1;
    pub const USER_PASSWORD: u32 = 2;
    pub const CHAP_PASSWORD: u32 = 3;
    pub const CHAP_CHALLENGE: u32 = 60;
    pub const EAP_MESSAGE: u32 = 79;
}

/// Microsoft vendor-specific attribute codes (RFC 2548)
pub mod ms_attr {
    pub const MS_CHAP_RESPONSE: u32 = 1;
    pub const MS_CHAP_ERROR: u32 = 2;
    pub const MS_CHAP_CHALLENGE: u32 = 11;
    pub const MS_CHAP2_RESPONSE: u32 = 25;
    pub const MS_CHAP2_SUCCESS: u32 = 26;
}

/// AVP codec errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AvpError {
    #[error("AVP overflow: length {length} exceeds remaining {remaining} bytes")]
    Overflow { length: usize, remaining: usize },

    #[error("Invalid AVP length: {0}")]
    InvalidLength(usize),

    #[error("Vendor AVP too short for Vendor-ID")]
    VendorUnderflow,

    #[error("Unsupported mandatory AVP code {code} vendor {vendor_id}")]
    UnsupportedMandatory { code: u32, vendor_id: u32 },

    #[error("AVP payload of {0} bytes does not fit the 24-bit length field")]
    PayloadTooLarge(usize),
}

/// Number of zero bytes needed after `len` bytes to reach a 4-byte boundary
pub fn padding(len: usize) -> usize {
    (4 - (len & 3)) & 3
}

/// Append one AVP (header, data and padding) to `buf`
///
/// A non-zero `vendor_id` selects the 12-byte vendor header.
pub fn encode_avp(
    buf: &mut Vec<u8>,
    code: u32,
    vendor_id: u32,
    mandatory: bool,
    data: &[u8],
) -> Result<(), AvpError> {
    let mut flags = if mandatory { AVP_FLAGS_MANDATORY } else { 0 };
    let header_len = if vendor_id != 0 {
        flags |= AVP_FLAGS_VENDOR;
        AVP_VENDOR_HEADER_LEN
    } else {
        AVP_HEADER_LEN
    };

    let length = header_len + data.len();
    if length > AVP_MAX_LENGTH {
        return Err(AvpError::PayloadTooLarge(data.len()));
    }

    buf.reserve(length + padding(length));
    buf.extend_from_slice(&code.to_be_bytes());
    buf.extend_from_slice(&(((flags as u32) << 24) | length as u32).to_be_bytes());
    if vendor_id != 0 {
        buf.extend_from_slice(&vendor_id.to_be_bytes());
    }
    buf.extend_from_slice(data);
    buf.resize(buf.len() + padding(length), 0);

    Ok(())
}

/// Wrap `payload` in a single standard (vendor 0) AVP
pub fn encapsulate(payload: &[u8], code: u32, mandatory: bool) -> Result<Vec<u8>, AvpError> {
    let mut buf = Vec::new();
    encode_avp(&mut buf, code, 0, mandatory, payload)?;
    Ok(buf)
}

/// The Phase 2 attributes recognized in one decrypted message
///
/// Everything except `eap` borrows from the decoded buffer. EAP-Message
/// AVPs are concatenated in arrival order into `eap`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AvpSet<'a> {
    pub eap: Option<Vec<u8>>,
    pub user_name: Option<&'a [u8]>,
    pub user_password: Option<&'a [u8]>,
    pub chap_challenge: Option<&'a [u8]>,
    pub chap_password: Option<&'a [u8]>,
    pub mschap_challenge: Option<&'a [u8]>,
    pub mschap_response: Option<&'a [u8]>,
    pub mschap2_response: Option<&'a [u8]>,
}

impl<'a> AvpSet<'a> {
    /// Decode a buffer of concatenated AVPs
    ///
    /// Fails as a whole on a malformed AVP or an unknown mandatory one;
    /// unknown optional AVPs are skipped.
    pub fn parse(buf: &'a [u8]) -> Result<Self, AvpError> {
        let mut set = AvpSet::default();
        let mut pos = 0;

        while pos < buf.len() {
            let remaining = buf.len() - pos;
            if remaining < AVP_HEADER_LEN {
                return Err(AvpError::Overflow {
                    length: AVP_HEADER_LEN,
                    remaining,
                });
            }

            let avp = &buf[pos..];
            let code = u32::from_be_bytes([avp[0], avp[1], avp[2], avp[3]]);
            let word = u32::from_be_bytes([avp[4], avp[5], avp[6], avp[7]]);
            let flags = (word >> 24) as u8;
            let length = (word & 0x00ff_ffff) as usize;

            debug!(
                "EAP-TTLS: AVP: code={} flags=0x{:02x} length={}",
                code, flags, length
            );

            if length > remaining {
                warn!(
                    "EAP-TTLS: AVP overflow (len={}, left={}) - dropped",
                    length, remaining
                );
                return Err(AvpError::Overflow { length, remaining });
            }
            if length < AVP_HEADER_LEN {
                warn!("EAP-TTLS: Invalid AVP length {}", length);
                return Err(AvpError::InvalidLength(length));
            }

            let mut data = &avp[AVP_HEADER_LEN..length];
            let mut vendor_id = 0;
            if flags & AVP_FLAGS_VENDOR != 0 {
                if data.len() < 4 {
                    warn!("EAP-TTLS: vendor AVP underflow");
                    return Err(AvpError::VendorUnderflow);
                }
                vendor_id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
                debug!("EAP-TTLS: AVP vendor_id {}", vendor_id);
                data = &data[4..];
            }

            set.absorb(code, vendor_id, flags, data)?;

            pos += length + padding(length);
        }

        Ok(set)
    }

    fn absorb(&mut self, code: u32, vendor_id: u32, flags: u8, data: &'a [u8]) -> Result<(), AvpError> {
        match (vendor_id, code) {
            (0, attr::EAP_MESSAGE) => {
                debug!("EAP-TTLS: AVP - EAP Message ({} bytes)", data.len());
                self.eap.get_or_insert_with(Vec::new).extend_from_slice(data);
            }
            (0, attr::USER_NAME) => {
                debug!(
                    "EAP-TTLS: User-Name '{}'",
                    String::from_utf8_lossy(data)
                );
                self.user_name = Some(data);
            }
            (0, attr::USER_PASSWORD) => {
                let end = data.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
                debug!("EAP-TTLS: User-Password (PAP), {} bytes", end);
                self.user_password = Some(&data[..end]);
            }
            (0, attr::CHAP_CHALLENGE) => {
                debug!("EAP-TTLS: CHAP-Challenge (CHAP)");
                self.chap_challenge = Some(data);
            }
            (0, attr::CHAP_PASSWORD) => {
                debug!("EAP-TTLS: CHAP-Password (CHAP)");
                self.chap_password = Some(data);
            }
            (VENDOR_ID_MICROSOFT, ms_attr::MS_CHAP_CHALLENGE) => {
                debug!("EAP-TTLS: MS-CHAP-Challenge");
                self.mschap_challenge = Some(data);
            }
            (VENDOR_ID_MICROSOFT, ms_attr::MS_CHAP_RESPONSE) => {
                debug!("EAP-TTLS: MS-CHAP-Response (MSCHAP)");
                self.mschap_response = Some(data);
            }
            (VENDOR_ID_MICROSOFT, ms_attr::MS_CHAP2_RESPONSE) => {
                debug!("EAP-TTLS: MS-CHAP2-Response (MSCHAPV2)");
                self.mschap2_response = Some(data);
            }
            _ if flags & AVP_FLAGS_MANDATORY != 0 => {
                warn!(
                    "EAP-TTLS: Unsupported mandatory AVP code {} vendor_id {} - dropped",
                    code, vendor_id
                );
                return Err(AvpError::UnsupportedMandatory { code, vendor_id });
            }
            _ => {
                debug!(
                    "EAP-TTLS: Ignoring unsupported AVP code {} vendor_id {}",
                    code, vendor_id
                );
            }
        }
        Ok(())
    }

    /// Select the one Phase 2 exchange this message carries
    ///
    /// Precedence: EAP, PAP, CHAP, MS-CHAP, MS-CHAPv2.
    pub fn into_request(self) -> Phase2Request<'a> {
        if let Some(eap) = self.eap {
            Phase2Request::Eap(eap)
        } else if let Some(password) = self.user_password {
            Phase2Request::Pap { password }
        } else if let Some(password) = self.chap_password {
            Phase2Request::Chap {
                challenge: self.chap_challenge,
                password,
            }
        } else if let Some(response) = self.mschap_response {
            Phase2Request::MsChap {
                challenge: self.mschap_challenge,
                response,
            }
        } else if let Some(response) = self.mschap2_response {
            Phase2Request::MsChapV2 {
                challenge: self.mschap_challenge,
                response,
            }
        } else {
            Phase2Request::Empty
        }
    }
}

/// The inner authentication carried by one Phase 2 message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase2Request<'a> {
    Eap(Vec<u8>),
    Pap {
        password: &'a [u8],
    },
    Chap {
        challenge: Option<&'a [u8]>,
        password: &'a [u8],
    },
    MsChap {
        challenge: Option<&'a [u8]>,
        response: &'a [u8],
    },
    MsChapV2 {
        challenge: Option<&'a [u8]>,
        response: &'a [u8],
    },
    Empty,
}
