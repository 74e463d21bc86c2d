
use std::collections::HashMap;
use std::fmt;

use crate::attributes::*;
use crate::checks::*;
use crate::error::*;
use crate::message::*;

/// ErrorCodeAttribute represents the ERROR-CODE attribute.
///
/// The class and number bytes are stored raw: standards-track peers split a
/// code as class = code/100, but legacy Google peers write class = code/256
/// and number = code%256, so readers must be able to reassemble with either
/// arithmetic.
///
/// RFC 5389 Section 15.6
#[derive(Default, Debug, PartialEq, Eq)]
pub struct ErrorCodeAttribute {
    pub class: u8,
    pub number: u8,
    pub reason: Vec<u8>,
}

impl fmt::Display for ErrorCodeAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match String::from_utf8(self.reason.clone()) {
            Ok(reason) => reason,
            Err(_) => return Err(fmt::Error {}),
        };

        write!(f, "{}: {}", self.code().0, reason)
    }
}

// constants for ERROR-CODE encoding.
const ERROR_CODE_CLASS_BYTE: usize = 2;
const ERROR_CODE_NUMBER_BYTE: usize = 3;
const ERROR_CODE_REASON_START: usize = 4;
const ERROR_CODE_REASON_MAX_B: usize = 763;
const ERROR_CODE_MODULO: u16 = 100;

impl ErrorCodeAttribute {
    /// Builds the attribute with the canonical class/number split.
    pub fn new(code: ErrorCode, reason: Vec<u8>) -> Self {
        ErrorCodeAttribute {
            class: (code.0 / ERROR_CODE_MODULO) as u8,
            number: (code.0 % ERROR_CODE_MODULO) as u8,
            reason,
        }
    }

    /// Builds the attribute with the legacy Google split (class is the high
    /// byte of the code, number the low byte).
    pub fn new_legacy(code: ErrorCode, reason: Vec<u8>) -> Self {
        ErrorCodeAttribute {
            class: (code.0 / 256) as u8,
            number: (code.0 % 256) as u8,
            reason,
        }
    }

    /// Canonical code: class * 100 + number.
    pub fn code(&self) -> ErrorCode {
        ErrorCode(self.class as u16 * ERROR_CODE_MODULO + self.number as u16)
    }

    /// Legacy code: class * 256 + number.
    pub fn legacy_code(&self) -> ErrorCode {
        ErrorCode(self.class as u16 * 256 + self.number as u16)
    }
}

impl Setter for ErrorCodeAttribute {
    fn add_to(&self, m: &mut Message) -> Result<()> {
        check_overflow(
            ATTR_ERROR_CODE,
            self.reason.len() + ERROR_CODE_REASON_START,
            ERROR_CODE_REASON_MAX_B + ERROR_CODE_REASON_START,
        )?;

        let mut value: Vec<u8> = Vec::with_capacity(ERROR_CODE_REASON_START + self.reason.len());
        value.extend_from_slice(&[0, 0]);
        value.push(self.class); // [ERROR_CODE_CLASS_BYTE]
        value.push(self.number); // [ERROR_CODE_NUMBER_BYTE]
        value.extend_from_slice(&self.reason);

        m.add(ATTR_ERROR_CODE, &value);

        Ok(())
    }
}

impl Getter for ErrorCodeAttribute {
    fn get_from(&mut self, m: &Message) -> Result<()> {
        let v = m.get(ATTR_ERROR_CODE)?;

        if v.len() < ERROR_CODE_REASON_START {
            return Err(Error::ErrUnexpectedEof);
        }

        self.class = v[ERROR_CODE_CLASS_BYTE];
        self.number = v[ERROR_CODE_NUMBER_BYTE];
        self.reason = v[ERROR_CODE_REASON_START..].to_vec();

        Ok(())
    }
}

/// ErrorCode is the code carried by an ERROR-CODE attribute.
#[derive(PartialEq, Eq, Hash, Copy, Clone, Default, Debug)]
pub struct ErrorCode(pub u16);

impl Setter for ErrorCode {
    /// Adds an ERROR-CODE with the default reason to m, or
    /// ErrNoDefaultReason when none is registered.
    fn add_to(&self, m: &mut Message) -> Result<()> {
        if let Some(reason) = ERROR_REASONS.get(self) {
            let a = ErrorCodeAttribute::new(*self, reason.clone());
            a.add_to(m)
        } else {
            Err(Error::ErrNoDefaultReason)
        }
    }
}

// The error codes this engine sends and understands.
pub const CODE_BAD_REQUEST: ErrorCode = ErrorCode(400);
pub const CODE_UNAUTHORIZED: ErrorCode = ErrorCode(401);
pub const CODE_UNKNOWN_ATTRIBUTE: ErrorCode = ErrorCode(420);
pub const CODE_STALE_CREDENTIALS: ErrorCode = ErrorCode(438);
pub const CODE_ROLE_CONFLICT: ErrorCode = ErrorCode(487);
pub const CODE_SERVER_ERROR: ErrorCode = ErrorCode(500);
pub const CODE_GLOBAL_FAILURE: ErrorCode = ErrorCode(600);

lazy_static! {
    pub static ref ERROR_REASONS: HashMap<ErrorCode, Vec<u8>> = [
        (CODE_BAD_REQUEST, b"Bad Request".to_vec()),
        (CODE_UNAUTHORIZED, b"Unauthorized".to_vec()),
        (CODE_UNKNOWN_ATTRIBUTE, b"Unknown Attribute".to_vec()),
        (CODE_STALE_CREDENTIALS, b"Stale Credentials".to_vec()),
        (CODE_ROLE_CONFLICT, b"Role Conflict".to_vec()),
        (CODE_SERVER_ERROR, b"Server Error".to_vec()),
        (CODE_GLOBAL_FAILURE, b"Global Failure".to_vec()),
    ]
    .iter()
    .cloned()
    .collect();
}
