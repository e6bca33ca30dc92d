use core::fmt::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdError {
    /// A readiness bit never asserted within the poll bound.
    Timeout,
    /// Computed checksum disagrees with the received or expected one.
    CrcMismatch,
    /// Write attempted against a read-only card.
    WriteProtected,
    /// Card requires a password unlock.
    Locked,
    /// Addressing beyond the card capacity.
    OutOfRange,
    /// Malformed buffer or scatter list.
    InvalidArgument,
    /// No card present, or identification failed.
    NoCard,
    /// Malformed response framing or an unexpected card status.
    ProtocolError,
}

impl SdError {
    /// Errors consistent with a transient bus fault, worth a reset and one retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SdError::Timeout | SdError::CrcMismatch | SdError::ProtocolError
        )
    }
}

impl Display for SdError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SdError::Timeout => write!(f, "Operation timed out"),
            SdError::CrcMismatch => write!(f, "CRC mismatch"),
            SdError::WriteProtected => write!(f, "Card is write protected"),
            SdError::Locked => write!(f, "Card is password locked"),
            SdError::OutOfRange => write!(f, "Sector out of range"),
            SdError::InvalidArgument => write!(f, "Invalid argument"),
            SdError::NoCard => write!(f, "No usable card"),
            SdError::ProtocolError => write!(f, "SD protocol error"),
        }
    }
}

impl core::error::Error for SdError {}

pub type SdResult<T = ()> = Result<T, SdError>;
