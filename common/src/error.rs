use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Frame too short: {0} bytes")]
    Truncated(usize),

    #[error("Bad frame magic: 0x{0:04X}")]
    BadMagic(u16),

    #[error("Bad frame tail: 0x{0:04X}")]
    BadTail(u16),

    #[error("Frame length mismatch: header={header}, minimum={minimum}")]
    LengthMismatch { header: usize, minimum: usize },

    #[error("CRC mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    #[error("Message id mismatch: header=0x{header:02X}, body=0x{body:02X}")]
    MessageIdMismatch { header: u8, body: u8 },

    #[error("Frame body too large: {0} bytes")]
    TooLarge(usize),

    #[error("Bincode error: {0}")]
    BincodeError(String),
}

impl From<bincode::Error> for FrameError {
    fn from(error: bincode::Error) -> Self {
        FrameError::BincodeError(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
