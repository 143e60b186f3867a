//! Error types for gusmidi operations.

/// Errors produced by the patch loader, format parsers, synthesis engine and writer.
#[derive(thiserror::Error, Debug)]
pub enum GusMidiError {
    /// IO error from filesystem access.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A patch or sample file could not be located or decoded.
    #[error("load error: {0}")]
    Load(String),

    /// A handle or resource could not be opened.
    #[error("open error: {0}")]
    Open(String),

    /// A structurally well-formed but semantically invalid value was encountered.
    #[error("invalid: {0}")]
    Invalid(String),

    /// A container was truncated or internally inconsistent.
    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// An engine or song operation was attempted before required setup completed.
    #[error("not initialised")]
    NotInit,

    /// A caller-supplied argument was out of range or otherwise invalid.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// Initialisation was attempted twice.
    #[error("already initialised")]
    AlreadyInit,

    /// Input did not begin with a recognised MIDI container magic.
    #[error("not a MIDI file")]
    NotMidi,

    /// Input exceeded the accepted size bound.
    #[error("file too long")]
    FileTooLong,

    /// Input claimed to be HMP/HMP2 but failed header validation.
    #[error("not an HMP file")]
    NotHmp,

    /// Input claimed to be HMI but failed header validation.
    #[error("not an HMI file")]
    NotHmi,

    /// Conversion to Standard MIDI File bytes failed.
    #[error("conversion failed: {0}")]
    ConvertFailed(String),

    /// Input claimed to be MUS but failed header validation.
    #[error("not a MUS file")]
    NotMus,

    /// Input claimed to be XMIDI but failed header validation.
    #[error("not an XMIDI file")]
    NotXmi,

    /// Catch-all for errors without a more specific variant.
    #[error("{0}")]
    Other(String),
}

#[cfg(feature = "wav-export")]
impl From<hound::Error> for GusMidiError {
    /// Converts a `hound` WAV I/O error into `GusMidiError::Open`.
    fn from(err: hound::Error) -> Self {
        GusMidiError::Open(err.to_string())
    }
}

impl From<String> for GusMidiError {
    /// Converts a `String` into `GusMidiError::Other`.
    ///
    /// This loses semantic information about the error's category. Prefer a specific
    /// variant constructor where one fits:
    /// - `GusMidiError::Load(msg)` for patch/sample resolution failures
    /// - `GusMidiError::Invalid(msg)` for well-formed-but-wrong values
    /// - `GusMidiError::Corrupt(msg)` for truncated/inconsistent containers
    fn from(msg: String) -> Self {
        GusMidiError::Other(msg)
    }
}

impl From<&str> for GusMidiError {
    /// Converts a string slice into `GusMidiError::Other`. See `From<String>`.
    fn from(msg: &str) -> Self {
        GusMidiError::Other(msg.to_string())
    }
}

/// Result type for gusmidi operations.
pub type Result<T> = std::result::Result<T, GusMidiError>;
