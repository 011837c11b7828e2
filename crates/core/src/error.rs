//! Error types for the streaming library.

use std::fmt;

/// Errors that can occur in the streaming library.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Transport**: [`Transport`](Self::Transport) carries the native SRT
///   error code, [`Io`](Self::Io) covers plain UDP/TCP/file failures.
/// - **Format**: [`Sdp`](Self::Sdp), [`UnsupportedSampleRate`](Self::UnsupportedSampleRate),
///   [`UnsupportedAudioFormat`](Self::UnsupportedAudioFormat),
///   [`MissingParameterSets`](Self::MissingParameterSets), [`Relay`](Self::Relay),
///   [`Mux`](Self::Mux).
/// - **Lifecycle**: [`AlreadyRunning`](Self::AlreadyRunning),
///   [`NotStarted`](Self::NotStarted), [`InvalidState`](Self::InvalidState),
///   [`TrackNotConfigured`](Self::TrackNotConfigured).
/// - **Delivery**: [`Disconnected`](Self::Disconnected) is the only error a
///   muxer returns from a steady-state write.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SRT transport failure with the native error code.
    #[error("{0}")]
    Transport(#[from] TransportError),

    /// Malformed SDP text.
    #[error("SDP parse error at line {line}: {kind}")]
    Sdp { line: usize, kind: SdpErrorKind },

    /// Malformed relay frame (bad magic or oversized length).
    #[error("relay framing error: {0}")]
    Relay(&'static str),

    /// Sample rate is not one of the 13 rates an ADTS header can express.
    #[error("unsupported AAC sample rate: {0} Hz")]
    UnsupportedSampleRate(u32),

    /// Object type outside AAC Main..LTP or a channel count ADTS cannot signal.
    #[error("unsupported AAC format: object type {profile}, {channels} channels")]
    UnsupportedAudioFormat { profile: u8, channels: u8 },

    /// Transport stream muxer rejected a stream or frame.
    #[error("MPEG-TS mux error: {0}")]
    Mux(String),

    /// A key frame arrived before any SPS/PPS was seen.
    #[error("key frame without cached SPS/PPS")]
    MissingParameterSets,

    /// RTMP negotiation failure.
    #[error("RTMP error: {0}")]
    Rtmp(String),

    /// A bounded wait elapsed.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The peer or the transport reported a fatal disconnect.
    #[error("transport disconnected")]
    Disconnected,

    /// `open`/`start` called on something already running.
    #[error("already running")]
    AlreadyRunning,

    /// Operation requires `open`/`start` first.
    #[error("not started")]
    NotStarted,

    /// Operation is not valid in the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// `on_prepare` was called with neither a video nor an audio track.
    #[error("no track configured")]
    TrackNotConfigured,
}

/// Which SRT operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    BindFailed,
    AcceptFailed,
    ConnectFailed,
    SendFailed,
    RecvFailed,
    OptionFailed,
    StatsFailed,
    StartupFailed,
    AlreadyClosed,
    InvalidState,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BindFailed => write!(f, "bind failed"),
            Self::AcceptFailed => write!(f, "accept failed"),
            Self::ConnectFailed => write!(f, "connect failed"),
            Self::SendFailed => write!(f, "send failed"),
            Self::RecvFailed => write!(f, "receive failed"),
            Self::OptionFailed => write!(f, "set option failed"),
            Self::StatsFailed => write!(f, "stats query failed"),
            Self::StartupFailed => write!(f, "library startup failed"),
            Self::AlreadyClosed => write!(f, "socket already closed"),
            Self::InvalidState => write!(f, "invalid socket state"),
        }
    }
}

/// SRT failure: the operation plus the native error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("SRT {kind} (code {code})")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub code: i32,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, code: i32) -> Self {
        Self { kind, code }
    }

    /// Fail-fast error for operations on a closed socket.
    pub fn already_closed() -> Self {
        Self::new(
            TransportErrorKind::AlreadyClosed,
            crate::transport::srt::code::EINVSOCK,
        )
    }

    /// Whether the native code means the peer connection is gone for good,
    /// as opposed to a transient send/receive failure.
    pub fn is_connection_closed(&self) -> bool {
        self.kind == TransportErrorKind::AlreadyClosed
            || crate::transport::srt::code::is_connection_closed(self.code)
    }
}

/// Specific kind of SDP parse failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdpErrorKind {
    /// Input contained no description lines.
    Empty,
    /// Line is not of the form `<letter>=<value>`.
    InvalidLine,
    /// A mandatory session-level field (`v=`, `o=`, `s=`) is absent.
    MissingField(char),
    /// A field was present but its value could not be parsed.
    InvalidValue(char),
}

impl fmt::Display for SdpErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty description"),
            Self::InvalidLine => write!(f, "invalid line"),
            Self::MissingField(c) => write!(f, "missing {c}= field"),
            Self::InvalidValue(c) => write!(f, "invalid {c}= value"),
        }
    }
}

/// Convenience alias for `Result<T, StreamError>`.
pub type Result<T> = std::result::Result<T, StreamError>;
