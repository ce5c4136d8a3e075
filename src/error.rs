use std::fmt;

/// Errors that must terminate the scheduler's event loop rather than be
/// delivered as an in-band `on_error` event.
#[derive(Debug)]
pub enum FatalError {
    /// `subscribe` was given a topic the publisher never declared.
    InvalidTopic(String),
    /// `dispatch_*` targeted a topic the publisher never declared.
    UnknownTopic(String),
    /// `dispatch_*` targeted a topic that already received a terminal event.
    TopicAlreadyClosed(String),
    /// A subscriber callback raised something other than a `FatalError`
    /// during inline (main-loop) dispatch.
    ExcInDispatch(String),
    /// A scheduling invariant was violated, or a worker thread's event
    /// loop aborted.
    ScheduleError(String),
    /// An operator was given an out-of-range argument (e.g. `take(-1)`).
    ArgumentOutOfRange(String),
    /// `last()` with no default was called on a stream that produced no
    /// elements.
    SequenceContainsNoElements,
    Io(std::io::Error),
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalError::InvalidTopic(msg) => write!(f, "invalid topic: {msg}"),
            FatalError::UnknownTopic(msg) => write!(f, "unknown topic: {msg}"),
            FatalError::TopicAlreadyClosed(msg) => write!(f, "topic already closed: {msg}"),
            FatalError::ExcInDispatch(msg) => write!(f, "exception in dispatch: {msg}"),
            FatalError::ScheduleError(msg) => write!(f, "schedule error: {msg}"),
            FatalError::ArgumentOutOfRange(msg) => write!(f, "argument out of range: {msg}"),
            FatalError::SequenceContainsNoElements => {
                write!(f, "sequence contains no elements")
            }
            FatalError::Io(err) => write!(f, "io error: {err}"),
            FatalError::Other(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for FatalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FatalError::Io(err) => Some(err),
            FatalError::Other(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FatalError {
    fn from(value: std::io::Error) -> Self {
        FatalError::Io(value)
    }
}

pub type Result<T> = std::result::Result<T, FatalError>;

/// The shape of an in-band (non-fatal) data error, delivered through
/// `on_error`. The runtime never inspects the contents of this error, only
/// whether it downcasts to a [`FatalError`] (see `crate::subscriber::default_on_error`).
pub type DynError = Box<dyn std::error::Error + Send + Sync>;
