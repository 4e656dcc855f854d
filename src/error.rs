//! Completion-cause taxonomy shared by the context tree.
//!
//! A [`Cause`] records *why* a scope completed. The absence of a cause
//! (`Completion::Done(None)`) means the scope finished without error, which
//! is distinct from "not finished yet" — see
//! [`Completion`](crate::context::Completion).
//!
//! Causes are values, not panics: cancellation never unwinds, it only
//! settles a completion signal that carries one of these.

use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Why a context completed.
#[derive(Debug, Clone)]
pub enum Cause {
    /// An explicit cancel request.
    Cancelled,
    /// A deadline elapsed before any other completion.
    DeadlineExceeded,
    /// An external error mirrored into the context.
    Propagated(Arc<dyn Error + Send + Sync>),
}

impl Cause {
    /// Wraps an external error value for propagation into a context.
    pub fn propagated<E>(error: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::Propagated(Arc::new(error))
    }

    /// Wraps a non-error rejection value (a bare message) in an error shell.
    pub fn message(text: impl Into<String>) -> Self {
        Self::Propagated(Arc::new(MessageError(text.into())))
    }

    /// Returns true for an explicit cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns true for a deadline expiry.
    #[must_use]
    pub const fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Self::DeadlineExceeded)
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "context cancelled"),
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
            Self::Propagated(err) => write!(f, "{err}"),
        }
    }
}

impl Error for Cause {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Propagated(err) => Some(err.as_ref()),
            Self::Cancelled | Self::DeadlineExceeded => None,
        }
    }
}

impl From<String> for Cause {
    fn from(text: String) -> Self {
        Self::message(text)
    }
}

impl From<&str> for Cause {
    fn from(text: &str) -> Self {
        Self::message(text)
    }
}

/// Error shell for rejection values that are not themselves errors.
#[derive(Debug)]
struct MessageError(String);

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Error for MessageError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_display() {
        assert_eq!(Cause::Cancelled.to_string(), "context cancelled");
        assert!(Cause::Cancelled.is_cancelled());
        assert!(!Cause::Cancelled.is_deadline_exceeded());
    }

    #[test]
    fn deadline_display() {
        assert_eq!(Cause::DeadlineExceeded.to_string(), "deadline exceeded");
        assert!(Cause::DeadlineExceeded.is_deadline_exceeded());
    }

    #[test]
    fn message_wraps_plain_text() {
        let cause = Cause::message("worker gave up");
        assert_eq!(cause.to_string(), "worker gave up");
        assert!(!cause.is_cancelled());
    }

    #[test]
    fn propagated_keeps_source() {
        let io = std::io::Error::other("disk unavailable");
        let cause = Cause::propagated(io);
        assert_eq!(cause.to_string(), "disk unavailable");
        assert!(Error::source(&cause).is_some());
    }

    #[test]
    fn from_str_is_message() {
        let cause: Cause = "rejected".into();
        assert_eq!(cause.to_string(), "rejected");
    }
}
