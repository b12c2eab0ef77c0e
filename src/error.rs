use thiserror::Error;

/// Failure kinds surfaced by the runtime.
///
/// Errors are `Clone` because a single failure is often broadcast to several
/// waiters (the init gate, pending bus requests, `onError` props).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    /// The browser refused to open a popup window.
    #[error("popup failed to open: {0}")]
    PopupOpen(String),

    /// Bad registration options, missing required prop, unknown prop.
    #[error("integration error: {0}")]
    Integration(String),

    /// Origin checks failed at render or delegate time.
    #[error("render error: {0}")]
    Render(String),

    /// An ack or response deadline expired.
    #[error("message timed out: {0}")]
    MessageTimeout(String),

    /// The peer window closed during a request or before init.
    #[error("window closed: {0}")]
    WindowClosed(String),

    /// A remote listener threw; carries the peer's stack when it sent one.
    #[error("remote error: {message}")]
    Remote {
        message: String,
        stack: Option<String>,
    },

    /// A prop value failed type checking or coercion.
    #[error("validation error: {0}")]
    Validation(String),

    /// Unrecoverable internal state (unknown parent reference, bad domain).
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    pub fn remote(message: impl Into<String>) -> Self {
        Error::Remote {
            message: message.into(),
            stack: None,
        }
    }

    /// True when the failure should be treated as the peer being gone,
    /// rather than a fault in our own state.
    pub fn is_window_closed(&self) -> bool {
        matches!(self, Error::WindowClosed(_))
    }
}
