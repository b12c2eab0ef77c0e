use std::time::Duration;

/// Transports the bus may try when sending a frame, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStrategy {
    /// Direct `postMessage` to the peer window.
    PostMessage,
    /// Re-post through a same-origin bridge frame registered for the peer's
    /// domain.
    Bridge,
    /// Same-process direct queue push; only meaningful for mock/file schemes
    /// where `postMessage` origins are unusable.
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

/// Tunables for the message bus and component lifecycle.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// How long a request may wait for its ACK before failing.
    pub ack_timeout: Duration,
    /// Default deadline for the full request/response transaction. Callers
    /// may override per send; `None` on a send means unbounded.
    pub response_timeout: Duration,
    /// Poll period for closed-window and deadline checks while a request is
    /// in flight.
    pub poll_interval: Duration,
    /// Send strategies to attempt, in order.
    pub strategies: Vec<SendStrategy>,
    /// Cap on the received-message dedup ring.
    pub dedup_capacity: usize,
    pub log_level: LogLevel,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(1),
            response_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(50),
            strategies: vec![SendStrategy::PostMessage],
            dedup_capacity: 1024,
            log_level: LogLevel::default(),
        }
    }
}
