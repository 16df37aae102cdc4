//! Error types for the relayforge connection engine.

/// Result type alias for relayforge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the connection engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O operation errors (sockets, files).
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Timer subsystem errors.
    #[error("timer error: {message}")]
    Timer { message: String },

    /// Reactor/event-loop state errors.
    #[error("reactor error: {message}")]
    Reactor { message: String },

    /// Configuration errors (parse, validation).
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Networking/protocol errors.
    #[error("network error: {message}")]
    Network { message: String },

    /// Resource exhaustion (fd limits, queue full, cache full).
    #[error("resource exhausted: {resource}")]
    ResourceExhausted { resource: String },

    /// Concurrency-related errors (lock poisoning, channel closed).
    #[error("concurrency error: {message}")]
    Concurrency { message: String },

    /// Cache subsystem errors (lookup/insert/gc).
    #[error("cache error: {message}")]
    Cache { message: String },

    /// Connection state-machine errors (bad transition, protocol mismatch).
    #[error("connection error: {message}")]
    Proxy { message: String },

    /// Certificate-forging errors surfaced by the `CertForger` boundary.
    #[error("certificate error: {message}")]
    Certificate { message: String },

    /// TLS/encryption errors.
    #[cfg(feature = "tls")]
    #[error("TLS error: {source}")]
    Tls {
        #[from]
        source: rustls::Error,
    },

    /// Generic errors with context.
    #[error("error: {message}")]
    Other { message: String },
}

impl Error {
    pub fn timer<S: Into<String>>(message: S) -> Self {
        Self::Timer { message: message.into() }
    }

    pub fn reactor<S: Into<String>>(message: S) -> Self {
        Self::Reactor { message: message.into() }
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network { message: message.into() }
    }

    pub fn resource_exhausted<S: Into<String>>(resource: S) -> Self {
        Self::ResourceExhausted { resource: resource.into() }
    }

    pub fn concurrency<S: Into<String>>(message: S) -> Self {
        Self::Concurrency { message: message.into() }
    }

    pub fn cache<S: Into<String>>(message: S) -> Self {
        Self::Cache { message: message.into() }
    }

    pub fn proxy<S: Into<String>>(message: S) -> Self {
        Self::Proxy { message: message.into() }
    }

    pub fn certificate<S: Into<String>>(message: S) -> Self {
        Self::Certificate { message: message.into() }
    }

    pub fn other<S: Into<String>>(message: S) -> Self {
        Self::Other { message: message.into() }
    }

    /// Whether a caller may retry the operation that produced this error.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. } => false,
            Self::Timer { .. } => true,
            Self::Reactor { .. } => false,
            Self::Config { .. } => false,
            Self::Network { .. } => true,
            Self::ResourceExhausted { .. } => true,
            Self::Concurrency { .. } => true,
            Self::Cache { .. } => true,
            Self::Proxy { .. } => false,
            Self::Certificate { .. } => false,
            #[cfg(feature = "tls")]
            Self::Tls { .. } => false,
            Self::Other { .. } => false,
        }
    }

    /// Category tag used by stats lines and metrics labels.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Io { .. } => "io",
            Self::Timer { .. } => "timer",
            Self::Reactor { .. } => "reactor",
            Self::Config { .. } => "config",
            Self::Network { .. } => "network",
            Self::ResourceExhausted { .. } => "resource",
            Self::Concurrency { .. } => "concurrency",
            Self::Cache { .. } => "cache",
            Self::Proxy { .. } => "proxy",
            Self::Certificate { .. } => "certificate",
            #[cfg(feature = "tls")]
            Self::Tls { .. } => "tls",
            Self::Other { .. } => "other",
        }
    }
}
