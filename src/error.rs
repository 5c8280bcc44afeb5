use event_bus::BusError;

/// Error taxonomy the core distinguishes. Transient variants stay local to
/// their component and are retried or logged there; `Fatal` is reserved for
/// startup failures the process cannot recover from.
#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    #[error("storage error: {0}")]
    TransientStorage(#[from] sqlx::Error),

    #[error("bus error: {0}")]
    TransientBus(#[from] BusError),

    #[error("http error: {0}")]
    TransientHttp(String),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("fatal: {0}")]
    Fatal(String),
}
