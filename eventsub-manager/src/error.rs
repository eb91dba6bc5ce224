use eventsub_stream::SessionError;
use thiserror::Error;

/// Errors that can occur in the EventSub manager
///
/// Attaching and detaching never fail; problems with an individual session
/// are reported to its listeners as status updates instead.
#[derive(Error, Debug)]
pub enum EventManagerError {
    /// The background worker thread could not be started
    #[error("Failed to spawn event worker: {0}")]
    WorkerSpawn(#[from] std::io::Error),

    /// The background worker is no longer running
    #[error("Event worker has stopped")]
    WorkerDisconnected,

    /// A session did not shut down cleanly
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Result type for EventSub manager operations
pub type Result<T> = std::result::Result<T, EventManagerError>;
