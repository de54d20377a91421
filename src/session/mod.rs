pub mod live_buffer;
pub mod manager;
pub mod model;

pub use live_buffer::{LiveBuffer, LIVE_BUFFER_CAPACITY};
pub use manager::{SessionError, SessionManager, StopOutcome};
pub use model::{Session, DEFAULT_COMPLETION_COMMENT};
