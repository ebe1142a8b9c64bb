//! # Runscope Server
//!
//! Live-tail distribution server. Viewers hold one long-lived TCP connection,
//! subscribe to the project list, a project's runs, or a run's samples, and
//! receive pushes as the samples root changes and run logs grow.

mod protocol;
mod server;
mod session;

pub use protocol::{ViewerRequest, ViewerResponse, MAX_FRAME_LENGTH};
pub use server::RunscopeServer;
pub use session::ViewerSession;
