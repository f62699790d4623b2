//! JSON-lines IPC surface: one request object per stdin line, one
//! response envelope per stdout line.

mod error;
mod handlers;
mod router;
mod types;

pub use router::handle_request;
pub use types::{AppState, Request};
