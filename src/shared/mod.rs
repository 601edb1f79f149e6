//! Shared state and messaging between the engine and its subscribers
//!
//! Scan sessions publish runtime counters through a shared lock and
//! stability transitions through channels.

pub mod messages;
pub mod state;

pub use messages::ScanEvent;
pub use state::RuntimeState;
