//! Real-time channel: wire events, the broadcast dispatcher and the
//! websocket transport.

pub mod dispatcher;
pub mod events;
pub mod socket;

pub use dispatcher::Dispatcher;
pub use events::{ClientEvent, ServerEvent};
