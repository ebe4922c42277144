//! Network link ownership.
//!
//! [`session_manager`] applies the connect policy (bounded retries, then fatal);
//! [`link`] talks to the platform's view of the interface.

pub mod link;
pub mod session_manager;

pub use link::{LinkDriver, LinkError, LinkInfo, SysfsLink};
pub use session_manager::SessionManager;
