mod automation;
mod error;
mod session;

pub use automation::{BrowserLauncher, ChromiumSession};
pub use error::{BrowserError, BrowserResult};
pub use session::{close_session, PageSession, SessionFactory, SocketEvent, TrafficEvent};
