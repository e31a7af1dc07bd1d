//! Session lifecycle, dispatch and fan-out.

pub mod coordinator;
pub mod fanout;
pub mod handlers;
pub mod model;
pub mod usage;

pub use coordinator::{NodeServices, SessionChannels, SessionCoordinator, SessionStats};
pub use fanout::{FanoutReport, SubordinateLink, Subordinates};
pub use handlers::HandlerTable;
pub use model::{Role, Session, SessionState, SessionTag};
