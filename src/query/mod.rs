//! Query descriptors, references and their persistent store.

pub mod descriptor;
pub mod quota;
pub mod reference;
pub mod store;

pub use descriptor::{InputParam, QueryDescriptor, QueryStatus, QuerySummary};
pub use reference::QueryRef;
pub use store::{QueryStore, SaveOutcome};
