//! Workflow engine core: process nets of conditions and tasks with
//! AND/XOR/OR routing, executed as token games one case at a time.
//!
//! A [`spec::Net`] is built and validated once, then shared immutably by
//! every case launched from it. Each case is driven by a [`runner::NetRunner`]
//! that applies external [`events::CaseEvent`]s as atomic transition units,
//! persists through a [`store::CaseStore`] and emits
//! [`events::Announcement`]s for the worklist, timer and exception-handling
//! collaborators. The [`coordinator::CaseCoordinator`] multiplexes many
//! cases over one store and announcement stream.

pub mod coordinator;
pub mod enablement;
pub mod error;
pub mod events;
pub mod marking;
pub mod runner;
pub mod spec;
pub mod store;
pub mod store_memory;
pub mod workitem;

pub use coordinator::CaseCoordinator;
pub use error::EngineError;
pub use events::{Announcement, CaseEvent};
pub use runner::{CaseState, NetRunner};
pub use spec::{Net, NetBuilder};
pub use store::{CaseSnapshot, CaseStore};
pub use store_memory::MemoryStore;
pub use workitem::{WorkItem, WorkItemState};
