pub mod event;
pub mod execution;
pub mod labels;
pub mod repository;

pub use event::{Actor, Event, TriggerTarget};
pub use execution::{ExecutionKey, ExecutionRecord, SpecStatus};
pub use repository::Repository;
