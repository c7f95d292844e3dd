//! Domain model (work items, states, ids, errors).

pub mod errors;
pub mod ids;
pub mod item;
pub mod state;

pub use self::errors::{EngineError, ErrorKind, HandlerError, LoaderError};
pub use self::ids::RunId;
pub use self::item::{ItemShape, MalformedItem, WorkItem};
pub use self::state::{ShutdownState, TaskState, Termination, Trigger};
