pub mod state;
pub mod store;
pub mod writer;

pub use state::{FileState, OffsetTable, SharedFileState};
pub use store::{Registry, RegistryError};
pub use writer::{run_registry_writer, RegistryWriter, SharedRegistry};
