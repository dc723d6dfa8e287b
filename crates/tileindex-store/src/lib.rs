//! LanceDB-backed implementations of the registry, vector store and queue.

pub mod queue;
pub mod registry;
pub mod schema;
pub mod table;
pub mod vectors;

pub use queue::LanceQueue;
pub use registry::LanceTileRegistry;
pub use vectors::LanceVectorStore;
