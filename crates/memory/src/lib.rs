//! Memory backends for Switchboard.

pub mod noop;
pub mod in_memory;

pub use noop::NoopMemory;
pub use in_memory::InMemoryBackend;
