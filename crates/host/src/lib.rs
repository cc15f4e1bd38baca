//! Reference host: a minimal in-memory path registry, sufficient to run
//! the forwarder/simulcast/transcoding pipeline standalone and to exercise
//! it in integration tests. Not a production media server — see spec §1
//! and §4.K for what remains out of scope (session lifecycle, access
//! control, HTTP surface, upstream protocol servers).

pub mod config;
pub mod registry;

pub use config::{load_config, validate_and_log, HostConfig};
pub use registry::MemoryRegistry;
