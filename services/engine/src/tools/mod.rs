//! Agent Tools
//!
//! Transports behind the engine's capability traits. The GCP client uses
//! ADC (Application Default Credentials) for authentication; the in-memory
//! cloud backs dry runs and tests.

pub mod gcp;
pub mod memory;

pub use gcp::GcpIamClient;
pub use memory::InMemoryCloud;
