//! Persistence layer: durable record of which version each unit's worker is
//! registered at.

pub mod libsql_backend;
pub mod memory;
pub mod traits;

pub use libsql_backend::LibSqlRegistrationStore;
pub use memory::MemoryRegistrationStore;
pub use traits::RegistrationStore;
