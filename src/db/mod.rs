//! Database access: SQL connections, in-pod command execution, and parsing
//! of cockroach CLI output.

pub mod exec;
pub mod node_status;
pub mod sql;

pub use node_status::NodeDrainStatus;
pub use sql::DbClient;
