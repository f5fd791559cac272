//! Central side of the charging network: the coordinator, its control channel
//! to station engines, the TCP control port, the operator console and the
//! registry client.

pub mod admin;
pub mod control;
pub mod coordinator;
pub mod registry_client;
pub mod server;

pub use control::{ControlChannel, ControlCommand, ControlError, LocalControl, RetryPolicy, TcpControlHub};
pub use coordinator::{Coordinator, ReconcileReport};
pub use registry_client::{LocalDirectory, RegistryClient, StationDirectory, spawn_registry_poller};
pub use server::{CentralServer, ServerError};
