pub mod balancer;
pub mod client_accounting;
pub mod failure;
pub mod health;
pub mod socket;

pub use balancer::Balancer;
pub use client_accounting::ClientAccountingMap;
pub use failure::{FailureManager, FailureStatus};
pub use health::{HealthCheckConfig, HealthCheckRegistry};
pub use socket::{FilteredSocket, SocketFilter};
