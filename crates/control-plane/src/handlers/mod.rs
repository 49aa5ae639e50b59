//! HTTP handlers for the ExecuStack Control Plane API.

pub mod execute;
pub mod health;
pub mod realtime;

pub use execute::execute;
pub use health::{api_health, health_check};
