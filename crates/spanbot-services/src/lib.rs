//! Background services for the spanbot gateway.
//!
//! [`CronService`](cron::CronService) runs scheduled jobs from a
//! persistent timer wheel; [`HeartbeatService`](heartbeat::HeartbeatService)
//! periodically wakes the agent against the workspace `HEARTBEAT.md`.

pub mod cron;
pub mod error;
pub mod heartbeat;

pub use cron::CronService;
pub use error::{Result, ServiceError};
pub use heartbeat::HeartbeatService;
