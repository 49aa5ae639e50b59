//! NATS integration for the worker pool.

pub mod subscriber;

pub use subscriber::{
    tenant_from_subject, NatsSubscriber, EXECUTION_FANOUT_SUBJECTS, EXECUTION_QUEUE_SUBJECTS,
};
