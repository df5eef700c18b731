pub mod broker;
pub mod collaborators;
pub mod metrics_sink;
pub mod redis_broker;
pub mod storage;
