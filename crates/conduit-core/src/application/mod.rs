//! Application services of the Conduit engine

pub mod flow_engine;
pub mod flow_execution_service;
pub mod flow_registry;
pub mod idempotency;
pub mod resume_coordinator;
pub mod trigger_dispatcher;
