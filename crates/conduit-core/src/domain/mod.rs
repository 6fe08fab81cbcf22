/// Flow instance domain models
pub mod flow_instance;

/// Domain events
pub mod events;

/// Flow definition domain models
pub mod flow_definition;

/// Step flags, records and execution context
pub mod step;

/// Declarative data bag conditions
pub mod condition;

/// Static and dynamic branches
pub mod branching;

/// Pause declarations and pause state
pub mod pause;

/// Repository interfaces
pub mod repository;
