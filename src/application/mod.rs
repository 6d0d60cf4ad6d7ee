pub mod orchestrator;
pub mod registry;
pub mod schema;
pub mod session;
pub mod supervisor;
