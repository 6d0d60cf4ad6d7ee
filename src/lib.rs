mod application;
pub mod config;
mod domain;
mod infrastructure;

pub use application::{orchestrator, registry, schema, session, supervisor};
pub use domain::types;
pub use infrastructure::model;
