pub mod config;
pub mod context;
pub mod hierarchy;
pub mod location;
pub mod node_id;
pub mod service;
