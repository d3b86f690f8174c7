pub mod message;
pub mod serialized;
