//! This module contains utilities that are useful for testing code based on network channels.
//!  They are used for testing the crate itself, but they are also exported for application
//!  testing.

pub mod node;
