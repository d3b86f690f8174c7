pub mod delivery;
pub mod error;
pub mod local_channel;
pub mod net_input;
pub mod net_output;
