pub mod ack_buffer;
pub mod dispatcher;
pub mod inbox;
pub mod index_table;
