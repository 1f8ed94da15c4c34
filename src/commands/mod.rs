pub mod health;
pub mod sync_stream;
