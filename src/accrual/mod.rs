pub mod client;
pub mod processor;
pub mod scheduler;
