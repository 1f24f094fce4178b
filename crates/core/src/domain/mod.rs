pub mod agent;
pub mod checkpoint;
pub mod log;
pub mod message;
pub mod models;
pub mod queue;
pub mod requests;
pub mod thread;
