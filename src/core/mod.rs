// Core modules shared by every backend and consumer.
pub mod error;
