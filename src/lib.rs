pub mod api;
pub mod config;
pub mod error;
pub mod node;
pub mod sandbox;
pub mod scheduler;
pub mod service;
pub mod shutdown;
pub mod toolchain;
pub mod worker;
