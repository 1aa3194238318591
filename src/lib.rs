pub mod blob;
pub mod cert;
pub mod client;
pub mod codec;
pub mod config;
pub mod constants;
pub mod domain;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod scheduler;
pub mod storage;
pub mod sync;
