//! A beanstalkd-compatible work queue whose jobs survive restarts through a
//! rotating write-ahead log.
pub mod broker;
pub mod config;
pub mod error;
pub mod heap;
pub mod line_reader;
pub mod parser;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod time;
pub mod tube;
pub mod types;
pub mod util;
pub mod wal;
