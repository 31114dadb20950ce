pub mod conn;
pub mod job;
pub mod protocol;
pub mod serialisable;
pub mod states;
