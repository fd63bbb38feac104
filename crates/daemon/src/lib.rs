// repomirror-daemon library: adapters, coordinator, dispatcher and runtime.

pub mod config;
pub mod coordinator;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod ingress;
pub mod lock;
pub mod platform;
pub mod retry;
pub mod runtime;
pub mod source;
pub mod storage;
