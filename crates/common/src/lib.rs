// repomirror-common: domain types shared by the sync daemon and its tests

pub mod event;
pub mod lock;
pub mod manifest;
pub mod types;
