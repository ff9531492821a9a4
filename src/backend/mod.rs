pub mod cache;
pub mod download;
pub mod error;
pub mod job;
pub mod mangadex;
pub mod orchestrator;
pub mod settings;
pub mod source;
pub mod source_behavior;
pub mod storage;
pub mod velocity;
