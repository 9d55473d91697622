pub mod batcher;
pub mod change_tracker;
pub mod orchestrator;
pub mod progress;
pub mod search;
pub mod watcher;
pub mod writer;
