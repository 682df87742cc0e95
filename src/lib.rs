pub mod batch_writer;
pub mod block_phase;
pub mod chain;
pub mod claim_phase;
pub mod config;
pub mod constants;
pub mod db;
pub mod events;
pub mod parser;
pub mod progress;
pub mod queries;
pub mod support_phase;
pub mod sync;
pub mod telemetry;
pub mod types;

#[cfg(test)]
mod batch_writer_tests;
#[cfg(test)]
mod sync_tests;
