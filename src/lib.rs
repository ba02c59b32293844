pub mod config;
pub mod crypto;
pub mod dr;
pub mod engine;
pub mod error;
pub mod notify;
pub mod pipeline;
pub mod restore;
pub mod state;
pub mod storage;
pub mod workers;

#[cfg(test)]
pub(crate) mod testutil;
