pub mod builder;
pub mod config;
pub mod deps;
pub mod destination;
pub mod discover;
pub mod layer;
pub mod orchestrator;
pub mod process;
pub mod retry;

pub mod cli;

#[cfg(test)]
mod testing;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;
