//! Interactive vocabulary reader: clickable translated words, read-aloud with
//! word highlighting, and a small chat assistant.

pub mod app;
pub mod chat;
pub mod config;
pub mod credentials;
pub mod error;
pub mod ipc;
pub mod read_aloud;
pub mod speech;
pub mod state;
pub mod timing;
pub mod tokens;
pub mod translate;
pub mod vocabulary;

#[cfg(test)]
mod testing;

pub use app::{run_app, ReaderApp};
pub use config::Config;
pub use error::{ReaderError, ReaderResult};
