//! Runner launcher - registers with a task broker on behalf of a task runner,
//! launches the runner on demand, and supervises it.

pub mod broker;
pub mod cancel;
pub mod commands;
pub mod config;
pub mod env;
pub mod error;
pub mod handshake;
pub mod health;
pub mod launcher;
pub mod retry;
pub mod subprocess;
pub mod telemetry;

#[cfg(test)]
mod testing;
