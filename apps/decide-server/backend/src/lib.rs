//! `decide-server` is the application server for the Decide voting platform.
//! It manages users, census, votings and their encrypted votes, and runs the
//! mixnet tally when a voting is closed.
//!
//! Decide uses Postgres as its database server and SQLx to connect to it.

pub mod app;
mod client;
pub mod config;
pub mod db;
pub mod log;
pub mod password;
mod session;
mod state;
pub mod tally;
