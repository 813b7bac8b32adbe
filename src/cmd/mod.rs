//! Client-side subcommands. Everything here talks to a running server.

pub mod client;
pub mod registrations;
pub mod transfer;
