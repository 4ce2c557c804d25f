//! Library crate for netball-scoreboard: match clock, offline-first game sync and the spectator
//! relay, exposed for the binaries and tests.

pub mod auth;
pub mod clock;
pub mod config;
pub mod dao;
pub mod dto;
pub mod error;
pub mod routes;
pub mod services;
pub mod state;
