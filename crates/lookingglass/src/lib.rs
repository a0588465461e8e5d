//! Web gateway that hands each authenticated user an isolated remote
//! desktop container and multiplexes all desktop traffic over one port.

pub mod api;
pub mod auth;
pub mod config;
pub mod container;
pub mod overlay;
pub mod pages;
pub mod session;
