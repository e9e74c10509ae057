//! Behaviour engine for a cast of chat personas: who answers a message, in
//! what mood, and how each persona drifts over time.

pub mod activity;
pub mod channel;
pub mod config;
pub mod dice;
pub mod engine;
pub mod evolution;
pub mod framework;
pub mod mood;
pub mod persistence;
pub mod persona;
pub mod relationship;
pub mod router;
pub mod server;
pub mod store;
pub mod text;
