//! Synergy core: event sourcing contracts.
//!
//! This crate defines the aggregate contract, the event and snapshot store
//! traits, and the generic repository that composes them. It contains no
//! storage or broker code; backends live in `synergy-event-store` and
//! `synergy-event-bus`.

pub mod aggregate;
pub mod clock;
pub mod command;
pub mod error;
pub mod event;
pub mod event_store;
pub mod repository;
pub mod snapshot;
