//! Synergy Client Management bounded context.
//!
//! Responsible for client onboarding, profiles, account manager
//! assignment, lead scoring, tagging, and deactivation.

pub mod application {
    pub mod command_handlers;
    pub mod query_handlers;
}

pub mod domain {
    pub mod aggregates;
    pub mod commands;
    pub mod events;
}
