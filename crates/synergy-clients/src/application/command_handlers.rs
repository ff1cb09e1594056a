//! Command handlers for the Client Management context.
//!
//! This module contains application-level command handler functions that
//! orchestrate domain logic: load aggregate, execute command, persist events.

use synergy_core::aggregate::Aggregate;
use synergy_core::clock::Clock;
use synergy_core::command::Command;
use synergy_core::error::DomainError;
use synergy_core::event_store::StoredEvent;
use synergy_core::repository::Repository;

use crate::domain::aggregates::Client;
use crate::domain::commands::{
    AddTag, AssignAccountManager, CreateClient, DeactivateClient, RemoveTag, UpdateLeadScore,
    UpdateProfile,
};
use crate::domain::events::{ClientCreated, ClientProfile};

/// Component name recorded as the `source` of every client event.
pub const EVENT_SOURCE: &str = "client-management";

fn require_non_empty(value: &str, what: &str) -> Result<(), DomainError> {
    if value.trim().is_empty() {
        return Err(DomainError::Validation(format!("{what} must not be empty")));
    }
    Ok(())
}

/// Handles the `CreateClient` command: creates a fresh aggregate, applies
/// the create domain method, and persists the resulting events.
///
/// # Errors
///
/// Returns `DomainError::Validation` for invalid input or an existing client,
/// and propagates repository errors.
pub async fn handle_create_client(
    command: &CreateClient,
    clock: &dyn Clock,
    repo: &Repository<Client>,
) -> Result<Vec<StoredEvent>, DomainError> {
    require_non_empty(&command.name, "client name")?;
    if !command.contact_email.contains('@') {
        return Err(DomainError::Validation(format!(
            "invalid contact email: {}",
            command.contact_email
        )));
    }

    let mut client = repo
        .get_by_id(command.client_id)
        .await?
        .unwrap_or_else(|| Client::new(command.client_id));

    client.create(
        ClientCreated {
            name: command.name.trim().to_owned(),
            client_type: command.client_type,
            contact_email: command.contact_email.clone(),
            profile: command
                .profile
                .clone()
                .unwrap_or_else(ClientProfile::standard),
            acquisition_source: command.acquisition_source.clone(),
        },
        &command.event_metadata(EVENT_SOURCE),
        clock,
    )?;

    let stored = repo.save(&mut client).await?;
    tracing::info!(client_id = %command.client_id, "Client created");
    Ok(stored)
}

/// Handles the `UpdateProfile` command.
///
/// # Errors
///
/// Returns `DomainError::AggregateNotFound` for unknown clients,
/// `DomainError::AggregateTerminated` for deactivated ones, and propagates
/// repository errors.
pub async fn handle_update_profile(
    command: &UpdateProfile,
    clock: &dyn Clock,
    repo: &Repository<Client>,
) -> Result<Vec<StoredEvent>, DomainError> {
    let mut client = repo.load(command.client_id).await?;
    client.update_profile(
        command.profile.clone(),
        &command.event_metadata(EVENT_SOURCE),
        clock,
    )?;
    repo.save(&mut client).await
}

/// Handles the `AssignAccountManager` command.
///
/// # Errors
///
/// Returns `DomainError::Validation` for an empty manager ID and propagates
/// load, domain, and repository errors.
pub async fn handle_assign_account_manager(
    command: &AssignAccountManager,
    clock: &dyn Clock,
    repo: &Repository<Client>,
) -> Result<Vec<StoredEvent>, DomainError> {
    require_non_empty(&command.manager_id, "account manager id")?;

    let mut client = repo.load(command.client_id).await?;
    client.assign_account_manager(
        &command.manager_id,
        &command.event_metadata(EVENT_SOURCE),
        clock,
    )?;
    repo.save(&mut client).await
}

/// Handles the `UpdateLeadScore` command.
///
/// # Errors
///
/// Returns `DomainError::Validation` for scores outside 0..=100 and
/// propagates load, domain, and repository errors.
pub async fn handle_update_lead_score(
    command: &UpdateLeadScore,
    clock: &dyn Clock,
    repo: &Repository<Client>,
) -> Result<Vec<StoredEvent>, DomainError> {
    let mut client = repo.load(command.client_id).await?;
    client.update_lead_score(command.score, &command.event_metadata(EVENT_SOURCE), clock)?;
    repo.save(&mut client).await
}

/// Handles the `AddTag` command.
///
/// # Errors
///
/// Returns `DomainError::Validation` for an empty tag and propagates load,
/// domain, and repository errors.
pub async fn handle_add_tag(
    command: &AddTag,
    clock: &dyn Clock,
    repo: &Repository<Client>,
) -> Result<Vec<StoredEvent>, DomainError> {
    require_non_empty(&command.tag, "tag")?;

    let mut client = repo.load(command.client_id).await?;
    client.add_tag(command.tag.trim(), &command.event_metadata(EVENT_SOURCE), clock)?;
    repo.save(&mut client).await
}

/// Handles the `RemoveTag` command.
///
/// # Errors
///
/// Returns `DomainError::Validation` for an empty tag and propagates load,
/// domain, and repository errors.
pub async fn handle_remove_tag(
    command: &RemoveTag,
    clock: &dyn Clock,
    repo: &Repository<Client>,
) -> Result<Vec<StoredEvent>, DomainError> {
    require_non_empty(&command.tag, "tag")?;

    let mut client = repo.load(command.client_id).await?;
    client.remove_tag(command.tag.trim(), &command.event_metadata(EVENT_SOURCE), clock)?;
    repo.save(&mut client).await
}

/// Handles the `DeactivateClient` command.
///
/// # Errors
///
/// Returns `DomainError::Validation` for an empty reason,
/// `DomainError::AggregateTerminated` if already deactivated, and propagates
/// load and repository errors.
pub async fn handle_deactivate_client(
    command: &DeactivateClient,
    clock: &dyn Clock,
    repo: &Repository<Client>,
) -> Result<Vec<StoredEvent>, DomainError> {
    require_non_empty(&command.reason, "deactivation reason")?;

    let mut client = repo.load(command.client_id).await?;
    client.deactivate(&command.reason, &command.event_metadata(EVENT_SOURCE), clock)?;
    let stored = repo.save(&mut client).await?;
    tracing::info!(client_id = %command.client_id, reason = %command.reason, "Client deactivated");
    Ok(stored)
}
