//! Query handlers for the Client Management context.
//!
//! Reconstitute clients through the repository and return read-only views.

use serde::Serialize;
use synergy_core::aggregate::Aggregate;
use synergy_core::error::DomainError;
use synergy_core::repository::Repository;
use uuid::Uuid;

use crate::domain::aggregates::Client;
use crate::domain::events::{ClientProfile, ClientType};

/// Read-only view of a client aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientView {
    /// The client identifier.
    pub client_id: Uuid,
    /// Client display name.
    pub name: String,
    /// Client segment.
    pub client_type: Option<ClientType>,
    /// Primary contact email.
    pub contact_email: String,
    /// Current profile.
    pub profile: ClientProfile,
    /// Assigned account manager.
    pub account_manager_id: Option<String>,
    /// Lead score.
    pub lead_score: Option<u8>,
    /// Whether the lead score marks the client as high value.
    pub high_value: bool,
    /// Tags.
    pub tags: Vec<String>,
    /// Whether the client is active.
    pub is_active: bool,
    /// Current version (event count).
    pub version: i64,
}

impl From<&Client> for ClientView {
    fn from(client: &Client) -> Self {
        let state = client.state();
        Self {
            client_id: client.aggregate_id(),
            name: state.name.clone(),
            client_type: state.client_type,
            contact_email: state.contact_email.clone(),
            profile: state.profile.clone(),
            account_manager_id: state.account_manager_id.clone(),
            lead_score: state.lead_score,
            high_value: client.is_high_value(),
            tags: state.tags.clone(),
            is_active: state.is_active,
            version: client.version(),
        }
    }
}

/// Retrieves the current view of a client.
///
/// # Errors
///
/// Returns `DomainError::AggregateNotFound` if the client does not exist and
/// propagates decode and storage errors.
pub async fn get_client_by_id(
    client_id: Uuid,
    repo: &Repository<Client>,
) -> Result<ClientView, DomainError> {
    let client = repo.load(client_id).await?;
    Ok(ClientView::from(&client))
}

/// Retrieves a client as it was at `version`.
///
/// # Errors
///
/// Returns `DomainError::AggregateNotFound` if no event at or below
/// `version` exists and propagates decode and storage errors.
pub async fn get_client_at_version(
    client_id: Uuid,
    version: i64,
    repo: &Repository<Client>,
) -> Result<ClientView, DomainError> {
    let client = repo
        .get_by_id_and_version(client_id, version)
        .await?
        .ok_or(DomainError::AggregateNotFound(client_id))?;
    Ok(ClientView::from(&client))
}
