//! Domain events for the Client Management context.

use serde::{Deserialize, Serialize};
use synergy_core::error::DomainError;
use synergy_core::event::{AggregateEvent, decode_payload, encode_payload};

/// Client segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientType {
    /// Small and medium business.
    #[serde(rename = "SMB")]
    Smb,
    /// Enterprise account.
    Enterprise,
    /// University or research institution.
    University,
    /// Colocation customer.
    Colocation,
}

/// Descriptive client profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientProfile {
    /// Industry the client operates in.
    pub industry: Option<String>,
    /// Company size bracket.
    pub company_size: Option<String>,
    /// Compliance standards the client must meet.
    #[serde(default)]
    pub compliance_requirements: Vec<String>,
    /// Preferred communication channel.
    pub preferred_communication: String,
    /// IANA timezone name.
    pub timezone: String,
}

impl ClientProfile {
    /// Profile with the defaults used for new clients.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            preferred_communication: "email".to_owned(),
            timezone: "UTC".to_owned(),
            ..Self::default()
        }
    }
}

/// Emitted when a client is onboarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCreated {
    /// Client display name.
    pub name: String,
    /// Client segment.
    pub client_type: ClientType,
    /// Primary contact email.
    pub contact_email: String,
    /// Initial profile.
    pub profile: ClientProfile,
    /// Where the client came from.
    pub acquisition_source: Option<String>,
}

/// Emitted when the profile is replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdated {
    /// The new profile.
    pub profile: ClientProfile,
}

/// Emitted when an account manager takes over the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountManagerAssigned {
    /// The new account manager.
    pub manager_id: String,
    /// The account manager being replaced, if any.
    pub previous_manager_id: Option<String>,
}

/// Emitted when the lead score changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadScoreUpdated {
    /// The new score (0..=100).
    pub score: u8,
    /// The previous score, if any.
    pub previous_score: Option<u8>,
}

/// Emitted when a tag is attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagAdded {
    /// The tag.
    pub tag: String,
}

/// Emitted when a tag is detached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRemoved {
    /// The tag.
    pub tag: String,
}

/// Emitted when a client is deactivated. Terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDeactivated {
    /// Why the client was deactivated.
    pub reason: String,
}

/// Event payload variants for the Client Management context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A client has been created.
    ClientCreated(ClientCreated),
    /// The client profile has been replaced.
    ProfileUpdated(ProfileUpdated),
    /// An account manager has been assigned.
    AccountManagerAssigned(AccountManagerAssigned),
    /// The lead score has changed.
    LeadScoreUpdated(LeadScoreUpdated),
    /// A tag has been added.
    TagAdded(TagAdded),
    /// A tag has been removed.
    TagRemoved(TagRemoved),
    /// The client has been deactivated.
    ClientDeactivated(ClientDeactivated),
}

impl AggregateEvent for ClientEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::ClientCreated(_) => "ClientCreated",
            Self::ProfileUpdated(_) => "ProfileUpdated",
            Self::AccountManagerAssigned(_) => "AccountManagerAssigned",
            Self::LeadScoreUpdated(_) => "LeadScoreUpdated",
            Self::TagAdded(_) => "TagAdded",
            Self::TagRemoved(_) => "TagRemoved",
            Self::ClientDeactivated(_) => "ClientDeactivated",
        }
    }

    fn encode(&self) -> Result<serde_json::Value, DomainError> {
        match self {
            Self::ClientCreated(e) => encode_payload(e),
            Self::ProfileUpdated(e) => encode_payload(e),
            Self::AccountManagerAssigned(e) => encode_payload(e),
            Self::LeadScoreUpdated(e) => encode_payload(e),
            Self::TagAdded(e) => encode_payload(e),
            Self::TagRemoved(e) => encode_payload(e),
            Self::ClientDeactivated(e) => encode_payload(e),
        }
    }

    fn decode(event_type: &str, payload: serde_json::Value) -> Result<Self, DomainError> {
        Ok(match event_type {
            "ClientCreated" => Self::ClientCreated(decode_payload(event_type, payload)?),
            "ProfileUpdated" => Self::ProfileUpdated(decode_payload(event_type, payload)?),
            "AccountManagerAssigned" => {
                Self::AccountManagerAssigned(decode_payload(event_type, payload)?)
            }
            "LeadScoreUpdated" => Self::LeadScoreUpdated(decode_payload(event_type, payload)?),
            "TagAdded" => Self::TagAdded(decode_payload(event_type, payload)?),
            "TagRemoved" => Self::TagRemoved(decode_payload(event_type, payload)?),
            "ClientDeactivated" => Self::ClientDeactivated(decode_payload(event_type, payload)?),
            other => return Err(DomainError::UnknownEventType(other.to_owned())),
        })
    }
}
