//! Aggregate roots for the Client Management context.

use serde::{Deserialize, Serialize};
use synergy_core::aggregate::{Aggregate, AggregateRoot};
use synergy_core::clock::Clock;
use synergy_core::error::DomainError;
use synergy_core::event::EventMetadata;
use uuid::Uuid;

use super::events::{
    AccountManagerAssigned, ClientCreated, ClientDeactivated, ClientEvent, ClientProfile,
    ClientType, LeadScoreUpdated, ProfileUpdated, TagAdded, TagRemoved,
};

/// Lead score at or above which a client counts as high value.
pub const HIGH_VALUE_LEAD_SCORE: u8 = 80;

/// Snapshot state of a [`Client`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientState {
    /// Client display name.
    pub name: String,
    /// Client segment. `None` until created.
    pub client_type: Option<ClientType>,
    /// Primary contact email.
    pub contact_email: String,
    /// Current profile.
    pub profile: ClientProfile,
    /// Where the client came from.
    pub acquisition_source: Option<String>,
    /// Assigned account manager.
    pub account_manager_id: Option<String>,
    /// Lead score (0..=100).
    pub lead_score: Option<u8>,
    /// Tags in insertion order, without duplicates.
    pub tags: Vec<String>,
    /// Whether the client is active.
    pub is_active: bool,
    /// Reason given on deactivation.
    pub deactivation_reason: Option<String>,
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            name: String::new(),
            client_type: None,
            contact_email: String::new(),
            profile: ClientProfile::standard(),
            acquisition_source: None,
            account_manager_id: None,
            lead_score: None,
            tags: Vec::new(),
            is_active: true,
            deactivation_reason: None,
        }
    }
}

/// The aggregate root for a client.
#[derive(Debug, Clone)]
pub struct Client {
    root: AggregateRoot<ClientEvent>,
    state: ClientState,
}

impl Client {
    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> &ClientState {
        &self.state
    }

    /// Whether the lead score marks this client as high value.
    #[must_use]
    pub fn is_high_value(&self) -> bool {
        self.state
            .lead_score
            .is_some_and(|score| score >= HIGH_VALUE_LEAD_SCORE)
    }

    /// Whether the client must meet the given compliance standard.
    #[must_use]
    pub fn requires_compliance(&self, standard: &str) -> bool {
        self.state
            .profile
            .compliance_requirements
            .iter()
            .any(|s| s == standard)
    }

    /// Onboards the client, producing a `ClientCreated` event.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the client already exists.
    pub fn create(
        &mut self,
        created: ClientCreated,
        metadata: &EventMetadata,
        clock: &dyn Clock,
    ) -> Result<(), DomainError> {
        if self.version() > 0 {
            return Err(DomainError::Validation(format!(
                "client {} already exists",
                self.aggregate_id()
            )));
        }
        self.raise(ClientEvent::ClientCreated(created), metadata.clone(), clock)
    }

    /// Replaces the profile, producing a `ProfileUpdated` event.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::AggregateTerminated` if the client is deactivated.
    pub fn update_profile(
        &mut self,
        profile: ClientProfile,
        metadata: &EventMetadata,
        clock: &dyn Clock,
    ) -> Result<(), DomainError> {
        self.ensure_active()?;
        self.raise(
            ClientEvent::ProfileUpdated(ProfileUpdated { profile }),
            metadata.clone(),
            clock,
        )
    }

    /// Assigns an account manager. Reassigning the current manager is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::AggregateTerminated` if the client is deactivated.
    pub fn assign_account_manager(
        &mut self,
        manager_id: &str,
        metadata: &EventMetadata,
        clock: &dyn Clock,
    ) -> Result<(), DomainError> {
        self.ensure_active()?;
        if self.state.account_manager_id.as_deref() == Some(manager_id) {
            return Ok(());
        }
        self.raise(
            ClientEvent::AccountManagerAssigned(AccountManagerAssigned {
                manager_id: manager_id.to_owned(),
                previous_manager_id: self.state.account_manager_id.clone(),
            }),
            metadata.clone(),
            clock,
        )
    }

    /// Sets the lead score.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the score is outside 0..=100 and
    /// `DomainError::AggregateTerminated` if the client is deactivated.
    pub fn update_lead_score(
        &mut self,
        score: i32,
        metadata: &EventMetadata,
        clock: &dyn Clock,
    ) -> Result<(), DomainError> {
        self.ensure_active()?;
        let score = u8::try_from(score)
            .ok()
            .filter(|s| *s <= 100)
            .ok_or_else(|| {
                DomainError::Validation(format!("lead score must be between 0 and 100, got {score}"))
            })?;
        self.raise(
            ClientEvent::LeadScoreUpdated(LeadScoreUpdated {
                score,
                previous_score: self.state.lead_score,
            }),
            metadata.clone(),
            clock,
        )
    }

    /// Attaches a tag. Adding a tag the client already has is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::AggregateTerminated` if the client is deactivated.
    pub fn add_tag(
        &mut self,
        tag: &str,
        metadata: &EventMetadata,
        clock: &dyn Clock,
    ) -> Result<(), DomainError> {
        self.ensure_active()?;
        if self.state.tags.iter().any(|t| t == tag) {
            return Ok(());
        }
        self.raise(
            ClientEvent::TagAdded(TagAdded {
                tag: tag.to_owned(),
            }),
            metadata.clone(),
            clock,
        )
    }

    /// Detaches a tag. Removing a tag the client does not have is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::AggregateTerminated` if the client is deactivated.
    pub fn remove_tag(
        &mut self,
        tag: &str,
        metadata: &EventMetadata,
        clock: &dyn Clock,
    ) -> Result<(), DomainError> {
        self.ensure_active()?;
        if !self.state.tags.iter().any(|t| t == tag) {
            return Ok(());
        }
        self.raise(
            ClientEvent::TagRemoved(TagRemoved {
                tag: tag.to_owned(),
            }),
            metadata.clone(),
            clock,
        )
    }

    /// Deactivates the client. No further commands are accepted afterwards.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::AggregateTerminated` if already deactivated.
    pub fn deactivate(
        &mut self,
        reason: &str,
        metadata: &EventMetadata,
        clock: &dyn Clock,
    ) -> Result<(), DomainError> {
        self.ensure_active()?;
        self.raise(
            ClientEvent::ClientDeactivated(ClientDeactivated {
                reason: reason.to_owned(),
            }),
            metadata.clone(),
            clock,
        )
    }
}

impl Aggregate for Client {
    type Event = ClientEvent;
    type State = ClientState;

    const AGGREGATE_TYPE: &'static str = "client";

    fn new(id: Uuid) -> Self {
        Self {
            root: AggregateRoot::new(id),
            state: ClientState::default(),
        }
    }

    fn from_snapshot(id: Uuid, version: i64, state: ClientState) -> Self {
        Self {
            root: AggregateRoot::at_version(id, version),
            state,
        }
    }

    fn snapshot_state(&self) -> ClientState {
        self.state.clone()
    }

    fn root(&self) -> &AggregateRoot<ClientEvent> {
        &self.root
    }

    fn root_mut(&mut self) -> &mut AggregateRoot<ClientEvent> {
        &mut self.root
    }

    fn when(&mut self, event: &ClientEvent) {
        let state = &mut self.state;
        match event {
            ClientEvent::ClientCreated(e) => {
                state.name.clone_from(&e.name);
                state.client_type = Some(e.client_type);
                state.contact_email.clone_from(&e.contact_email);
                state.profile = e.profile.clone();
                state.acquisition_source.clone_from(&e.acquisition_source);
            }
            ClientEvent::ProfileUpdated(e) => state.profile = e.profile.clone(),
            ClientEvent::AccountManagerAssigned(e) => {
                state.account_manager_id = Some(e.manager_id.clone());
            }
            ClientEvent::LeadScoreUpdated(e) => state.lead_score = Some(e.score),
            ClientEvent::TagAdded(e) => {
                if !state.tags.contains(&e.tag) {
                    state.tags.push(e.tag.clone());
                }
            }
            ClientEvent::TagRemoved(e) => state.tags.retain(|t| t != &e.tag),
            ClientEvent::ClientDeactivated(e) => {
                state.is_active = false;
                state.deactivation_reason = Some(e.reason.clone());
            }
        }
    }

    fn is_terminal(&self) -> bool {
        !self.state.is_active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use synergy_test_support::FixedClock;

    fn clock() -> FixedClock {
        FixedClock(Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap())
    }

    fn metadata() -> EventMetadata {
        EventMetadata::new("client-management").with_correlation_id(Uuid::new_v4())
    }

    fn created_client() -> Client {
        let mut client = Client::new(Uuid::new_v4());
        client
            .create(
                ClientCreated {
                    name: "Acme Corp".to_owned(),
                    client_type: ClientType::Enterprise,
                    contact_email: "ops@acme.test".to_owned(),
                    profile: ClientProfile::standard(),
                    acquisition_source: Some("referral".to_owned()),
                },
                &metadata(),
                &clock(),
            )
            .unwrap();
        client
    }

    #[test]
    fn test_create_produces_client_created_event() {
        // Arrange
        let clock = clock();

        // Act
        let client = created_client();

        // Assert
        assert_eq!(client.version(), 1);
        assert_eq!(client.state().name, "Acme Corp");
        assert_eq!(client.state().client_type, Some(ClientType::Enterprise));
        assert!(client.state().is_active);
        let events = client.uncommitted_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), "ClientCreated");
        assert_eq!(events[0].occurred_at, clock.0);
        assert_eq!(events[0].metadata.source, "client-management");
    }

    #[test]
    fn test_create_twice_is_rejected() {
        // Arrange
        let mut client = created_client();
        let again = ClientCreated {
            name: "Other".to_owned(),
            client_type: ClientType::Smb,
            contact_email: "x@y.test".to_owned(),
            profile: ClientProfile::standard(),
            acquisition_source: None,
        };

        // Act
        let result = client.create(again, &metadata(), &clock());

        // Assert
        assert!(matches!(result, Err(DomainError::Validation(_))));
        assert_eq!(client.version(), 1);
    }

    #[test]
    fn test_lead_score_out_of_range_is_rejected() {
        // Arrange
        let mut client = created_client();

        // Act
        let too_high = client.update_lead_score(101, &metadata(), &clock());
        let negative = client.update_lead_score(-1, &metadata(), &clock());

        // Assert
        match too_high.unwrap_err() {
            DomainError::Validation(msg) => {
                assert_eq!(msg, "lead score must be between 0 and 100, got 101");
            }
            other => panic!("expected Validation, got {other:?}"),
        }
        assert!(matches!(negative, Err(DomainError::Validation(_))));
        assert_eq!(client.version(), 1);
    }

    #[test]
    fn test_lead_score_records_previous_and_marks_high_value() {
        // Arrange
        let mut client = created_client();

        // Act
        client.update_lead_score(40, &metadata(), &clock()).unwrap();
        client.update_lead_score(85, &metadata(), &clock()).unwrap();

        // Assert
        assert!(client.is_high_value());
        let last = client.uncommitted_events().last().unwrap();
        assert_eq!(
            last.payload,
            ClientEvent::LeadScoreUpdated(LeadScoreUpdated {
                score: 85,
                previous_score: Some(40),
            })
        );
    }

    #[test]
    fn test_tags_are_deduplicated_and_removal_of_missing_tag_is_noop() {
        // Arrange
        let mut client = created_client();

        // Act
        client.add_tag("vip", &metadata(), &clock()).unwrap();
        client.add_tag("vip", &metadata(), &clock()).unwrap();
        client.remove_tag("churn-risk", &metadata(), &clock()).unwrap();
        client.add_tag("gpu", &metadata(), &clock()).unwrap();
        client.remove_tag("vip", &metadata(), &clock()).unwrap();

        // Assert
        assert_eq!(client.state().tags, vec!["gpu".to_owned()]);
        assert_eq!(client.version(), 4);
    }

    #[test]
    fn test_reassigning_same_manager_raises_nothing() {
        // Arrange
        let mut client = created_client();
        client
            .assign_account_manager("am-7", &metadata(), &clock())
            .unwrap();

        // Act
        client
            .assign_account_manager("am-7", &metadata(), &clock())
            .unwrap();
        client
            .assign_account_manager("am-9", &metadata(), &clock())
            .unwrap();

        // Assert
        assert_eq!(client.version(), 3);
        assert_eq!(client.state().account_manager_id.as_deref(), Some("am-9"));
        assert_eq!(
            client.uncommitted_events()[2].payload,
            ClientEvent::AccountManagerAssigned(AccountManagerAssigned {
                manager_id: "am-9".to_owned(),
                previous_manager_id: Some("am-7".to_owned()),
            })
        );
    }

    #[test]
    fn test_deactivated_client_rejects_commands() {
        // Arrange
        let mut client = created_client();
        client.deactivate("contract ended", &metadata(), &clock()).unwrap();

        // Act
        let tag = client.add_tag("vip", &metadata(), &clock());
        let again = client.deactivate("twice", &metadata(), &clock());

        // Assert
        assert!(client.is_terminal());
        assert!(matches!(tag, Err(DomainError::AggregateTerminated(_))));
        assert!(matches!(again, Err(DomainError::AggregateTerminated(_))));
        assert_eq!(
            client.state().deactivation_reason.as_deref(),
            Some("contract ended")
        );
        assert_eq!(client.version(), 2);
    }

    #[test]
    fn test_requires_compliance_reads_profile() {
        // Arrange
        let mut client = created_client();
        let profile = ClientProfile {
            compliance_requirements: vec!["HIPAA".to_owned()],
            ..ClientProfile::standard()
        };

        // Act
        client.update_profile(profile, &metadata(), &clock()).unwrap();

        // Assert
        assert!(client.requires_compliance("HIPAA"));
        assert!(!client.requires_compliance("SOC2"));
    }

    #[test]
    fn test_snapshot_state_round_trips_through_from_snapshot() {
        // Arrange
        let mut client = created_client();
        client.add_tag("vip", &metadata(), &clock()).unwrap();

        // Act
        let restored =
            Client::from_snapshot(client.aggregate_id(), client.version(), client.snapshot_state());

        // Assert
        assert_eq!(restored.state(), client.state());
        assert_eq!(restored.version(), 2);
        assert!(restored.uncommitted_events().is_empty());
    }
}
