//! Commands for the Client Management context.

use synergy_core::command::Command;
use uuid::Uuid;

use super::events::{ClientProfile, ClientType};

/// Command to onboard a new client.
#[derive(Debug, Clone)]
pub struct CreateClient {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The client identifier chosen by the caller.
    pub client_id: Uuid,
    /// Client display name.
    pub name: String,
    /// Client segment.
    pub client_type: ClientType,
    /// Primary contact email.
    pub contact_email: String,
    /// Initial profile. Defaults to the standard profile.
    pub profile: Option<ClientProfile>,
    /// Where the client came from.
    pub acquisition_source: Option<String>,
}

/// Command to replace a client's profile.
#[derive(Debug, Clone)]
pub struct UpdateProfile {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The client identifier.
    pub client_id: Uuid,
    /// The new profile.
    pub profile: ClientProfile,
}

/// Command to assign an account manager.
#[derive(Debug, Clone)]
pub struct AssignAccountManager {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The client identifier.
    pub client_id: Uuid,
    /// The account manager.
    pub manager_id: String,
}

/// Command to set the lead score.
#[derive(Debug, Clone)]
pub struct UpdateLeadScore {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The client identifier.
    pub client_id: Uuid,
    /// The new score, validated against 0..=100.
    pub score: i32,
}

/// Command to attach a tag.
#[derive(Debug, Clone)]
pub struct AddTag {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The client identifier.
    pub client_id: Uuid,
    /// The tag.
    pub tag: String,
}

/// Command to detach a tag.
#[derive(Debug, Clone)]
pub struct RemoveTag {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The client identifier.
    pub client_id: Uuid,
    /// The tag.
    pub tag: String,
}

/// Command to deactivate a client.
#[derive(Debug, Clone)]
pub struct DeactivateClient {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The client identifier.
    pub client_id: Uuid,
    /// Why the client is deactivated.
    pub reason: String,
}

impl Command for CreateClient {
    fn command_type(&self) -> &'static str {
        "CreateClient"
    }

    fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }
}

impl Command for UpdateProfile {
    fn command_type(&self) -> &'static str {
        "UpdateProfile"
    }

    fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }
}

impl Command for AssignAccountManager {
    fn command_type(&self) -> &'static str {
        "AssignAccountManager"
    }

    fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }
}

impl Command for UpdateLeadScore {
    fn command_type(&self) -> &'static str {
        "UpdateLeadScore"
    }

    fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }
}

impl Command for AddTag {
    fn command_type(&self) -> &'static str {
        "AddTag"
    }

    fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }
}

impl Command for RemoveTag {
    fn command_type(&self) -> &'static str {
        "RemoveTag"
    }

    fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }
}

impl Command for DeactivateClient {
    fn command_type(&self) -> &'static str {
        "DeactivateClient"
    }

    fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }
}
