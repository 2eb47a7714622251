//! Explicit shape checks for everything the backend sends us.
//!
//! Decoding only proves the JSON has the right field types. The checks here
//! cover the constraints serde cannot express (non-empty ids, token
//! presence, uuid role ids, protocol version) so callers get one tagged
//! result per payload.

use serde::de::DeserializeOwned;
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::{
    CreateChannelResponse, CreateMessageResponse, GetMessagesResponse, GetServerResponse,
    GetServersResponse, Invitation, JoinServerResponse, LoginRequest, Membership,
    MessageDeletedPayload, Message, NewServerRequest, NewServerResponse, PushEnvelope, PushEvent,
    PushEventType, RegisterRequest, TokenPair, WS_VERSION,
};

pub const SERVER_NAME_MAX_CHARS: usize = 256;
pub const PASSWORD_MIN_CHARS: usize = 8;
pub const PASSWORD_MAX_CHARS: usize = 72;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("field `{field}` {reason}")]
    Field { field: &'static str, reason: String },
    #[error("unsupported push protocol version {found} (max {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },
    #[error("unexpected push event type {0:?}")]
    UnexpectedEvent(PushEventType),
}

impl ValidationError {
    fn field(field: &'static str, reason: impl Into<String>) -> Self {
        ValidationError::Field {
            field,
            reason: reason.into(),
        }
    }
}

pub trait Validate {
    fn validate(&self) -> Result<(), ValidationError>;
}

/// Decode a JSON body and run its shape checks.
pub fn decode<T>(bytes: &[u8]) -> Result<T, ValidationError>
where
    T: DeserializeOwned + Validate,
{
    let value: T =
        serde_json::from_slice(bytes).map_err(|err| ValidationError::Malformed(err.to_string()))?;
    value.validate()?;
    Ok(value)
}

/// Same as [`decode`] for an already-parsed JSON value (push payloads).
pub fn decode_value<T>(value: serde_json::Value) -> Result<T, ValidationError>
where
    T: DeserializeOwned + Validate,
{
    let value: T =
        serde_json::from_value(value).map_err(|err| ValidationError::Malformed(err.to_string()))?;
    value.validate()?;
    Ok(value)
}

/// Decode one push frame into a typed event.
pub fn decode_envelope(text: &str) -> Result<PushEvent, ValidationError> {
    let envelope: PushEnvelope =
        serde_json::from_str(text).map_err(|err| ValidationError::Malformed(err.to_string()))?;
    if envelope.version > WS_VERSION {
        return Err(ValidationError::UnsupportedVersion {
            found: envelope.version,
            supported: WS_VERSION,
        });
    }

    match envelope.event_type {
        PushEventType::Initialized => Ok(PushEvent::Initialized),
        PushEventType::AuthFailed => {
            let reason = match envelope.payload {
                serde_json::Value::String(reason) => reason,
                other => other.to_string(),
            };
            Ok(PushEvent::AuthFailed { reason })
        }
        PushEventType::IncomingMessage => {
            decode_value::<Message>(envelope.payload).map(PushEvent::IncomingMessage)
        }
        PushEventType::MessageUpdated => {
            decode_value::<Message>(envelope.payload).map(PushEvent::MessageUpdated)
        }
        PushEventType::MessageDeleted => {
            decode_value::<MessageDeletedPayload>(envelope.payload).map(PushEvent::MessageDeleted)
        }
        PushEventType::Auth => Err(ValidationError::UnexpectedEvent(PushEventType::Auth)),
    }
}

fn non_empty(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::field(field, "must not be empty"));
    }
    Ok(())
}

impl Validate for Message {
    fn validate(&self) -> Result<(), ValidationError> {
        non_empty("id", self.id.as_str())
    }
}

impl Validate for GetMessagesResponse {
    fn validate(&self) -> Result<(), ValidationError> {
        self.result.iter().try_for_each(Validate::validate)
    }
}

impl Validate for CreateMessageResponse {
    fn validate(&self) -> Result<(), ValidationError> {
        non_empty("id", self.id.as_str())
    }
}

impl Validate for MessageDeletedPayload {
    fn validate(&self) -> Result<(), ValidationError> {
        non_empty("id", self.id.as_str())
    }
}

impl Validate for GetServersResponse {
    fn validate(&self) -> Result<(), ValidationError> {
        for server in &self.result {
            non_empty("result[].id", server.id.as_str())?;
        }
        Ok(())
    }
}

impl Validate for Membership {
    fn validate(&self) -> Result<(), ValidationError> {
        for role in self.assigned_roles.iter().flatten() {
            if Uuid::parse_str(role).is_err() {
                return Err(ValidationError::field(
                    "assignedRoles",
                    format!("contains non-uuid role id {role:?}"),
                ));
            }
        }
        Ok(())
    }
}

impl Validate for GetServerResponse {
    fn validate(&self) -> Result<(), ValidationError> {
        non_empty("id", self.id.as_str())?;
        if let Some(membership) = &self.self_membership {
            membership.validate()?;
        }
        Ok(())
    }
}

impl Validate for NewServerResponse {
    fn validate(&self) -> Result<(), ValidationError> {
        non_empty("id", self.id.as_str())
    }
}

impl Validate for CreateChannelResponse {
    fn validate(&self) -> Result<(), ValidationError> {
        non_empty("id", self.id.as_str())?;
        if self.order < 0 {
            return Err(ValidationError::field("order", "must be >= 0"));
        }
        Ok(())
    }
}

impl Validate for Invitation {
    fn validate(&self) -> Result<(), ValidationError> {
        non_empty("id", self.id.as_str())
    }
}

impl Validate for JoinServerResponse {
    fn validate(&self) -> Result<(), ValidationError> {
        self.membership.validate()?;
        non_empty("server.id", self.server.id.as_str())
    }
}

impl Validate for TokenPair {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.access_token.is_empty() {
            return Err(ValidationError::field(
                "accessToken",
                "server didn't return an access token",
            ));
        }
        if self.refresh_token.is_empty() {
            return Err(ValidationError::field(
                "refreshToken",
                "server didn't return a refresh token",
            ));
        }
        Ok(())
    }
}

impl Validate for LoginRequest {
    fn validate(&self) -> Result<(), ValidationError> {
        non_empty("username", &self.username)?;
        if self.password.is_empty() {
            return Err(ValidationError::field("password", "must not be empty"));
        }
        Ok(())
    }
}

impl Validate for RegisterRequest {
    fn validate(&self) -> Result<(), ValidationError> {
        non_empty("username", &self.username)?;
        if !self.email.contains('@') {
            return Err(ValidationError::field("email", "must be an email address"));
        }
        let len = self.password.chars().count();
        if !(PASSWORD_MIN_CHARS..=PASSWORD_MAX_CHARS).contains(&len) {
            return Err(ValidationError::field(
                "password",
                format!("must be {PASSWORD_MIN_CHARS}..={PASSWORD_MAX_CHARS} characters"),
            ));
        }
        Ok(())
    }
}

impl Validate for NewServerRequest {
    fn validate(&self) -> Result<(), ValidationError> {
        let len = self.name.chars().count();
        if len == 0 {
            return Err(ValidationError::field("name", "Server name cannot be empty"));
        }
        if len > SERVER_NAME_MAX_CHARS {
            return Err(ValidationError::field(
                "name",
                format!("Server name must be at most {SERVER_NAME_MAX_CHARS} characters"),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/validation_tests.rs"]
mod tests;
