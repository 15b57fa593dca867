//! Chat messages exchanged with backends.

use serde::{Deserialize, Serialize};

use crate::schema::{FieldSchema, ObjectSchema, Schema, Structural};

/// The role of a chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// User input.
    User,
    /// Assistant (model) response.
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

impl Structural for Message {
    fn schema() -> Schema {
        Schema::Object(
            ObjectSchema::new("Message")
                .field(FieldSchema::new(
                    "role",
                    Schema::Enum(vec!["system".into(), "user".into(), "assistant".into()]),
                ))
                .field(FieldSchema::new("content", Schema::String)),
        )
    }

    fn is_message() -> bool {
        true
    }
}
