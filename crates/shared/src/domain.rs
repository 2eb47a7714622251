use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ServerId);
id_newtype!(ChannelId);
id_newtype!(GroupId);
id_newtype!(MessageId);
id_newtype!(RoleId);
id_newtype!(InvitationId);

/// Who produced a message. Unrecognised tags are kept as `Unknown` so a new
/// author kind on the backend never fails decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorType {
    User,
    System,
    Bot,
    #[serde(other)]
    Unknown,
}

/// The conversation a message belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetId {
    Channel(ChannelId),
    Group(GroupId),
}

impl TargetId {
    pub fn is_channel(&self) -> bool {
        matches!(self, TargetId::Channel(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            TargetId::Channel(id) => id.as_str(),
            TargetId::Group(id) => id.as_str(),
        }
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetId::Channel(id) => write!(f, "channel:{id}"),
            TargetId::Group(id) => write!(f, "group:{id}"),
        }
    }
}

impl From<ChannelId> for TargetId {
    fn from(value: ChannelId) -> Self {
        TargetId::Channel(value)
    }
}

impl From<GroupId> for TargetId {
    fn from(value: GroupId) -> Self {
        TargetId::Group(value)
    }
}
