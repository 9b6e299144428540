use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Ordered access levels. Comparisons follow declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum AccessLevel {
    #[default]
    None,
    Public,
    Connected,
    Read,
    Share,
    Update,
    Delete,
    Script,
    System,
}

impl AccessLevel {
    /// Lowest grantable level.
    pub const MIN: AccessLevel = AccessLevel::Public;
    pub const MAX: AccessLevel = AccessLevel::System;

    pub fn as_i64(&self) -> i64 {
        match self {
            Self::None => 0,
            Self::Public => 1,
            Self::Connected => 2,
            Self::Read => 4,
            Self::Share => 5,
            Self::Update => 6,
            Self::Delete => 7,
            Self::Script => 8,
            Self::System => 9,
        }
    }

    /// Numeric levels; 3 is a reserved slot and maps to `Connected`.
    pub fn from_i64(value: i64) -> Option<Self> {
        Some(match value {
            0 => Self::None,
            1 => Self::Public,
            2 | 3 => Self::Connected,
            4 => Self::Read,
            5 => Self::Share,
            6 => Self::Update,
            7 => Self::Delete,
            8 => Self::Script,
            9 => Self::System,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Public => "public",
            Self::Connected => "connected",
            Self::Read => "read",
            Self::Share => "share",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Script => "script",
            Self::System => "system",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name.to_ascii_lowercase().as_str() {
            "none" => Self::None,
            "public" | "min" => Self::Public,
            "connected" => Self::Connected,
            "read" => Self::Read,
            "share" => Self::Share,
            "update" => Self::Update,
            "delete" => Self::Delete,
            "script" => Self::Script,
            "system" | "max" => Self::System,
            _ => return None,
        })
    }

    /// Clamp an arbitrary integer into the level range.
    pub fn fix(value: i64) -> Self {
        if value <= 0 {
            Self::None
        } else if value >= Self::MAX.as_i64() {
            Self::MAX
        } else {
            Self::from_i64(value).unwrap_or(Self::None)
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for AccessLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for AccessLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(i64),
            Name(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(Self::fix(n)),
            Raw::Name(name) => Self::from_name(&name)
                .ok_or_else(|| serde::de::Error::custom(format!("unknown access level '{}'", name))),
        }
    }
}
