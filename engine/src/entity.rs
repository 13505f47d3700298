//! The closed set of synchronized entity types.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A synchronized entity type.
///
/// The string form doubles as the remote table name and as the entity segment
/// of every cache key, so it must never change for an existing entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Entity {
    Users,
    Assignments,
    Applications,
}

impl Entity {
    /// Every entity, in a stable order.
    pub const ALL: [Entity; 3] = [Entity::Users, Entity::Assignments, Entity::Applications];

    /// Table / cache segment name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Entity::Users => "users",
            Entity::Assignments => "assignments",
            Entity::Applications => "applications",
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Entity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "users" => Ok(Entity::Users),
            "assignments" => Ok(Entity::Assignments),
            "applications" => Ok(Entity::Applications),
            other => Err(Error::UnknownEntity(other.to_string())),
        }
    }
}
