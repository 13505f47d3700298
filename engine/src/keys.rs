//! Local cache key namespace.
//!
//! These strings are shared with every other process reading the same
//! storage area and must stay bit-exact:
//!
//! - `<entity>_collection`: JSON array of canonical entries
//! - `record_<entity>_<naturalKey>`: one individually-keyed override
//! - `update_marker_<entity>`: `{ naturalKey, updatedAt }` of the last local write

use crate::{Entity, NaturalKey};
use std::fmt;

const COLLECTION_SUFFIX: &str = "_collection";
const OVERRIDE_PREFIX: &str = "record_";
const MARKER_PREFIX: &str = "update_marker_";

/// A parsed cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Collection(Entity),
    Override(Entity, NaturalKey),
    Marker(Entity),
}

impl CacheKey {
    /// Parse a storage key. Keys outside the namespace yield `None`.
    pub fn parse(key: &str) -> Option<Self> {
        if let Some(entity) = key.strip_prefix(MARKER_PREFIX) {
            return entity.parse().ok().map(CacheKey::Marker);
        }

        if let Some(rest) = key.strip_prefix(OVERRIDE_PREFIX) {
            // Entity names never contain '_', natural keys may.
            let (entity, natural_key) = rest.split_once('_')?;
            if natural_key.is_empty() {
                return None;
            }
            let entity = entity.parse().ok()?;
            return Some(CacheKey::Override(entity, NaturalKey::new(natural_key)));
        }

        key.strip_suffix(COLLECTION_SUFFIX)
            .and_then(|entity| entity.parse().ok())
            .map(CacheKey::Collection)
    }

    pub fn entity(&self) -> Entity {
        match self {
            CacheKey::Collection(entity) | CacheKey::Marker(entity) => *entity,
            CacheKey::Override(entity, _) => *entity,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Collection(entity) => write!(f, "{entity}{COLLECTION_SUFFIX}"),
            CacheKey::Override(entity, key) => write!(f, "{OVERRIDE_PREFIX}{entity}_{key}"),
            CacheKey::Marker(entity) => write!(f, "{MARKER_PREFIX}{entity}"),
        }
    }
}

/// `<entity>_collection`
pub fn collection_key(entity: Entity) -> String {
    CacheKey::Collection(entity).to_string()
}

/// `record_<entity>_<naturalKey>`
pub fn override_key(entity: Entity, natural_key: &NaturalKey) -> String {
    CacheKey::Override(entity, natural_key.clone()).to_string()
}

/// `update_marker_<entity>`
pub fn marker_key(entity: Entity) -> String {
    CacheKey::Marker(entity).to_string()
}

/// Prefix shared by every override key of `entity`.
pub fn override_prefix(entity: Entity) -> String {
    format!("{OVERRIDE_PREFIX}{entity}_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_formats() {
        assert_eq!(collection_key(Entity::Users), "users_collection");
        assert_eq!(
            override_key(Entity::Users, &NaturalKey::new("a@b.com")),
            "record_users_a@b.com"
        );
        assert_eq!(marker_key(Entity::Assignments), "update_marker_assignments");
        assert_eq!(override_prefix(Entity::Applications), "record_applications_");
    }

    #[test]
    fn parse_known_keys() {
        assert_eq!(
            CacheKey::parse("applications_collection"),
            Some(CacheKey::Collection(Entity::Applications))
        );
        assert_eq!(
            CacheKey::parse("update_marker_users"),
            Some(CacheKey::Marker(Entity::Users))
        );
        assert_eq!(
            CacheKey::parse("record_users_first_last@b.com"),
            Some(CacheKey::Override(
                Entity::Users,
                NaturalKey::new("first_last@b.com")
            ))
        );
    }

    #[test]
    fn parse_foreign_keys() {
        assert_eq!(CacheKey::parse("theme"), None);
        assert_eq!(CacheKey::parse("courses_collection"), None);
        assert_eq!(CacheKey::parse("record_users_"), None);
        assert_eq!(CacheKey::parse("update_marker_courses"), None);
    }

    #[test]
    fn display_parse_roundtrip() {
        let keys = [
            CacheKey::Collection(Entity::Users),
            CacheKey::Override(Entity::Assignments, NaturalKey::new("42")),
            CacheKey::Marker(Entity::Applications),
        ];
        for key in keys {
            assert_eq!(CacheKey::parse(&key.to_string()), Some(key.clone()));
            assert_eq!(CacheKey::parse(&key.to_string()).unwrap().entity(), key.entity());
        }
    }
}
