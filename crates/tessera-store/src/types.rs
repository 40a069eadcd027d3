use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of one physical shard of an entity type, in `[0, shard_count)`
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(u32);

impl ShardId {
    /// Creates a new ShardId from a raw u32 value
    pub fn new(id: u32) -> Self {
        ShardId(id)
    }

    /// Returns the raw u32 value of this shard ID
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Returns the shard ID as a slice index
    pub fn as_index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one immutable, fully written index snapshot.
///
/// Generations only ever increase. `Generation::ZERO` means nothing has been
/// published yet; the first published generation is 1.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Generation(u64);

impl Generation {
    /// No generation published
    pub const ZERO: Generation = Generation(0);

    /// Creates a new Generation from a raw u64 value
    pub fn new(g: u64) -> Self {
        Generation(g)
    }

    /// Returns the raw u64 value of this generation
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the generation that follows this one, or `None` once the
    /// numbering is exhausted
    pub fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(Generation)
    }

    /// Whether anything has been published at this generation
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of an indexed entity type (e.g. `"Animal"`)
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityType(String);

impl EntityType {
    /// Creates a new EntityType
    pub fn new(name: impl Into<String>) -> Self {
        EntityType(name.into())
    }

    /// Returns the entity type name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityType {
    fn from(s: &str) -> Self {
        EntityType(s.to_string())
    }
}

impl From<String> for EntityType {
    fn from(s: String) -> Self {
        EntityType(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_next() {
        assert_eq!(Generation::ZERO.next(), Some(Generation::new(1)));
        assert_eq!(Generation::new(u64::MAX).next(), None);
        assert!(Generation::ZERO.is_zero());
        assert!(!Generation::new(3).is_zero());
        assert!(Generation::new(2) > Generation::new(1));
    }

    #[test]
    fn test_entity_type_serde_transparent() {
        let entity = EntityType::new("Animal");
        let json = serde_json::to_string(&entity).unwrap();
        assert_eq!(json, "\"Animal\"");
        let decoded: EntityType = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, entity);
    }

    #[test]
    fn test_display() {
        assert_eq!(ShardId::new(7).to_string(), "7");
        assert_eq!(Generation::new(42).to_string(), "42");
        assert_eq!(EntityType::from("Furniture").to_string(), "Furniture");
    }
}
