//! Domain entities - the addressable nodes that state changes target.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Operational state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    #[default]
    Normal,
    Warning,
    Emergency,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeState::Normal => "normal",
            NodeState::Warning => "warning",
            NodeState::Emergency => "emergency",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for NodeState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "normal" => Ok(NodeState::Normal),
            "warning" => Ok(NodeState::Warning),
            "emergency" => Ok(NodeState::Emergency),
            _ => Err(format!("Unknown node state: {}", s)),
        }
    }
}

/// 2-D position on the node diagram
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// An addressable node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Unique identifier (e.g. "n1")
    pub id: String,

    /// Human-readable label
    pub label: String,

    /// Diagram position
    pub position: Position,

    /// Current operational state
    pub state: NodeState,
}

impl Entity {
    /// Creates an entity in the `Normal` state.
    pub fn new(id: impl Into<String>, label: impl Into<String>, position: Position) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            position,
            state: NodeState::Normal,
        }
    }
}

/// The entity collection owned by one context.
///
/// Mutated only through applied envelopes, optimistic local changes, and
/// direct position updates.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    entities: BTreeMap<String, Entity>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from a snapshot list. Later duplicates win.
    pub fn from_entities(entities: impl IntoIterator<Item = Entity>) -> Self {
        let entities = entities.into_iter().map(|e| (e.id.clone(), e)).collect();
        Self { entities }
    }

    /// Inserts or replaces an entity.
    pub fn upsert(&mut self, entity: Entity) {
        self.entities.insert(entity.id.clone(), entity);
    }

    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.entities.get(id)
    }

    /// Sets the state of an existing entity.
    ///
    /// Returns `false` (and changes nothing) when the entity is unknown.
    pub fn apply_state(&mut self, id: &str, state: NodeState) -> bool {
        match self.entities.get_mut(id) {
            Some(entity) => {
                entity.state = state;
                true
            }
            None => false,
        }
    }

    /// Moves an existing entity. Returns `false` when it is unknown.
    pub fn update_position(&mut self, id: &str, position: Position) -> bool {
        match self.entities.get_mut(id) {
            Some(entity) => {
                entity.position = position;
                true
            }
            None => false,
        }
    }

    /// Replaces the whole collection (whole-snapshot last-writer-wins).
    pub fn replace_all(&mut self, entities: Vec<Entity>) {
        *self = Self::from_entities(entities);
    }

    /// Snapshot of all entities in id order.
    pub fn to_vec(&self) -> Vec<Entity> {
        self.entities.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> EntityRegistry {
        EntityRegistry::from_entities(vec![
            Entity::new("n1", "Pump", Position::new(0.0, 0.0)),
            Entity::new("n2", "Valve", Position::new(10.0, 5.0)),
        ])
    }

    #[test]
    fn test_apply_state_known_entity() {
        let mut reg = registry();
        assert!(reg.apply_state("n1", NodeState::Emergency));
        assert_eq!(reg.get("n1").unwrap().state, NodeState::Emergency);
    }

    #[test]
    fn test_apply_state_unknown_entity_is_noop() {
        let mut reg = registry();
        assert!(!reg.apply_state("n9", NodeState::Warning));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_replace_all_discards_previous() {
        let mut reg = registry();
        reg.replace_all(vec![Entity::new("n3", "Tank", Position::default())]);

        assert_eq!(reg.len(), 1);
        assert!(reg.get("n1").is_none());
        assert!(reg.get("n3").is_some());
    }

    #[test]
    fn test_node_state_wire_form() {
        assert_eq!(serde_json::to_string(&NodeState::Emergency).unwrap(), "\"emergency\"");
        assert_eq!("WARNING".parse::<NodeState>().unwrap(), NodeState::Warning);
        assert!("melting".parse::<NodeState>().is_err());
    }
}
