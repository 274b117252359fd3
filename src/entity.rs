//! Arena of simulated agents.
//!
//! Entities are generational handles into a slot map; components live in
//! per-kind secondary maps. Callers only ever hold `EntityId`s, so a removed
//! entity's handle simply stops resolving.

use serde::{Deserialize, Serialize};
use slotmap::{new_key_type, Key, KeyData, SecondaryMap, SlotMap};

use crate::genome::TraitSet;

new_key_type! {
    /// Opaque generational handle for an entity.
    pub struct EntityId;
}

impl EntityId {
    /// Stable numeric form used on the wire.
    pub fn to_raw(self) -> u64 {
        self.data().as_ffi()
    }

    pub fn from_raw(raw: u64) -> Self {
        EntityId::from(KeyData::from_ffi(raw))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn distance(&self, other: &Position) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Motion {
    pub vx: f64,
    pub vy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
}

/// Birth and ageing bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lifecycle {
    pub created_at: f64,
    pub generation: u32,
    #[serde(skip)]
    pub parent_ids: Vec<EntityId>,
    pub age: f64,
    pub last_reproduced_at: Option<f64>,
    pub offspring: u32,
    /// Creation order, used for deterministic iteration
    pub seq: u64,
}

impl Lifecycle {
    pub fn genesis(created_at: f64) -> Self {
        Self {
            created_at,
            generation: 0,
            parent_ids: Vec::new(),
            age: 0.0,
            last_reproduced_at: None,
            offspring: 0,
            seq: 0,
        }
    }

    /// Lifecycle for a child; generation is one past the older lineage.
    pub fn offspring_of(created_at: f64, parents: &[(EntityId, u32)]) -> Self {
        let generation = parents
            .iter()
            .map(|(_, g)| *g)
            .max()
            .map(|g| g + 1)
            .unwrap_or(0);
        Self {
            created_at,
            generation,
            parent_ids: parents.iter().take(2).map(|(id, _)| *id).collect(),
            age: 0.0,
            last_reproduced_at: None,
            offspring: 0,
            seq: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Component {
    Traits(TraitSet),
    Position(Position),
    Motion(Motion),
    Lifecycle(Lifecycle),
    Profile(Profile),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    Traits,
    Position,
    Motion,
    Lifecycle,
    Profile,
}

impl Component {
    pub fn kind(&self) -> ComponentKind {
        match self {
            Component::Traits(_) => ComponentKind::Traits,
            Component::Position(_) => ComponentKind::Position,
            Component::Motion(_) => ComponentKind::Motion,
            Component::Lifecycle(_) => ComponentKind::Lifecycle,
            Component::Profile(_) => ComponentKind::Profile,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct EntityStore {
    entities: SlotMap<EntityId, ()>,
    traits: SecondaryMap<EntityId, TraitSet>,
    positions: SecondaryMap<EntityId, Position>,
    motions: SecondaryMap<EntityId, Motion>,
    lifecycles: SecondaryMap<EntityId, Lifecycle>,
    profiles: SecondaryMap<EntityId, Profile>,
    next_seq: u64,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(id)
    }

    /// Create an entity with the given components attached.
    pub fn create(&mut self, components: Vec<Component>) -> EntityId {
        let id = self.entities.insert(());
        for component in components {
            self.attach(id, component);
        }
        id
    }

    /// Attach (or replace) a component. Returns false for stale handles.
    /// A lifecycle component is stamped with the next creation sequence.
    pub fn attach(&mut self, id: EntityId, component: Component) -> bool {
        if !self.contains(id) {
            return false;
        }
        match component {
            Component::Traits(t) => {
                self.traits.insert(id, t);
            }
            Component::Position(p) => {
                self.positions.insert(id, p);
            }
            Component::Motion(m) => {
                self.motions.insert(id, m);
            }
            Component::Lifecycle(mut l) => {
                l.seq = self.next_seq;
                self.next_seq += 1;
                self.lifecycles.insert(id, l);
            }
            Component::Profile(p) => {
                self.profiles.insert(id, p);
            }
        }
        true
    }

    pub fn detach(&mut self, id: EntityId, kind: ComponentKind) -> Option<Component> {
        match kind {
            ComponentKind::Traits => self.traits.remove(id).map(Component::Traits),
            ComponentKind::Position => self.positions.remove(id).map(Component::Position),
            ComponentKind::Motion => self.motions.remove(id).map(Component::Motion),
            ComponentKind::Lifecycle => self.lifecycles.remove(id).map(Component::Lifecycle),
            ComponentKind::Profile => self.profiles.remove(id).map(Component::Profile),
        }
    }

    /// Remove an entity and all its components.
    pub fn remove(&mut self, id: EntityId) -> bool {
        if self.entities.remove(id).is_none() {
            return false;
        }
        self.traits.remove(id);
        self.positions.remove(id);
        self.motions.remove(id);
        self.lifecycles.remove(id);
        self.profiles.remove(id);
        true
    }

    pub fn has(&self, id: EntityId, kind: ComponentKind) -> bool {
        match kind {
            ComponentKind::Traits => self.traits.contains_key(id),
            ComponentKind::Position => self.positions.contains_key(id),
            ComponentKind::Motion => self.motions.contains_key(id),
            ComponentKind::Lifecycle => self.lifecycles.contains_key(id),
            ComponentKind::Profile => self.profiles.contains_key(id),
        }
    }

    /// Entities carrying every listed component, in creation order.
    pub fn query(&self, kinds: &[ComponentKind]) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self
            .entities
            .keys()
            .filter(|id| kinds.iter().all(|k| self.has(*id, *k)))
            .collect();
        ids.sort_by_key(|id| self.lifecycles.get(*id).map(|l| l.seq).unwrap_or(u64::MAX));
        ids
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.query(&[])
    }

    pub fn traits(&self, id: EntityId) -> Option<&TraitSet> {
        self.traits.get(id)
    }

    pub fn position(&self, id: EntityId) -> Option<&Position> {
        self.positions.get(id)
    }

    pub fn position_mut(&mut self, id: EntityId) -> Option<&mut Position> {
        self.positions.get_mut(id)
    }

    pub fn motion(&self, id: EntityId) -> Option<&Motion> {
        self.motions.get(id)
    }

    pub fn motion_mut(&mut self, id: EntityId) -> Option<&mut Motion> {
        self.motions.get_mut(id)
    }

    pub fn lifecycle(&self, id: EntityId) -> Option<&Lifecycle> {
        self.lifecycles.get(id)
    }

    pub fn lifecycle_mut(&mut self, id: EntityId) -> Option<&mut Lifecycle> {
        self.lifecycles.get_mut(id)
    }

    pub fn lifecycles_mut(&mut self) -> impl Iterator<Item = (EntityId, &mut Lifecycle)> {
        self.lifecycles.iter_mut()
    }

    pub fn profile(&self, id: EntityId) -> Option<&Profile> {
        self.profiles.get(id)
    }

    /// Children of an entity, found through their lifecycle parent ids.
    pub fn children_of(&self, id: EntityId) -> Vec<EntityId> {
        self.query(&[ComponentKind::Lifecycle])
            .into_iter()
            .filter(|child| {
                self.lifecycles
                    .get(*child)
                    .map(|l| l.parent_ids.contains(&id))
                    .unwrap_or(false)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(store: &mut EntityStore, curiosity: f64) -> EntityId {
        store.create(vec![
            Component::Traits(TraitSet::from_values([("curiosity", curiosity)])),
            Component::Lifecycle(Lifecycle::genesis(0.0)),
        ])
    }

    #[test]
    fn test_create_and_query() {
        let mut store = EntityStore::new();
        let a = agent(&mut store, 0.1);
        let b = agent(&mut store, 0.2);
        store.attach(b, Component::Position(Position { x: 1.0, y: 2.0 }));

        assert_eq!(store.len(), 2);
        assert_eq!(store.query(&[ComponentKind::Traits]), vec![a, b]);
        assert_eq!(store.query(&[ComponentKind::Position]), vec![b]);
    }

    #[test]
    fn test_removed_handle_stops_resolving() {
        let mut store = EntityStore::new();
        let a = agent(&mut store, 0.3);
        assert!(store.remove(a));
        assert!(!store.contains(a));
        assert!(store.traits(a).is_none());
        assert!(!store.remove(a));

        // Slot reuse must not revive the old handle
        let b = agent(&mut store, 0.4);
        assert_ne!(a, b);
        assert!(store.traits(a).is_none());
        assert!(!store.attach(a, Component::Profile(Profile { name: "x".into() })));
    }

    #[test]
    fn test_detach() {
        let mut store = EntityStore::new();
        let a = agent(&mut store, 0.5);
        let detached = store.detach(a, ComponentKind::Traits);
        assert!(matches!(detached, Some(Component::Traits(_))));
        assert!(!store.has(a, ComponentKind::Traits));
        assert!(store.detach(a, ComponentKind::Traits).is_none());
    }

    #[test]
    fn test_generation_rule() {
        let mut store = EntityStore::new();
        let a = agent(&mut store, 0.1);
        let b = agent(&mut store, 0.9);
        let child = Lifecycle::offspring_of(5.0, &[(a, 0), (b, 3)]);
        assert_eq!(child.generation, 4);
        assert_eq!(child.parent_ids, vec![a, b]);
        assert_eq!(Lifecycle::offspring_of(0.0, &[]).generation, 0);
    }

    #[test]
    fn test_children_of() {
        let mut store = EntityStore::new();
        let a = agent(&mut store, 0.1);
        let b = agent(&mut store, 0.9);
        let c = store.create(vec![Component::Lifecycle(Lifecycle::offspring_of(
            1.0,
            &[(a, 0), (b, 0)],
        ))]);
        assert_eq!(store.children_of(a), vec![c]);
        assert!(store.children_of(c).is_empty());
    }

    #[test]
    fn test_raw_id_roundtrip() {
        let mut store = EntityStore::new();
        let a = agent(&mut store, 0.1);
        assert_eq!(EntityId::from_raw(a.to_raw()), a);
    }
}
