//! Components and the registry that owns them.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use crate::{context::IcId, hub::ConnectorId, keyboard::HotkeyList, message::MessageType};

/// Handle of a component registered with the hub.
///
/// Id 0 is the hub's own component and doubles as the "default" source and
/// target; [`ComponentId::BROADCAST`] is reserved for broadcast targets and
/// never allocated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComponentId(pub u32);

impl ComponentId {
    pub const DEFAULT: ComponentId = ComponentId(0);
    pub const BROADCAST: ComponentId = ComponentId(u32::MAX);
}

impl fmt::Display for ComponentId {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// The descriptor a component registers with: identity, human-readable
/// metadata and the message types it may produce and consume.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ComponentInfo {
    pub id: ComponentId,
    pub string_id: String,
    pub name: String,
    pub description: String,
    pub languages: Vec<String>,
    pub produce: Vec<MessageType>,
    pub consume: Vec<MessageType>,
}

impl ComponentInfo {
    pub fn new(string_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            string_id: string_id.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.languages.push(language.into());
        self
    }

    pub fn produces(mut self, message_types: &[MessageType]) -> Self {
        self.produce.extend_from_slice(message_types);
        self
    }

    pub fn consumes(mut self, message_types: &[MessageType]) -> Self {
        self.consume.extend_from_slice(message_types);
        self
    }
}

/// A query template for `QUERY_COMPONENT`: every present field must match.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ComponentQuery {
    pub id: Option<ComponentId>,
    pub string_id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub languages: Vec<String>,
    pub produce: Vec<MessageType>,
    pub consume: Vec<MessageType>,
}

/// A registered component: its descriptor, the connector that owns it, the
/// hotkey lists it registered and the input contexts it is attached to.
///
/// The connector handle is a weak reference; the component does not keep its
/// transport alive.
#[derive(Clone, Debug)]
pub struct Component {
    info: ComponentInfo,
    connector: ConnectorId,
    produce_set: BTreeSet<MessageType>,
    consume_set: BTreeSet<MessageType>,
    hotkey_lists: HashMap<u32, HotkeyList>,
    attached_contexts: BTreeSet<IcId>,
}

impl Component {
    fn new(id: ComponentId, connector: ConnectorId, mut info: ComponentInfo) -> Self {
        info.id = id;

        // Registration may carry duplicated capability entries; the sets are
        // authoritative and the descriptor is rebuilt from them.
        let produce_set: BTreeSet<_> = info.produce.iter().copied().collect();
        let consume_set: BTreeSet<_> = info.consume.iter().copied().collect();
        info.produce = produce_set.iter().copied().collect();
        info.consume = consume_set.iter().copied().collect();

        Self {
            info,
            connector,
            produce_set,
            consume_set,
            hotkey_lists: HashMap::new(),
            attached_contexts: BTreeSet::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> ComponentId {
        self.info.id
    }

    #[inline]
    pub fn string_id(&self) -> &str {
        &self.info.string_id
    }

    #[inline]
    pub fn connector(&self) -> ConnectorId {
        self.connector
    }

    #[inline]
    pub fn info(&self) -> &ComponentInfo {
        &self.info
    }

    #[inline]
    pub fn may_produce(&self, message_type: MessageType) -> bool {
        self.produce_set.contains(&message_type)
    }

    #[inline]
    pub fn can_consume(&self, message_type: MessageType) -> bool {
        self.consume_set.contains(&message_type)
    }

    pub fn attached_contexts(&self) -> &BTreeSet<IcId> {
        &self.attached_contexts
    }

    pub(crate) fn attached_contexts_mut(&mut self) -> &mut BTreeSet<IcId> {
        &mut self.attached_contexts
    }

    /// Adds a hotkey list, replacing any previous list with the same id. The
    /// list's owner is stamped with this component's id.
    pub fn add_hotkey_list(&mut self, mut hotkey_list: HotkeyList) {
        hotkey_list.owner = self.id();
        self.hotkey_lists.insert(hotkey_list.id, hotkey_list);
    }

    pub fn remove_hotkey_list(&mut self, id: u32) {
        self.hotkey_lists.remove(&id);
    }

    pub fn hotkey_list(&self, id: u32) -> Option<&HotkeyList> {
        self.hotkey_lists.get(&id)
    }

    /// Checks this component against a query template: every field present
    /// in the query must match, list fields as subsets.
    pub fn matches_query(&self, query: &ComponentQuery) -> bool {
        if let Some(id) = query.id {
            if id != self.info.id {
                return false;
            }
        }
        if let Some(string_id) = &query.string_id {
            if *string_id != self.info.string_id {
                return false;
            }
        }
        if let Some(name) = &query.name {
            if *name != self.info.name {
                return false;
            }
        }
        if let Some(description) = &query.description {
            if *description != self.info.description {
                return false;
            }
        }
        if !query
            .languages
            .iter()
            .all(|language| self.info.languages.contains(language))
        {
            return false;
        }
        query
            .produce
            .iter()
            .all(|message_type| self.produce_set.contains(message_type))
            && query
                .consume
                .iter()
                .all(|message_type| self.consume_set.contains(message_type))
    }
}

/// Owns every registered component, keyed by numeric id with a string-id
/// index on the side. Numeric ids are allocated from a monotone counter that
/// skips ids still in use and fails outright when the id space is exhausted.
#[derive(Debug, Default)]
pub struct Registry {
    components: BTreeMap<ComponentId, Component>,
    by_string_id: HashMap<String, ComponentId>,
    next_id: u32,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: ComponentId) -> Option<&Component> {
        self.components.get(&id)
    }

    pub fn get_mut(&mut self, id: ComponentId) -> Option<&mut Component> {
        self.components.get_mut(&id)
    }

    pub fn contains(&self, id: ComponentId) -> bool {
        self.components.contains_key(&id)
    }

    pub fn id_by_string_id(&self, string_id: &str) -> Option<ComponentId> {
        self.by_string_id.get(string_id).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Component> {
        self.components.values()
    }

    /// Registers a component for `connector`. Fails on a missing or
    /// duplicate string id and on id-space exhaustion.
    pub fn insert(
        &mut self,
        connector: ConnectorId,
        info: ComponentInfo,
    ) -> Option<ComponentId> {
        if info.string_id.is_empty() || self.by_string_id.contains_key(&info.string_id) {
            return None;
        }

        let id = self.allocate_id()?;
        self.by_string_id.insert(info.string_id.clone(), id);
        self.components.insert(id, Component::new(id, connector, info));
        Some(id)
    }

    pub fn remove(&mut self, id: ComponentId) -> Option<Component> {
        let component = self.components.remove(&id)?;
        self.by_string_id.remove(&component.info.string_id);
        Some(component)
    }

    fn allocate_id(&mut self) -> Option<ComponentId> {
        let start = self.next_id;
        loop {
            let candidate = ComponentId(self.next_id);
            let in_use = candidate == ComponentId::BROADCAST
                || self.components.contains_key(&candidate);
            if !in_use {
                self.next_id = self.next_id.wrapping_add(1);
                return Some(candidate);
            }
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id == start {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;

    const CONNECTOR: ConnectorId = ConnectorId(1);

    fn info(string_id: &str) -> ComponentInfo {
        ComponentInfo::new(string_id, "test component")
            .produces(&[MessageType::SendKeyEvent, MessageType::SendKeyEvent])
            .consumes(&[MessageType::InsertText])
    }

    #[test]
    fn ids_are_monotone_and_string_ids_unique() {
        let mut registry = Registry::new();
        let first = registry.insert(CONNECTOR, info("a")).unwrap();
        let second = registry.insert(CONNECTOR, info("b")).unwrap();
        assert!(first < second);

        // Duplicate string id is rejected.
        assert_eq!(registry.insert(CONNECTOR, info("a")), None);

        // Removing frees the string id but never reuses the numeric id.
        registry.remove(first).unwrap();
        let third = registry.insert(CONNECTOR, info("a")).unwrap();
        assert!(third > second);
    }

    #[test]
    fn empty_string_id_is_rejected() {
        let mut registry = Registry::new();
        assert_eq!(registry.insert(CONNECTOR, info("")), None);
    }

    #[test]
    fn capability_sets_are_deduplicated() {
        let mut registry = Registry::new();
        let id = registry.insert(CONNECTOR, info("a")).unwrap();
        let component = registry.get(id).unwrap();
        assert_eq!(component.info().produce, vec![MessageType::SendKeyEvent]);
        assert!(component.may_produce(MessageType::SendKeyEvent));
        assert!(!component.may_produce(MessageType::InsertText));
        assert!(component.can_consume(MessageType::InsertText));
    }

    #[test]
    fn query_matches_on_every_present_field() {
        let mut registry = Registry::new();
        let id = registry
            .insert(
                CONNECTOR,
                info("org.example.ime").with_language("en").with_language("de"),
            )
            .unwrap();
        let component = registry.get(id).unwrap();

        assert!(component.matches_query(&ComponentQuery::default()));
        assert!(component.matches_query(&ComponentQuery {
            id: Some(id),
            string_id: Some("org.example.ime".into()),
            languages: vec!["en".into()],
            produce: vec![MessageType::SendKeyEvent],
            ..ComponentQuery::default()
        }));
        assert!(!component.matches_query(&ComponentQuery {
            languages: vec!["fr".into()],
            ..ComponentQuery::default()
        }));
        assert!(!component.matches_query(&ComponentQuery {
            consume: vec![MessageType::ProcessKeyEvent],
            ..ComponentQuery::default()
        }));
    }

    #[test]
    fn hotkey_lists_are_stamped_with_the_owner() {
        let mut registry = Registry::new();
        let id = registry.insert(CONNECTOR, info("a")).unwrap();
        let component = registry.get_mut(id).unwrap();

        component.add_hotkey_list(crate::keyboard::HotkeyList {
            id: 3,
            owner: ComponentId(999),
            hotkeys: Vec::new(),
        });
        assert_eq!(component.hotkey_list(3).unwrap().owner, id);

        component.remove_hotkey_list(3);
        assert!(component.hotkey_list(3).is_none());
    }
}
