//! Input contexts: the per-context attachment graph and active-consumer
//! table.
//!
//! An [`InputContext`] never reaches back into the hub. Every mutation
//! instead appends [`ContextEvent`]s describing the consumer reshuffling it
//! caused; the hub drains those events after the call and turns them into
//! notifications, broadcasts and follow-up requests. Event order matches the
//! order the underlying changes happened in.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use smallvec::SmallVec;

use crate::{
    component::{Component, ComponentId, Registry},
    keyboard::HotkeyList,
    message::MessageType,
};

/// Handle of an input context.
///
/// Id 0 is the default input context owned by the hub itself, which lives
/// for the hub's whole lifetime and carries global state such as global
/// hotkeys. [`IcId::FOCUSED`] is a sentinel resolved to the currently
/// focused context at dispatch entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IcId(pub u32);

impl IcId {
    pub const DEFAULT: IcId = IcId(0);
    pub const FOCUSED: IcId = IcId(u32::MAX);
}

impl fmt::Display for IcId {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Snapshot of an input context returned by queries.
#[derive(Clone, Debug, PartialEq)]
pub struct InputContextInfo {
    pub id: IcId,
    pub owner: ComponentId,
}

/// How a component is bound to an input context. Absence from the
/// attachment list means "not attached".
///
/// The derived order doubles as the consumer-selection rank: a sticky
/// consumer outranks an active one, which outranks a passive one; pending
/// components are never selected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum AttachState {
    /// Asked to attach (passively); waiting for its acknowledgement.
    PendingPassive,
    /// Asked to attach (actively); waiting for its acknowledgement.
    PendingActive,
    /// Attached; becomes consumer only for messages nobody else consumes.
    Passive,
    /// Attached; preempts non-sticky consumers for everything it consumes.
    Active,
    /// Like `Active` but cannot be preempted; only explicit resignation or
    /// detaching removes its consumer roles.
    ActiveSticky,
}

impl AttachState {
    #[inline]
    pub fn is_pending(self) -> bool {
        matches!(self, Self::PendingPassive | Self::PendingActive)
    }

    #[inline]
    pub fn is_attached(self) -> bool {
        matches!(self, Self::Passive | Self::Active | Self::ActiveSticky)
    }
}

/// Short list of message types used while reshuffling consumers.
pub type MessageTypeList = SmallVec<[MessageType; 8]>;

/// What an input-context mutation did, for the hub to act on.
#[derive(Clone, Debug, PartialEq)]
pub enum ContextEvent {
    /// `component` became the active consumer for `messages`.
    Activated {
        component: ComponentId,
        messages: MessageTypeList,
    },
    /// `component` lost its active-consumer role for `messages`.
    Deactivated {
        component: ComponentId,
        messages: MessageTypeList,
    },
    /// `component` was removed from the attachment list; `state` is the
    /// state it held just before.
    Detached {
        component: ComponentId,
        state: AttachState,
    },
    /// The active consumer of `messages` changed (in either direction).
    ConsumerChanged { messages: MessageTypeList },
    /// `component` no longer consumes anything anyone needs; the hub may
    /// detach it.
    MaybeDetach { component: ComponentId },
    /// `messages` are needed by an attached producer but have no consumer;
    /// the hub should look for one (excluding `exclude`).
    RequestConsumer {
        messages: MessageTypeList,
        exclude: ComponentId,
    },
}

/// Per-component attachment record.
#[derive(Clone, Debug)]
struct Attachment {
    component: ComponentId,
    state: AttachState,
    /// Persistent attachments are exempt from redundancy-based detaching.
    /// Always true for the owner.
    persistent: bool,
    /// Message types the component refuses to consume despite declaring the
    /// capability.
    resigned: BTreeSet<MessageType>,
    /// Message types the component produces and wants somebody to consume.
    need_consumer: BTreeSet<MessageType>,
    /// The hotkey list of this component activated for this context.
    hotkey_list: Option<u32>,
}

impl Attachment {
    fn new(component: ComponentId, state: AttachState, persistent: bool) -> Self {
        Self {
            component,
            state,
            persistent,
            resigned: BTreeSet::new(),
            need_consumer: BTreeSet::new(),
            hotkey_list: None,
        }
    }
}

/// A focusable composition session and everything scoped to it.
#[derive(Debug)]
pub struct InputContext {
    id: IcId,
    owner: ComponentId,
    /// Attachment records in attach order; broadcast fan-out and consumer
    /// election iterate this in order.
    attached: Vec<Attachment>,
    active_consumers: BTreeMap<MessageType, ComponentId>,
    /// Lazily rebuilt union of the attached components' selected hotkey
    /// lists; `None` means invalidated.
    active_hotkey_lists: Option<Vec<(ComponentId, u32)>>,
}

impl InputContext {
    /// Creates the context and attaches its owner. The owner is attached
    /// sticky and persistent, holds the highest priority for everything it
    /// consumes, and can never be detached.
    pub fn new(
        id: IcId,
        registry: &Registry,
        owner: ComponentId,
        events: &mut Vec<ContextEvent>,
    ) -> Option<Self> {
        registry.get(owner)?;
        let mut context = Self {
            id,
            owner,
            attached: Vec::new(),
            active_consumers: BTreeMap::new(),
            active_hotkey_lists: None,
        };
        context.attach_component(registry, owner, AttachState::ActiveSticky, true, events);
        Some(context)
    }

    #[inline]
    pub fn id(&self) -> IcId {
        self.id
    }

    #[inline]
    pub fn owner(&self) -> ComponentId {
        self.owner
    }

    pub fn info(&self) -> InputContextInfo {
        InputContextInfo {
            id: self.id,
            owner: self.owner,
        }
    }

    fn attachment(&self, component: ComponentId) -> Option<&Attachment> {
        self.attached.iter().find(|entry| entry.component == component)
    }

    fn attachment_mut(&mut self, component: ComponentId) -> Option<&mut Attachment> {
        self.attached
            .iter_mut()
            .find(|entry| entry.component == component)
    }

    pub fn attach_state(&self, component: ComponentId) -> Option<AttachState> {
        self.attachment(component).map(|entry| entry.state)
    }

    pub fn is_attached(&self, component: ComponentId) -> bool {
        self.attach_state(component)
            .map_or(false, AttachState::is_attached)
    }

    pub fn is_pending(&self, component: ComponentId) -> bool {
        self.attach_state(component)
            .map_or(false, AttachState::is_pending)
    }

    pub fn is_persistent(&self, component: ComponentId) -> bool {
        self.attachment(component)
            .map_or(false, |entry| entry.persistent)
    }

    /// All components currently on the attachment list with their states,
    /// in attach order.
    pub fn attached_components(&self) -> Vec<(ComponentId, AttachState)> {
        self.attached
            .iter()
            .map(|entry| (entry.component, entry.state))
            .collect()
    }

    /// Attaches `component` or changes its attach state.
    ///
    /// Legal transitions: a pending or fresh component may move to any
    /// state; a fully attached component may move between the attached
    /// states but never back to pending. The owner is always sticky.
    pub fn attach_component(
        &mut self,
        registry: &Registry,
        component: ComponentId,
        state: AttachState,
        persistent: bool,
        events: &mut Vec<ContextEvent>,
    ) -> bool {
        let consume = match registry.get(component) {
            Some(entry) => entry.info().consume.clone(),
            None => return false,
        };

        if component == self.owner && state != AttachState::ActiveSticky {
            return false;
        }

        let old_state = self.attach_state(component);
        if state.is_pending() && old_state.map_or(false, AttachState::is_attached) {
            return false;
        }

        let persistent = component == self.owner || persistent;
        match self.attachment_mut(component) {
            Some(entry) => {
                entry.state = state;
                entry.persistent = persistent;
            }
            None => self
                .attached
                .push(Attachment::new(component, state, persistent)),
        }

        if state.is_pending() {
            return true;
        }

        // Claim consumer roles for everything the component consumes and has
        // not explicitly resigned.
        let resigned = &self
            .attachment(component)
            .expect("attachment was just inserted")
            .resigned;
        let messages: MessageTypeList = consume
            .iter()
            .copied()
            .filter(|message_type| !resigned.contains(message_type))
            .collect();

        self.activate_for_messages(
            registry,
            component,
            &messages,
            state != AttachState::Passive,
            events,
        );
        true
    }

    /// Removes `component` from the context and re-elects consumers for
    /// whatever it was consuming. The owner cannot be detached.
    pub fn detach_component(
        &mut self,
        registry: &Registry,
        component: &Component,
        events: &mut Vec<ContextEvent>,
    ) -> bool {
        let id = component.id();
        if id == self.owner {
            return false;
        }

        let position = match self.attached.iter().position(|entry| entry.component == id) {
            Some(position) => position,
            None => return false,
        };

        if self.attached[position].hotkey_list.is_some() {
            self.invalidate_hotkey_lists();
        }

        let state = self.attached[position].state;
        self.attached.remove(position);

        if state.is_pending() {
            // This component was expected to consume something; look for a
            // replacement before reporting the detach.
            self.check_and_request_consumer(&component.info().consume, id, events);
            events.push(ContextEvent::Detached {
                component: id,
                state,
            });
            return true;
        }

        let messages: MessageTypeList = component.info().consume.iter().copied().collect();
        self.deactivate_for_messages(registry, id, &messages, events);
        events.push(ContextEvent::Detached {
            component: id,
            state,
        });
        true
    }

    /// Whether `component` currently holds at least one active-consumer
    /// role.
    pub fn is_component_active(&self, component: ComponentId) -> bool {
        self.is_attached(component)
            && self
                .active_consumers
                .values()
                .any(|consumer| *consumer == component)
    }

    /// A component is redundant when nothing it actively consumes is needed
    /// by any other attached component.
    pub fn is_component_redundant(&self, component: &Component) -> bool {
        let id = component.id();
        if !self.is_attached(id) {
            return false;
        }
        !component.info().consume.iter().any(|message_type| {
            self.active_consumer(*message_type) == Some(id)
                && self.message_need_consumer(*message_type, id)
        })
    }

    /// Reports every non-persistent redundant component for the hub to
    /// detach.
    pub fn maybe_detach_redundant_components(
        &self,
        registry: &Registry,
        events: &mut Vec<ContextEvent>,
    ) {
        for entry in &self.attached {
            if entry.persistent || !entry.state.is_attached() {
                continue;
            }
            if let Some(component) = registry.get(entry.component) {
                if self.is_component_redundant(component) {
                    events.push(ContextEvent::MaybeDetach {
                        component: entry.component,
                    });
                }
            }
        }
    }

    pub fn may_produce(
        &self,
        registry: &Registry,
        message_type: MessageType,
        include_pending: bool,
    ) -> bool {
        self.attached.iter().any(|entry| {
            (include_pending || !entry.state.is_pending())
                && registry
                    .get(entry.component)
                    .map_or(false, |component| component.may_produce(message_type))
        })
    }

    pub fn may_consume(
        &self,
        registry: &Registry,
        message_type: MessageType,
        include_pending: bool,
    ) -> bool {
        if self.has_active_consumer(message_type) {
            return true;
        }
        include_pending
            && self.attached.iter().any(|entry| {
                entry.state.is_pending()
                    && registry
                        .get(entry.component)
                        .map_or(false, |component| component.can_consume(message_type))
            })
    }

    #[inline]
    pub fn has_active_consumer(&self, message_type: MessageType) -> bool {
        self.active_consumers.contains_key(&message_type)
    }

    #[inline]
    pub fn active_consumer(&self, message_type: MessageType) -> Option<ComponentId> {
        self.active_consumers.get(&message_type).copied()
    }

    /// Makes `component` the active consumer for `messages` (where it can
    /// consume them), clearing any earlier resignation. Sticky holders are
    /// not preempted.
    pub fn assign_active_consumer(
        &mut self,
        registry: &Registry,
        component: &Component,
        messages: &[MessageType],
        events: &mut Vec<ContextEvent>,
    ) -> bool {
        let id = component.id();
        match self.attach_state(id) {
            Some(state) if !state.is_pending() => {}
            _ => return false,
        }

        let mut valid: MessageTypeList = SmallVec::new();
        for message_type in messages {
            if component.can_consume(*message_type) {
                if let Some(entry) = self.attachment_mut(id) {
                    entry.resigned.remove(message_type);
                }
                valid.push(*message_type);
            }
        }

        self.activate_for_messages(registry, id, &valid, true, events);
        true
    }

    /// Drops `component`'s active-consumer roles for `messages` and refuses
    /// them until assigned again; another attached consumer takes over where
    /// possible.
    pub fn resign_active_consumer(
        &mut self,
        registry: &Registry,
        component: &Component,
        messages: &[MessageType],
        events: &mut Vec<ContextEvent>,
    ) -> bool {
        let id = component.id();
        let persistent = match self.attachment(id) {
            Some(entry) if !entry.state.is_pending() => entry.persistent,
            _ => return false,
        };

        let mut valid: MessageTypeList = SmallVec::new();
        for message_type in messages {
            if component.can_consume(*message_type) {
                if let Some(entry) = self.attachment_mut(id) {
                    entry.resigned.insert(*message_type);
                }
                valid.push(*message_type);
            }
        }

        self.deactivate_for_messages(registry, id, &valid, events);
        if !persistent && self.is_component_redundant(component) {
            events.push(ContextEvent::MaybeDetach { component: id });
        }
        true
    }

    /// Replaces the set of messages `component` produces and wants consumed.
    /// Returns the subset that already has a consumer; missing consumers are
    /// reported as a [`ContextEvent::RequestConsumer`].
    pub fn set_messages_need_consumer(
        &mut self,
        registry: &Registry,
        component: &Component,
        messages: &[MessageType],
        events: &mut Vec<ContextEvent>,
    ) -> Vec<MessageType> {
        let id = component.id();
        let first_time = match self.attachment(id) {
            Some(entry) => entry.need_consumer.is_empty(),
            None => return Vec::new(),
        };

        let need: BTreeSet<MessageType> = messages
            .iter()
            .copied()
            .filter(|message_type| component.may_produce(*message_type))
            .collect();

        let mut missing: MessageTypeList = SmallVec::new();
        let mut already_have = Vec::new();
        for message_type in &need {
            if self.may_consume(registry, *message_type, true) {
                already_have.push(*message_type);
            } else {
                missing.push(*message_type);
            }
        }

        if let Some(entry) = self.attachment_mut(id) {
            entry.need_consumer = need;
        }

        if !missing.is_empty() {
            events.push(ContextEvent::RequestConsumer {
                messages: missing,
                exclude: id,
            });
        }
        if !first_time {
            self.maybe_detach_redundant_components(registry, events);
        }
        already_have
    }

    /// All attached consumers of `message_type`, the active one first and
    /// the rest in attach order.
    pub fn all_consumers(
        &self,
        registry: &Registry,
        message_type: MessageType,
        include_pending: bool,
    ) -> Vec<ComponentId> {
        let active = self.active_consumer(message_type);
        let mut consumers: Vec<ComponentId> = active.into_iter().collect();

        for entry in &self.attached {
            if entry.state.is_pending() && !include_pending {
                continue;
            }
            if Some(entry.component) == active || entry.resigned.contains(&message_type) {
                continue;
            }
            let consumes = registry
                .get(entry.component)
                .map_or(false, |component| component.can_consume(message_type));
            if consumes {
                consumers.push(entry.component);
            }
        }
        consumers
    }

    // Hotkey-list bookkeeping. The cache is invalidated on every change and
    // rebuilt on demand.

    pub fn component_active_hotkey_list<'a>(
        &self,
        registry: &'a Registry,
        component: ComponentId,
    ) -> Option<&'a HotkeyList> {
        let list_id = self.attachment(component)?.hotkey_list?;
        registry.get(component)?.hotkey_list(list_id)
    }

    pub fn set_component_active_hotkey_list(&mut self, component: ComponentId, list_id: u32) {
        let entry = match self.attachment_mut(component) {
            Some(entry) => entry,
            None => return,
        };
        if entry.hotkey_list == Some(list_id) {
            return;
        }
        entry.hotkey_list = Some(list_id);
        self.invalidate_hotkey_lists();
    }

    pub fn unset_component_active_hotkey_list(&mut self, component: ComponentId) {
        if let Some(entry) = self.attachment_mut(component) {
            if entry.hotkey_list.take().is_some() {
                self.invalidate_hotkey_lists();
            }
        }
    }

    pub fn component_hotkey_list_updated(&mut self, component: ComponentId, list_id: u32) {
        if let Some(entry) = self.attachment(component) {
            if entry.hotkey_list == Some(list_id) {
                self.invalidate_hotkey_lists();
            }
        }
    }

    pub fn component_hotkey_list_removed(&mut self, component: ComponentId, list_id: u32) {
        if let Some(entry) = self.attachment_mut(component) {
            if entry.hotkey_list == Some(list_id) {
                entry.hotkey_list = None;
                self.invalidate_hotkey_lists();
            }
        }
    }

    /// The union of the attached components' selected hotkey lists, as
    /// `(component, list id)` pairs in attach order.
    pub fn active_hotkey_lists(&mut self, registry: &Registry) -> &[(ComponentId, u32)] {
        if self.active_hotkey_lists.is_none() {
            let mut lists = Vec::new();
            for entry in &self.attached {
                let list_id = match entry.hotkey_list {
                    Some(list_id) => list_id,
                    None => continue,
                };
                let exists = registry
                    .get(entry.component)
                    .map_or(false, |component| component.hotkey_list(list_id).is_some());
                if exists {
                    lists.push((entry.component, list_id));
                }
            }
            self.active_hotkey_lists = Some(lists);
        }
        self.active_hotkey_lists.as_deref().unwrap_or(&[])
    }

    fn invalidate_hotkey_lists(&mut self) {
        self.active_hotkey_lists = None;
    }

    /// Picks the strongest eligible consumer for `message_type`: highest
    /// attach state wins, then whether the candidate is already active
    /// somewhere; later attachments win ties.
    pub fn find_consumer(
        &self,
        registry: &Registry,
        message_type: MessageType,
        exclude: Option<ComponentId>,
    ) -> Option<ComponentId> {
        let mut best: Option<(ComponentId, AttachState, bool)> = None;
        for entry in &self.attached {
            if entry.state.is_pending()
                || Some(entry.component) == exclude
                || entry.resigned.contains(&message_type)
            {
                continue;
            }
            let consumes = registry
                .get(entry.component)
                .map_or(false, |component| component.can_consume(message_type));
            if !consumes {
                continue;
            }
            let active = self.is_component_active(entry.component);
            let replace = match best {
                Some((_, best_state, best_active)) => {
                    entry.state > best_state || (entry.state == best_state && active >= best_active)
                }
                None => true,
            };
            if replace {
                best = Some((entry.component, entry.state, active));
            }
        }
        best.map(|(component, _, _)| component)
    }

    fn activate_for_messages(
        &mut self,
        registry: &Registry,
        component: ComponentId,
        messages: &[MessageType],
        active: bool,
        events: &mut Vec<ContextEvent>,
    ) {
        let mut activated: MessageTypeList = SmallVec::new();
        let mut deactivated: Vec<(ComponentId, MessageTypeList)> = Vec::new();

        for message_type in messages {
            let old = self.active_consumer(*message_type);
            if old == Some(component) || (!active && old.is_some()) {
                continue;
            }
            if let Some(old) = old {
                if self.attach_state(old) == Some(AttachState::ActiveSticky) {
                    continue;
                }
            }

            self.active_consumers.insert(*message_type, component);
            activated.push(*message_type);
            if let Some(old) = old {
                match deactivated.iter_mut().find(|(loser, _)| *loser == old) {
                    Some((_, messages)) => messages.push(*message_type),
                    None => deactivated.push((old, SmallVec::from_slice(&[*message_type]))),
                }
            }
        }

        if activated.is_empty() {
            return;
        }

        events.push(ContextEvent::Activated {
            component,
            messages: activated.clone(),
        });
        for (loser, messages) in deactivated {
            events.push(ContextEvent::Deactivated {
                component: loser,
                messages,
            });
            if let Some(loser_component) = registry.get(loser) {
                if self.is_component_redundant(loser_component) && !self.is_persistent(loser) {
                    events.push(ContextEvent::MaybeDetach { component: loser });
                }
            }
        }
        events.push(ContextEvent::ConsumerChanged {
            messages: activated,
        });
    }

    fn deactivate_for_messages(
        &mut self,
        registry: &Registry,
        component: ComponentId,
        messages: &[MessageType],
        events: &mut Vec<ContextEvent>,
    ) {
        let mut deactivated: MessageTypeList = SmallVec::new();
        for message_type in messages {
            if self.active_consumer(*message_type) == Some(component) {
                self.active_consumers.remove(message_type);
                deactivated.push(*message_type);
            }
        }

        // Re-elect a consumer for everything the component held.
        let mut need_consumer: MessageTypeList = SmallVec::new();
        let mut activated: Vec<(ComponentId, MessageTypeList)> = Vec::new();
        for message_type in &deactivated {
            if let Some(consumer) = self.find_consumer(registry, *message_type, Some(component)) {
                self.active_consumers.insert(*message_type, consumer);
                match activated.iter_mut().find(|(winner, _)| *winner == consumer) {
                    Some((_, messages)) => messages.push(*message_type),
                    None => activated.push((consumer, SmallVec::from_slice(&[*message_type]))),
                }
            } else if self.message_need_consumer(*message_type, component) {
                need_consumer.push(*message_type);
            }
        }

        if deactivated.is_empty() {
            return;
        }

        for (winner, messages) in activated {
            events.push(ContextEvent::Activated {
                component: winner,
                messages,
            });
        }
        events.push(ContextEvent::Deactivated {
            component,
            messages: deactivated.clone(),
        });
        events.push(ContextEvent::ConsumerChanged {
            messages: deactivated,
        });
        if !need_consumer.is_empty() {
            events.push(ContextEvent::RequestConsumer {
                messages: need_consumer,
                exclude: component,
            });
        }
    }

    fn check_and_request_consumer(
        &self,
        messages: &[MessageType],
        exclude: ComponentId,
        events: &mut Vec<ContextEvent>,
    ) {
        let need: MessageTypeList = messages
            .iter()
            .copied()
            .filter(|message_type| {
                self.message_need_consumer(*message_type, exclude)
                    && self.active_consumer(*message_type).is_none()
            })
            .collect();
        if !need.is_empty() {
            events.push(ContextEvent::RequestConsumer {
                messages: need,
                exclude,
            });
        }
    }

    fn message_need_consumer(&self, message_type: MessageType, exclude: ComponentId) -> bool {
        self.attached.iter().any(|entry| {
            entry.component != exclude && entry.need_consumer.contains(&message_type)
        })
    }
}


#[cfg(test)]
mod property_tests {
    use proptest::prelude::*;

    use super::*;
    use crate::component::ComponentInfo;
    use crate::hub::ConnectorId;
    use crate::message::MessageType;

    const MESSAGE_TYPES: [MessageType; 3] = [
        MessageType::ProcessKeyEvent,
        MessageType::SetComposition,
        MessageType::CompleteComposition,
    ];

    #[derive(Clone, Debug)]
    enum Op {
        Attach(usize, AttachState),
        Detach(usize),
        Resign(usize, usize),
        Assign(usize, usize),
    }

    fn op_strategy(components: usize) -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..components, 0u8..5).prop_map(|(component, state)| {
                let state = match state {
                    0 => AttachState::PendingPassive,
                    1 => AttachState::PendingActive,
                    2 => AttachState::Passive,
                    3 => AttachState::Active,
                    _ => AttachState::ActiveSticky,
                };
                Op::Attach(component, state)
            }),
            (0..components).prop_map(Op::Detach),
            (0..components, 0..MESSAGE_TYPES.len()).prop_map(|(c, m)| Op::Resign(c, m)),
            (0..components, 0..MESSAGE_TYPES.len()).prop_map(|(c, m)| Op::Assign(c, m)),
        ]
    }

    proptest! {
        /// After any sequence of attach-state changes, every active
        /// consumer is a fully attached component that declares the
        /// capability, and a sticky holder never loses a role to a plain
        /// attach.
        #[test]
        fn consumer_table_stays_consistent(
            ops in proptest::collection::vec(op_strategy(4), 1..60)
        ) {
            let mut registry = Registry::new();
            let owner = registry
                .insert(
                    ConnectorId(1),
                    ComponentInfo::new("owner", "Owner").consumes(&[MessageType::InsertText]),
                )
                .unwrap();
            let components: Vec<ComponentId> = (0..4)
                .map(|index| {
                    // Components consume staggered subsets of the pool.
                    let consume: Vec<MessageType> =
                        MESSAGE_TYPES.iter().copied().skip(index % 2).collect();
                    registry
                        .insert(
                            ConnectorId(1),
                            ComponentInfo::new(format!("component-{}", index), "Component")
                                .consumes(&consume),
                        )
                        .unwrap()
                })
                .collect();

            let mut events = Vec::new();
            let mut context = InputContext::new(IcId(1), &registry, owner, &mut events).unwrap();

            for op in ops {
                events.clear();
                match op {
                    Op::Attach(index, state) => {
                        let id = components[index];
                        let was_attached = context.is_attached(id);
                        let accepted = context.attach_component(
                            &registry, id, state, false, &mut events,
                        );
                        // A fully attached component never goes back to
                        // pending.
                        if was_attached && state.is_pending() {
                            prop_assert!(!accepted);
                        }
                    }
                    Op::Detach(index) => {
                        let component = registry.get(components[index]).unwrap();
                        context.detach_component(&registry, component, &mut events);
                    }
                    Op::Resign(index, message) => {
                        let component = registry.get(components[index]).unwrap();
                        context.resign_active_consumer(
                            &registry,
                            component,
                            &[MESSAGE_TYPES[message]],
                            &mut events,
                        );
                    }
                    Op::Assign(index, message) => {
                        let component = registry.get(components[index]).unwrap();
                        context.assign_active_consumer(
                            &registry,
                            component,
                            &[MESSAGE_TYPES[message]],
                            &mut events,
                        );
                    }
                }

                for message_type in MESSAGE_TYPES {
                    if let Some(consumer) = context.active_consumer(message_type) {
                        prop_assert!(context.is_attached(consumer));
                        prop_assert!(registry.get(consumer).unwrap().can_consume(message_type));
                    }
                }
            }
        }

        /// A sticky consumer keeps its roles across any sequence of plain
        /// attaches by other components.
        #[test]
        fn sticky_roles_survive_other_attaches(
            attaches in proptest::collection::vec((0usize..3, prop::bool::ANY), 1..20)
        ) {
            let mut registry = Registry::new();
            let owner = registry
                .insert(
                    ConnectorId(1),
                    ComponentInfo::new("owner", "Owner").consumes(&[MessageType::InsertText]),
                )
                .unwrap();
            let sticky = registry
                .insert(
                    ConnectorId(1),
                    ComponentInfo::new("sticky", "Sticky")
                        .consumes(&[MessageType::ProcessKeyEvent]),
                )
                .unwrap();
            let others: Vec<ComponentId> = (0..3)
                .map(|index| {
                    registry
                        .insert(
                            ConnectorId(1),
                            ComponentInfo::new(format!("other-{}", index), "Other")
                                .consumes(&[MessageType::ProcessKeyEvent]),
                        )
                        .unwrap()
                })
                .collect();

            let mut events = Vec::new();
            let mut context = InputContext::new(IcId(1), &registry, owner, &mut events).unwrap();
            context.attach_component(
                &registry,
                sticky,
                AttachState::ActiveSticky,
                false,
                &mut events,
            );

            for (index, active) in attaches {
                let state = if active {
                    AttachState::Active
                } else {
                    AttachState::Passive
                };
                events.clear();
                context.attach_component(&registry, others[index], state, false, &mut events);
                prop_assert_eq!(
                    context.active_consumer(MessageType::ProcessKeyEvent),
                    Some(sticky)
                );
            }
        }
    }
}
