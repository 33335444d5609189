//! Built-in manager for input-method enumeration and switching.
//!
//! Switching is asynchronous: the current input method is asked to cancel
//! its composition, the target is asked to attach, and only when the
//! target is both attached and the active consumer for `PROCESS_KEY_EVENT`
//! is the switch complete. For the duration, a scoped message cache —
//! itself a synthetic component attached sticky to the context — soaks up
//! input-method-bound traffic and replays it in order once the new input
//! method is in place.

use std::collections::{HashMap, VecDeque};

use log::{debug, warn};

use super::{ConnectorId, Endpoint, Hub};
use crate::{
    component::{ComponentId, ComponentInfo},
    context::{AttachState, IcId},
    message::{ErrorCode, Message, MessageType, ReplyMode},
};

const STRING_ID: &str = "imhub.input-method-manager";
const NAME: &str = "Input Method Manager";

/// Message types soaked up by the switch cache.
///
/// `PROCESS_KEY_EVENT` is deliberately absent: caching it would keep the
/// target input method from ever becoming its active consumer.
const CACHED_MESSAGE_TYPES: [MessageType; 7] = [
    MessageType::SendKeyEvent,
    MessageType::CancelComposition,
    MessageType::CompleteComposition,
    MessageType::SwitchToInputMethod,
    MessageType::SwitchToNextInputMethodInList,
    MessageType::SwitchToPreviousInputMethod,
    MessageType::QueryActiveInputMethod,
];

/// The capability set that makes a component an input method.
const INPUT_METHOD_MESSAGES: [MessageType; 4] = [
    MessageType::AttachToInputContext,
    MessageType::ProcessKeyEvent,
    MessageType::CancelComposition,
    MessageType::CompleteComposition,
];

/// State of one in-flight switch on one context.
#[derive(Debug)]
struct SwitchingData {
    target: ComponentId,
    needs_activated: bool,
    needs_attached: bool,
    cache_connector: ConnectorId,
    cache_component: ComponentId,
    queue: VecDeque<Message>,
}

#[derive(Debug, Default)]
pub(crate) struct InputMethodManager {
    pub(super) connector: ConnectorId,
    pub(super) component: ComponentId,
    /// Every registered input method, ordered by component id.
    input_methods: Vec<ComponentId>,
    /// Current and previous input method per context, tracked by string id
    /// so the record survives re-registration.
    current: HashMap<IcId, String>,
    previous: HashMap<IcId, String>,
    switching: HashMap<IcId, SwitchingData>,
    cache_seq: u32,
}

impl InputMethodManager {
    pub(super) fn new(connector: ConnectorId, component: ComponentId) -> Self {
        Self {
            connector,
            component,
            ..Self::default()
        }
    }
}

pub(super) fn manager_info() -> ComponentInfo {
    use MessageType::*;
    ComponentInfo::new(STRING_ID, NAME)
        .produces(&[InputMethodActivated, CancelComposition])
        .consumes(&[
            ComponentCreated,
            ComponentDeleted,
            InputContextCreated,
            InputContextDeleted,
            ComponentAttached,
            ActiveConsumerChanged,
            ListInputMethods,
            SwitchToInputMethod,
            SwitchToNextInputMethodInList,
            SwitchToPreviousInputMethod,
            QueryActiveInputMethod,
        ])
}

pub(super) fn handle(hub: &mut Hub, message: Message) -> bool {
    match message.message_type {
        MessageType::ComponentCreated => on_component_created(hub, message),
        MessageType::ComponentDeleted => on_component_deleted(hub, message),
        MessageType::InputContextCreated => on_input_context_created(hub, message),
        MessageType::InputContextDeleted => on_input_context_deleted(hub, message),
        MessageType::ComponentAttached => on_component_attached(hub, message),
        MessageType::ActiveConsumerChanged => on_active_consumer_changed(hub, message),
        MessageType::ListInputMethods => on_list_input_methods(hub, message),
        MessageType::SwitchToInputMethod => on_switch_to_input_method(hub, message),
        MessageType::SwitchToNextInputMethodInList => on_switch_to_next(hub, message),
        MessageType::SwitchToPreviousInputMethod => on_switch_to_previous(hub, message),
        MessageType::QueryActiveInputMethod => on_query_active_input_method(hub, message),
        MessageType::CancelComposition if message.is_reply() => {
            on_cancel_composition_reply(hub, message)
        }
        other => {
            warn!("input-method manager received unexpected {:?}", other);
            false
        }
    }
}

/// Inbox of a switch cache component: everything that arrives is queued.
pub(super) fn cache_send(hub: &mut Hub, icid: IcId, message: Message) -> bool {
    match hub.input_method_manager.switching.get_mut(&icid) {
        Some(data) => {
            debug!(
                "caching {:?} during input-method switch on context {}",
                message.message_type, icid
            );
            data.queue.push_back(message);
            true
        }
        None => false,
    }
}

fn is_input_method(hub: &Hub, id: ComponentId) -> bool {
    hub.is_component_valid(id)
        && hub.registry.get(id).map_or(false, |component| {
            INPUT_METHOD_MESSAGES
                .iter()
                .all(|message_type| component.can_consume(*message_type))
        })
}

fn on_component_created(hub: &mut Hub, message: Message) -> bool {
    let id = match message.payload.component_infos.first() {
        Some(info) => info.id,
        None => return false,
    };
    if !is_input_method(hub, id) {
        return true;
    }
    let input_methods = &mut hub.input_method_manager.input_methods;
    if let Err(position) = input_methods.binary_search(&id) {
        input_methods.insert(position, id);
        debug!("input method {} registered", id);
    }
    true
}

fn on_component_deleted(hub: &mut Hub, message: Message) -> bool {
    let id = match message.payload.component_ids.first() {
        Some(id) => *id,
        None => return false,
    };
    let input_methods = &mut hub.input_method_manager.input_methods;
    if let Ok(position) = input_methods.binary_search(&id) {
        input_methods.remove(position);
        debug!("input method {} deregistered", id);
    }

    // Switches waiting for the deleted input method can never complete;
    // drop their caches so nothing replays against a dead target.
    let stalled: Vec<IcId> = hub
        .input_method_manager
        .switching
        .iter()
        .filter(|(_, data)| data.target == id)
        .map(|(icid, _)| *icid)
        .collect();
    for icid in stalled {
        teardown_switching(hub, icid, true);
    }
    true
}

fn on_input_context_created(hub: &mut Hub, message: Message) -> bool {
    let icid = match &message.payload.context_info {
        Some(info) => info.id,
        None => return false,
    };
    let manager = hub.input_method_manager.component;
    hub.attach_to_input_context(manager, icid, AttachState::ActiveSticky, true);
    true
}

fn on_input_context_deleted(hub: &mut Hub, message: Message) -> bool {
    let icid = match message.payload.context_ids.first() {
        Some(icid) => *icid,
        None => return false,
    };
    hub.input_method_manager.current.remove(&icid);
    hub.input_method_manager.previous.remove(&icid);
    teardown_switching(hub, icid, true);
    true
}

fn on_component_attached(hub: &mut Hub, message: Message) -> bool {
    let (icid, component) = match (
        message.payload.context_ids.first(),
        message.payload.component_ids.first(),
    ) {
        (Some(icid), Some(component)) => (*icid, *component),
        _ => return false,
    };
    update_switching(hub, icid, component, SwitchStep::Attached);
    true
}

fn on_active_consumer_changed(hub: &mut Hub, message: Message) -> bool {
    if !message
        .payload
        .message_types
        .contains(&MessageType::ProcessKeyEvent)
    {
        return true;
    }
    let icid = match hub.input_context(message.icid) {
        Some(context) => context.id(),
        None => return true,
    };

    let current = current_input_method(hub, icid);
    let current_string_id = current.and_then(|id| {
        hub.registry
            .get(id)
            .map(|component| component.string_id().to_owned())
    });

    match hub.input_method_manager.current.get(&icid).cloned() {
        Some(recorded) => {
            if current_string_id.as_deref() == Some(recorded.as_str()) {
                return true;
            }
            hub.input_method_manager.previous.insert(icid, recorded);
        }
        None => {
            // First input method on this context: seed its history from the
            // global record so "previous" means something immediately.
            if icid != IcId::DEFAULT {
                if let Some(global) =
                    hub.input_method_manager.previous.get(&IcId::DEFAULT).cloned()
                {
                    hub.input_method_manager.previous.insert(icid, global);
                }
            }
        }
    }
    if let Some(string_id) = &current_string_id {
        hub.input_method_manager
            .current
            .insert(icid, string_id.clone());
    }

    let announce = hub.input_context(icid).map_or(false, |context| {
        context.may_consume(&hub.registry, MessageType::InputMethodActivated, false)
    });
    if announce {
        let mut announcement = Message::new(MessageType::InputMethodActivated)
            .with_source(hub.input_method_manager.component)
            .with_target(ComponentId::BROADCAST)
            .with_icid(icid);
        if let Some(component) = current.and_then(|id| hub.registry.get(id)) {
            announcement
                .payload
                .component_infos
                .push(component.info().clone());
        }
        let from = hub.input_method_manager.connector;
        hub.dispatch(from, announcement);
    }

    if let Some(current) = current {
        update_switching(hub, icid, current, SwitchStep::Activated);
    }
    true
}

fn on_list_input_methods(hub: &mut Hub, message: Message) -> bool {
    let connector = match hub.source_connector(&message) {
        Some(connector) => connector,
        None => return false,
    };
    let message = match hub.check_needs_reply(connector, message) {
        Some(message) => message,
        None => return true,
    };
    let mut message = match hub.check_input_context(connector, message) {
        Some(message) => message,
        None => return true,
    };

    let ids = hub.input_method_manager.input_methods.clone();
    message.payload = Default::default();
    for id in ids {
        if let Some(component) = hub.registry.get(id) {
            if hub.is_connector_attached(component.connector()) {
                message.payload.component_infos.push(component.info().clone());
                message.payload.booleans.push(true);
            }
        }
    }

    let reply = message.into_reply();
    hub.deliver(connector, reply);
    true
}

fn on_switch_to_input_method(hub: &mut Hub, message: Message) -> bool {
    let connector = match hub.source_connector(&message) {
        Some(connector) => connector,
        None => return false,
    };
    let icid = match hub.input_context(message.icid) {
        Some(context) => context.id(),
        None => return hub.reply_error(connector, message, ErrorCode::InvalidInputContext),
    };

    // The target is named either by component id or by string id, never
    // both.
    let by_id = &message.payload.component_ids;
    let by_string = &message.payload.strings;
    if by_id.is_empty() == by_string.is_empty() {
        return hub.reply_error(connector, message, ErrorCode::InvalidPayload);
    }
    let target = if let Some(id) = by_id.first() {
        Some(*id)
    } else {
        by_string
            .first()
            .and_then(|string_id| hub.registry.id_by_string_id(string_id))
    };
    let target = match target {
        Some(target) if is_input_method(hub, target) => target,
        _ => return hub.reply_error(connector, message, ErrorCode::InvalidPayload),
    };

    let result = switch_to_input_method(hub, icid, target);
    hub.reply_boolean(connector, message, result)
}

fn on_switch_to_next(hub: &mut Hub, message: Message) -> bool {
    let connector = match hub.source_connector(&message) {
        Some(connector) => connector,
        None => return false,
    };
    let icid = match hub.input_context(message.icid) {
        Some(context) => context.id(),
        None => return hub.reply_error(connector, message, ErrorCode::InvalidInputContext),
    };
    let result = match next_input_method_in_list(hub, icid) {
        Some(target) => switch_to_input_method(hub, icid, target),
        None => false,
    };
    hub.reply_boolean(connector, message, result)
}

fn on_switch_to_previous(hub: &mut Hub, message: Message) -> bool {
    let connector = match hub.source_connector(&message) {
        Some(connector) => connector,
        None => return false,
    };
    let icid = match hub.input_context(message.icid) {
        Some(context) => context.id(),
        None => return hub.reply_error(connector, message, ErrorCode::InvalidInputContext),
    };
    let result = match previous_input_method(hub, icid) {
        Some(target) => switch_to_input_method(hub, icid, target),
        None => false,
    };
    hub.reply_boolean(connector, message, result)
}

fn on_query_active_input_method(hub: &mut Hub, message: Message) -> bool {
    let connector = match hub.source_connector(&message) {
        Some(connector) => connector,
        None => return false,
    };
    let mut message = match hub.check_needs_reply(connector, message) {
        Some(message) => message,
        None => return true,
    };
    let icid = match hub.input_context(message.icid) {
        Some(context) => context.id(),
        None => return hub.reply_error(connector, message, ErrorCode::InvalidInputContext),
    };
    let info = match current_input_method(hub, icid).and_then(|id| hub.registry.get(id)) {
        Some(component) => component.info().clone(),
        None => return hub.reply_error(connector, message, ErrorCode::ComponentNotFound),
    };

    message.payload = Default::default();
    message.payload.component_infos.push(info);
    let reply = message.into_reply();
    hub.deliver(connector, reply);
    true
}

fn on_cancel_composition_reply(hub: &mut Hub, message: Message) -> bool {
    let icid = match hub.input_context(message.icid) {
        Some(context) => context.id(),
        None => return false,
    };
    let target = match hub.input_method_manager.switching.get(&icid) {
        Some(data) => data.target,
        None => return true,
    };
    switch_after_cancel_composition(hub, icid, target);
    true
}

// Switch mechanics.

fn current_input_method(hub: &Hub, icid: IcId) -> Option<ComponentId> {
    hub.input_contexts
        .get(&icid)?
        .active_consumer(MessageType::ProcessKeyEvent)
}

fn next_input_method_in_list(hub: &Hub, icid: IcId) -> Option<ComponentId> {
    let all = &hub.input_method_manager.input_methods;
    if all.is_empty() {
        return None;
    }
    let current = current_input_method(hub, icid).unwrap_or(ComponentId::DEFAULT);
    let pivot = all.partition_point(|id| *id <= current);
    all[pivot..]
        .iter()
        .chain(all[..pivot].iter())
        .copied()
        .find(|id| is_input_method(hub, *id))
}

fn previous_input_method(hub: &Hub, icid: IcId) -> Option<ComponentId> {
    let recorded = hub.input_method_manager.previous.get(&icid);
    let candidate = recorded
        .and_then(|string_id| hub.registry.id_by_string_id(string_id))
        .filter(|id| is_input_method(hub, *id));
    candidate.or_else(|| next_input_method_in_list(hub, icid))
}

fn switch_to_input_method(hub: &mut Hub, icid: IcId, target: ComponentId) -> bool {
    debug!("switching context {} to input method {}", icid, target);

    let current = current_input_method(hub, icid);
    if current == Some(target) {
        return true;
    }

    create_switching_data(hub, icid, target);

    let cancel_target = current.filter(|id| {
        icid != IcId::DEFAULT
            && hub.is_component_valid(*id)
            && hub
                .registry
                .get(*id)
                .map_or(false, |c| c.can_consume(MessageType::CancelComposition))
    });
    match cancel_target {
        Some(current) => {
            // Let the outgoing input method settle first; the switch
            // resumes when its reply arrives.
            let connector = match hub.registry.get(current) {
                Some(component) => component.connector(),
                None => return false,
            };
            let message = Message::new(MessageType::CancelComposition)
                .with_reply_mode(ReplyMode::NeedReply)
                .with_source(hub.input_method_manager.component)
                .with_target(current)
                .with_icid(icid);
            hub.deliver(connector, message);
            true
        }
        None => switch_after_cancel_composition(hub, icid, target),
    }
}

fn switch_after_cancel_composition(hub: &mut Hub, icid: IcId, target: ComponentId) -> bool {
    let state = hub.request_attach_to_input_context(target, icid, AttachState::Active, false);
    let success = state.is_some();
    if !success {
        teardown_switching(hub, icid, false);
    }

    // Optionally mirror the choice everywhere the manager serves.
    if success && hub.options.global_input_method {
        let contexts: Vec<IcId> = hub
            .registry
            .get(hub.input_method_manager.component)
            .map(|component| component.attached_contexts().iter().copied().collect())
            .unwrap_or_default();
        for other in contexts {
            if other != icid {
                hub.request_attach_to_input_context(target, other, AttachState::Active, false);
            }
        }
    }
    success
}

fn create_switching_data(hub: &mut Hub, icid: IcId, target: ComponentId) {
    let needs_attached = !matches!(
        hub.input_contexts
            .get(&icid)
            .and_then(|context| context.attach_state(target)),
        Some(AttachState::Active) | Some(AttachState::ActiveSticky)
    );

    // Step aside for the cache: resign our own claims on the cached types
    // so the sticky cache component can take every one of them.
    let manager = hub.input_method_manager.component;
    let mut events = Vec::new();
    {
        let registry = &hub.registry;
        if let (Some(component), Some(context)) =
            (registry.get(manager), hub.input_contexts.get_mut(&icid))
        {
            context.resign_active_consumer(registry, component, &CACHED_MESSAGE_TYPES, &mut events);
        }
    }
    hub.process_context_events(icid, events);

    let seq = hub.input_method_manager.cache_seq;
    hub.input_method_manager.cache_seq = seq.wrapping_add(1);
    let cache_connector = hub.attach_endpoint(Endpoint::SwitchCache(icid));
    let cache_info = ComponentInfo::new(
        format!("imhub.switch-cache.{}.{}", icid, seq),
        "Input Method Switch Cache",
    )
    .consumes(&CACHED_MESSAGE_TYPES);
    let cache_component = hub
        .create_component(cache_connector, cache_info, false)
        .unwrap_or(ComponentId::DEFAULT);
    if cache_component != ComponentId::DEFAULT {
        hub.attach_to_input_context(cache_component, icid, AttachState::ActiveSticky, true);
    }

    hub.input_method_manager.switching.insert(
        icid,
        SwitchingData {
            target,
            needs_activated: true,
            needs_attached,
            cache_connector,
            cache_component,
            queue: VecDeque::new(),
        },
    );
}

#[derive(Clone, Copy, Debug)]
enum SwitchStep {
    Attached,
    Activated,
}

fn update_switching(hub: &mut Hub, icid: IcId, component: ComponentId, step: SwitchStep) {
    let done = match hub.input_method_manager.switching.get_mut(&icid) {
        Some(data) => {
            if data.target == component {
                match step {
                    SwitchStep::Attached => data.needs_attached = false,
                    SwitchStep::Activated => data.needs_activated = false,
                }
            }
            !data.needs_attached && !data.needs_activated
        }
        None => return,
    };
    if done {
        teardown_switching(hub, icid, false);
    }
}

/// Dismantles the switch state for `icid`. The manager takes its consumer
/// roles back, the cache component disappears, and the queued messages are
/// replayed through the router in arrival order — or dropped when
/// `discard` is set or the context is gone.
fn teardown_switching(hub: &mut Hub, icid: IcId, discard: bool) {
    let data = match hub.input_method_manager.switching.remove(&icid) {
        Some(data) => data,
        None => return,
    };

    let context_alive = hub.input_contexts.contains_key(&icid);
    if context_alive {
        let manager = hub.input_method_manager.component;
        let mut events = Vec::new();
        {
            let registry = &hub.registry;
            if let (Some(component), Some(context)) =
                (registry.get(manager), hub.input_contexts.get_mut(&icid))
            {
                context.assign_active_consumer(
                    registry,
                    component,
                    &CACHED_MESSAGE_TYPES,
                    &mut events,
                );
            }
        }
        hub.process_context_events(icid, events);
    }

    if data.cache_component != ComponentId::DEFAULT {
        hub.delete_component(data.cache_connector, data.cache_component);
    }
    hub.connectors.remove(&data.cache_connector);

    if discard || !context_alive {
        if !data.queue.is_empty() {
            debug!(
                "discarding {} cached message(s) for context {}",
                data.queue.len(),
                icid
            );
        }
        return;
    }

    for mut message in data.queue {
        message.target = ComponentId::DEFAULT;
        let from = match hub.registry.get(message.source) {
            Some(component) => component.connector(),
            None => continue,
        };
        hub.dispatch(from, message);
    }
}
