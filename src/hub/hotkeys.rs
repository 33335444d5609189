//! Built-in manager for hotkey lists and key-event interception.
//!
//! Every `SEND_KEY_EVENT` lands here first. If the key matches an active
//! hotkey list it is answered on the spot; otherwise it is re-issued as
//! `PROCESS_KEY_EVENT` under a hub-assigned serial and the eventual reply
//! is correlated back to the application with its original serial.

use std::collections::{BTreeMap, HashMap};

use log::{debug, warn};

use super::{ConnectorId, Hub};
use crate::{
    component::{ComponentId, ComponentInfo, Registry},
    context::IcId,
    keyboard::KeyEvent,
    message::{ErrorCode, Message, MessageType, ReplyMode},
};

const STRING_ID: &str = "imhub.hotkey-manager";
const NAME: &str = "Hotkey Manager";

/// Bookkeeping for one key event forwarded to an input method and not yet
/// answered.
#[derive(Clone, Copy, Debug)]
struct PendingKeyEvent {
    /// The application that sent the original `SEND_KEY_EVENT`.
    app: ComponentId,
    /// The application's serial, restored on the reply.
    serial: u32,
}

#[derive(Debug, Default)]
struct ContextKeyData {
    previous_key: Option<KeyEvent>,
    /// Keyed by the hub-assigned serial of the outgoing
    /// `PROCESS_KEY_EVENT`; ordered so discarded events fail in send
    /// order.
    pending: BTreeMap<u32, PendingKeyEvent>,
}

#[derive(Debug, Default)]
pub(crate) struct HotkeyManager {
    pub(super) connector: ConnectorId,
    pub(super) component: ComponentId,
    data: HashMap<IcId, ContextKeyData>,
    serial: u32,
}

impl HotkeyManager {
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
        .produces(&[RequestConsumer, ProcessKeyEvent, ActiveHotkeyListUpdated])
        .consumes(&[
            InputContextGotFocus,
            ActiveConsumerChanged,
            AttachToInputContext,
            DetachedFromInputContext,
            SendKeyEvent,
            AddHotkeyList,
            RemoveHotkeyList,
            CheckHotkeyConflict,
            ActivateHotkeyList,
            DeactivateHotkeyList,
            QueryActiveHotkeyList,
        ])
}

pub(super) fn handle(hub: &mut Hub, message: Message) -> bool {
    match message.message_type {
        MessageType::InputContextGotFocus => on_got_focus(hub, message),
        MessageType::ActiveConsumerChanged => on_active_consumer_changed(hub, message),
        MessageType::AttachToInputContext => on_attach_to_input_context(hub, message),
        MessageType::DetachedFromInputContext => on_detached_from_input_context(hub, message),
        MessageType::SendKeyEvent => on_send_key_event(hub, message),
        MessageType::AddHotkeyList => on_add_hotkey_list(hub, message),
        MessageType::RemoveHotkeyList => on_remove_hotkey_list(hub, message),
        MessageType::CheckHotkeyConflict => on_check_hotkey_conflict(hub, message),
        MessageType::ActivateHotkeyList => on_activate_hotkey_list(hub, message),
        MessageType::DeactivateHotkeyList => on_deactivate_hotkey_list(hub, message),
        MessageType::QueryActiveHotkeyList => on_query_active_hotkey_list(hub, message),
        MessageType::ProcessKeyEvent if message.is_reply() => {
            on_process_key_event_reply(hub, message)
        }
        other => {
            warn!("hotkey manager received unexpected {:?}", other);
            false
        }
    }
}

fn on_got_focus(hub: &mut Hub, message: Message) -> bool {
    // Reset key-matching state on focus changes so a half-entered hotkey
    // never carries over. The default context is reset too: a global hotkey
    // must not trigger across a focus move.
    let icid = message.icid;
    if let Some(data) = hub.hotkey_manager.data.get_mut(&icid) {
        data.previous_key = None;
    }
    if icid != IcId::DEFAULT {
        if let Some(data) = hub.hotkey_manager.data.get_mut(&IcId::DEFAULT) {
            data.previous_key = None;
        }
    }
    true
}

fn on_active_consumer_changed(hub: &mut Hub, message: Message) -> bool {
    let icid = message.icid;
    if icid == IcId::DEFAULT {
        return true;
    }
    // A new consumer for PROCESS_KEY_EVENT means a different input method;
    // it knows nothing about keys already in flight, so fail them.
    if message
        .payload
        .message_types
        .contains(&MessageType::ProcessKeyEvent)
    {
        discard_all_pending_key_events(hub, icid);
    }
    true
}

fn on_attach_to_input_context(hub: &mut Hub, message: Message) -> bool {
    let icid = message.icid;
    let connector = match hub.source_connector(&message) {
        Some(connector) => connector,
        None => return false,
    };
    hub.reply_true(connector, message);

    // Key events on this context will be forwarded as PROCESS_KEY_EVENT;
    // make sure somebody is there to consume them.
    if icid != IcId::DEFAULT {
        let mut request = manager_message(
            hub,
            MessageType::RequestConsumer,
            ReplyMode::NoReply,
            ComponentId::DEFAULT,
            icid,
        );
        request
            .payload
            .message_types
            .push(MessageType::ProcessKeyEvent);
        let from = hub.hotkey_manager.connector;
        hub.dispatch(from, request);
    }
    true
}

fn on_detached_from_input_context(hub: &mut Hub, message: Message) -> bool {
    let icid = message.icid;
    discard_all_pending_key_events(hub, icid);
    hub.hotkey_manager.data.remove(&icid);
    true
}

fn on_send_key_event(hub: &mut Hub, mut message: Message) -> bool {
    let connector = match hub.source_connector(&message) {
        Some(connector) => connector,
        None => return false,
    };
    let icid = match hub.input_context(message.icid) {
        Some(context) => context.id(),
        None => return hub.reply_error(connector, message, ErrorCode::InvalidInputContext),
    };
    let attached = hub
        .input_context(icid)
        .map_or(false, |context| context.is_attached(message.source));
    if !attached {
        return hub.reply_error(connector, message, ErrorCode::ComponentNotAttached);
    }
    let key = match &message.payload.key_event {
        Some(key) => key.clone(),
        None => return hub.reply_error(connector, message, ErrorCode::InvalidPayload),
    };

    if match_hotkey(hub, icid, &key) {
        return hub.reply_true(connector, message);
    }

    // No input method serves the default context.
    if icid == IcId::DEFAULT {
        return hub.reply_false(connector, message);
    }

    // Re-issue the event to the active input method under a fresh serial;
    // the application's serial is restored when the reply comes back.
    let app = message.source;
    let original_serial = message.serial;
    let serial = next_serial(hub);

    message.message_type = MessageType::ProcessKeyEvent;
    message.reply_mode = ReplyMode::NeedReply;
    message.source = hub.hotkey_manager.component;
    message.target = ComponentId::DEFAULT;
    message.icid = icid;
    message.serial = serial;

    hub.hotkey_manager
        .data
        .entry(icid)
        .or_default()
        .pending
        .insert(serial, PendingKeyEvent {
            app,
            serial: original_serial,
        });
    debug!(
        "key event pending: app {} serial {} forwarded as {} on context {}",
        app, original_serial, serial, icid
    );

    let from = hub.hotkey_manager.connector;
    hub.dispatch(from, message);
    true
}

fn on_add_hotkey_list(hub: &mut Hub, message: Message) -> bool {
    let connector = match hub.source_connector(&message) {
        Some(connector) => connector,
        None => return false,
    };
    if message.payload.hotkey_lists.is_empty() {
        return hub.reply_error(connector, message, ErrorCode::InvalidPayload);
    }

    let source = message.source;
    for hotkey_list in &message.payload.hotkey_lists {
        let list_id = hotkey_list.id;
        let contexts = match hub.registry.get_mut(source) {
            Some(component) => {
                component.add_hotkey_list(hotkey_list.clone());
                component.attached_contexts().iter().copied().collect::<Vec<_>>()
            }
            None => return false,
        };
        for icid in contexts {
            if let Some(context) = hub.input_contexts.get_mut(&icid) {
                context.component_hotkey_list_updated(source, list_id);
            }
        }
    }
    hub.reply_true(connector, message)
}

fn on_remove_hotkey_list(hub: &mut Hub, message: Message) -> bool {
    let connector = match hub.source_connector(&message) {
        Some(connector) => connector,
        None => return false,
    };
    if message.payload.uints.is_empty() {
        return hub.reply_error(connector, message, ErrorCode::InvalidPayload);
    }

    let source = message.source;
    for list_id in &message.payload.uints {
        let contexts = match hub.registry.get_mut(source) {
            Some(component) => {
                component.remove_hotkey_list(*list_id);
                component.attached_contexts().iter().copied().collect::<Vec<_>>()
            }
            None => return false,
        };
        for icid in contexts {
            if let Some(context) = hub.input_contexts.get_mut(&icid) {
                context.component_hotkey_list_removed(source, *list_id);
            }
        }
    }
    hub.reply_true(connector, message)
}

fn on_check_hotkey_conflict(hub: &mut Hub, message: Message) -> bool {
    let connector = match hub.source_connector(&message) {
        Some(connector) => connector,
        None => return false,
    };
    hub.reply_error(connector, message, ErrorCode::NotImplemented)
}

fn on_activate_hotkey_list(hub: &mut Hub, message: Message) -> bool {
    let connector = match hub.source_connector(&message) {
        Some(connector) => connector,
        None => return false,
    };
    let icid = match hub.input_context(message.icid) {
        Some(context) => context.id(),
        None => return hub.reply_error(connector, message, ErrorCode::InvalidInputContext),
    };
    let attached = hub
        .input_context(icid)
        .map_or(false, |context| context.is_attached(message.source));
    if !attached {
        return hub.reply_error(connector, message, ErrorCode::ComponentNotAttached);
    }
    let list_id = match message.payload.uints.first() {
        Some(list_id) => *list_id,
        None => return hub.reply_error(connector, message, ErrorCode::InvalidPayload),
    };
    let known = hub
        .registry
        .get(message.source)
        .map_or(false, |component| component.hotkey_list(list_id).is_some());
    if !known {
        return hub.reply_error(connector, message, ErrorCode::InvalidPayload);
    }

    if let Some(context) = hub.input_contexts.get_mut(&icid) {
        context.set_component_active_hotkey_list(message.source, list_id);
    }
    hub.reply_true(connector, message)
}

fn on_deactivate_hotkey_list(hub: &mut Hub, message: Message) -> bool {
    let connector = match hub.source_connector(&message) {
        Some(connector) => connector,
        None => return false,
    };
    let icid = match hub.input_context(message.icid) {
        Some(context) => context.id(),
        None => return hub.reply_error(connector, message, ErrorCode::InvalidInputContext),
    };
    let attached = hub
        .input_context(icid)
        .map_or(false, |context| context.is_attached(message.source));
    if !attached {
        return hub.reply_error(connector, message, ErrorCode::ComponentNotAttached);
    }

    if let Some(context) = hub.input_contexts.get_mut(&icid) {
        context.unset_component_active_hotkey_list(message.source);
    }
    hub.reply_true(connector, message)
}

fn on_query_active_hotkey_list(hub: &mut Hub, message: Message) -> bool {
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

    let lists = {
        let registry = &hub.registry;
        match hub.input_contexts.get_mut(&icid) {
            Some(context) => context
                .active_hotkey_lists(registry)
                .iter()
                .filter_map(|(component, list_id)| {
                    registry
                        .get(*component)
                        .and_then(|component| component.hotkey_list(*list_id))
                        .cloned()
                })
                .collect(),
            None => Vec::new(),
        }
    };

    message.payload = crate::message::Payload {
        hotkey_lists: lists,
        ..Default::default()
    };
    let reply = message.into_reply();
    hub.deliver(connector, reply);
    true
}

fn on_process_key_event_reply(hub: &mut Hub, mut message: Message) -> bool {
    debug!(
        "key event reply: serial {} from component {} on context {}",
        message.serial, message.source, message.icid
    );
    let connector = match hub.source_connector(&message) {
        Some(connector) => connector,
        None => return false,
    };
    let icid = match hub.input_context(message.icid) {
        Some(context) => context.id(),
        None => return hub.reply_error(connector, message, ErrorCode::InvalidInputContext),
    };

    let pending = hub
        .hotkey_manager
        .data
        .get_mut(&icid)
        .and_then(|data| data.pending.remove(&message.serial));
    let pending = match pending {
        Some(pending) => pending,
        None => return hub.reply_error(connector, message, ErrorCode::InvalidMessage),
    };

    // Rebuild the application-facing reply in place, keeping the input
    // method's payload.
    message.message_type = MessageType::SendKeyEvent;
    message.source = hub.hotkey_manager.component;
    message.target = pending.app;
    message.icid = icid;
    message.serial = pending.serial;

    let from = hub.hotkey_manager.connector;
    hub.dispatch(from, message);
    true
}

/// Matches a key event against the context's active hotkey lists, falling
/// back to the default context's (global) lists, and dispatches the
/// matched hotkey's messages on behalf of the list owner.
fn match_hotkey(hub: &mut Hub, icid: IcId, key: &KeyEvent) -> bool {
    let mut matched = match_in_context(hub, icid, key);
    set_previous_key(hub, icid, key.clone());

    if icid != IcId::DEFAULT {
        if matched.is_none() {
            matched = match_in_context(hub, IcId::DEFAULT, key);
        }
        set_previous_key(hub, IcId::DEFAULT, key.clone());
    }

    match matched {
        Some((owner, messages)) => {
            dispatch_hotkey_messages(hub, owner, messages);
            true
        }
        None => false,
    }
}

fn match_in_context(
    hub: &mut Hub,
    icid: IcId,
    key: &KeyEvent,
) -> Option<(ComponentId, Vec<Message>)> {
    let previous = hub
        .hotkey_manager
        .data
        .get(&icid)
        .and_then(|data| data.previous_key.clone());

    let registry = &hub.registry;
    let context = hub.input_contexts.get_mut(&icid)?;
    let pairs: Vec<(ComponentId, u32)> = context.active_hotkey_lists(registry).to_vec();
    find_hotkey(registry, &pairs, previous.as_ref(), key)
}

fn find_hotkey(
    registry: &Registry,
    pairs: &[(ComponentId, u32)],
    previous: Option<&KeyEvent>,
    current: &KeyEvent,
) -> Option<(ComponentId, Vec<Message>)> {
    for (owner, list_id) in pairs {
        let hotkey_list = match registry
            .get(*owner)
            .and_then(|component| component.hotkey_list(*list_id))
        {
            Some(hotkey_list) => hotkey_list,
            None => continue,
        };
        if let Some(hotkey) = hotkey_list.matches(previous, current) {
            return Some((hotkey_list.owner, hotkey.messages.clone()));
        }
    }
    None
}

fn set_previous_key(hub: &mut Hub, icid: IcId, key: KeyEvent) {
    hub.hotkey_manager.data.entry(icid).or_default().previous_key = Some(key);
}

/// The hotkey's messages go out as if the list's owner had sent them.
fn dispatch_hotkey_messages(hub: &mut Hub, owner: ComponentId, messages: Vec<Message>) {
    let connector = match hub.registry.get(owner) {
        Some(component) => component.connector(),
        None => return,
    };
    for message in messages {
        debug!("dispatching hotkey message {:?}", message.message_type);
        hub.dispatch(connector, message);
    }
}

/// Fails every in-flight key event of `icid` back to its sender.
fn discard_all_pending_key_events(hub: &mut Hub, icid: IcId) {
    let pending: Vec<PendingKeyEvent> = match hub.hotkey_manager.data.get_mut(&icid) {
        Some(data) => std::mem::take(&mut data.pending).into_values().collect(),
        None => return,
    };
    for entry in pending {
        let mut reply = manager_message(
            hub,
            MessageType::SendKeyEvent,
            ReplyMode::IsReply,
            entry.app,
            icid,
        );
        reply.serial = entry.serial;
        reply.payload.booleans.push(false);
        let from = hub.hotkey_manager.connector;
        hub.dispatch(from, reply);
    }
}

fn next_serial(hub: &mut Hub) -> u32 {
    let serial = hub.hotkey_manager.serial;
    hub.hotkey_manager.serial = hub.hotkey_manager.serial.wrapping_add(1);
    serial
}

fn manager_message(
    hub: &mut Hub,
    message_type: MessageType,
    reply_mode: ReplyMode,
    target: ComponentId,
    icid: IcId,
) -> Message {
    let serial = if reply_mode == ReplyMode::IsReply {
        0
    } else {
        next_serial(hub)
    };
    Message::new(message_type)
        .with_reply_mode(reply_mode)
        .with_source(hub.hotkey_manager.component)
        .with_target(target)
        .with_icid(icid)
        .with_serial(serial)
}
