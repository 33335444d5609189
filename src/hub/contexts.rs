//! Built-in manager servicing input-context lifecycle and active-consumer
//! control messages.

use log::warn;

use super::Hub;
use crate::{
    component::{ComponentId, ComponentInfo},
    context::{AttachState, IcId},
    message::{ErrorCode, Message, MessageType, Payload},
};

const STRING_ID: &str = "imhub.input-context-manager";
const NAME: &str = "Input Context Manager";

/// The manager never originates messages of its own, so unlike its sibling
/// managers it only needs to know its component identity.
#[derive(Debug, Default)]
pub(crate) struct ContextManager {
    pub(super) component: ComponentId,
}

impl ContextManager {
    pub(super) fn new(component: ComponentId) -> Self {
        Self { component }
    }
}

pub(super) fn manager_info() -> ComponentInfo {
    use MessageType::*;
    ComponentInfo::new(STRING_ID, NAME).consumes(&[
        CreateInputContext,
        DeleteInputContext,
        AttachToInputContext,
        DetachFromInputContext,
        QueryInputContext,
        FocusInputContext,
        BlurInputContext,
        ActivateComponent,
        AssignActiveConsumer,
        ResignActiveConsumer,
        QueryActiveConsumer,
        RequestConsumer,
    ])
}

pub(super) fn handle(hub: &mut Hub, message: Message) -> bool {
    match message.message_type {
        MessageType::CreateInputContext => on_create_input_context(hub, message),
        MessageType::DeleteInputContext => on_delete_input_context(hub, message),
        MessageType::AttachToInputContext => on_attach_to_input_context(hub, message),
        MessageType::DetachFromInputContext => on_detach_from_input_context(hub, message),
        MessageType::QueryInputContext => on_query_input_context(hub, message),
        MessageType::FocusInputContext => on_focus_input_context(hub, message),
        MessageType::BlurInputContext => on_blur_input_context(hub, message),
        MessageType::ActivateComponent => on_activate_component(hub, message),
        MessageType::AssignActiveConsumer => on_assign_active_consumer(hub, message),
        MessageType::ResignActiveConsumer => on_resign_active_consumer(hub, message),
        MessageType::QueryActiveConsumer => on_query_active_consumer(hub, message),
        MessageType::RequestConsumer => on_request_consumer(hub, message),
        other => {
            warn!("input-context manager received unexpected {:?}", other);
            false
        }
    }
}

fn on_create_input_context(hub: &mut Hub, message: Message) -> bool {
    let connector = match hub.source_connector(&message) {
        Some(connector) => connector,
        None => return false,
    };
    let mut message = match hub.check_needs_reply(connector, message) {
        Some(message) => message,
        None => return true,
    };

    let icid = match hub.create_input_context(message.source) {
        Some(icid) => icid,
        None => return hub.reply_error(connector, message, ErrorCode::InvalidMessage),
    };

    // The manager serves every context it creates.
    let manager = hub.context_manager.component;
    hub.attach_to_input_context(manager, icid, AttachState::ActiveSticky, true);

    message.icid = icid;
    hub.reply_true(connector, message)
}

fn on_delete_input_context(hub: &mut Hub, message: Message) -> bool {
    let connector = match hub.source_connector(&message) {
        Some(connector) => connector,
        None => return false,
    };
    if hub.delete_input_context(message.source, message.icid) {
        hub.reply_true(connector, message)
    } else {
        hub.reply_error(connector, message, ErrorCode::InvalidInputContext)
    }
}

fn on_attach_to_input_context(hub: &mut Hub, message: Message) -> bool {
    let connector = match hub.source_connector(&message) {
        Some(connector) => connector,
        None => return false,
    };
    let (icid, old_state) = match hub.input_context(message.icid) {
        Some(context) => (context.id(), context.attach_state(message.source)),
        None => return hub.reply_error(connector, message, ErrorCode::InvalidInputContext),
    };

    // A plain attach request lands passively; a pending component is
    // promoted to whatever role it was promised.
    let state = match old_state {
        None | Some(AttachState::PendingPassive) => AttachState::Passive,
        Some(AttachState::PendingActive) => AttachState::Active,
        Some(current) => current,
    };

    if hub.attach_to_input_context(message.source, icid, state, true) {
        hub.reply_true(connector, message)
    } else {
        hub.reply_error(connector, message, ErrorCode::InvalidInputContext)
    }
}

fn on_detach_from_input_context(hub: &mut Hub, message: Message) -> bool {
    let connector = match hub.source_connector(&message) {
        Some(connector) => connector,
        None => return false,
    };
    let icid = match hub.input_context(message.icid) {
        Some(context) => context.id(),
        None => return hub.reply_error(connector, message, ErrorCode::InvalidInputContext),
    };
    if hub.detach_component(message.source, icid) {
        hub.reply_true(connector, message)
    } else {
        hub.reply_error(connector, message, ErrorCode::InvalidInputContext)
    }
}

fn on_query_input_context(hub: &mut Hub, message: Message) -> bool {
    let connector = match hub.source_connector(&message) {
        Some(connector) => connector,
        None => return false,
    };
    let mut message = match hub.check_needs_reply(connector, message) {
        Some(message) => message,
        None => return true,
    };
    let info = match hub.input_context(message.icid) {
        Some(context) => context.info(),
        None => return hub.reply_error(connector, message, ErrorCode::InvalidInputContext),
    };

    message.payload = Payload {
        context_info: Some(info),
        ..Payload::default()
    };
    let reply = message.into_reply();
    hub.deliver(connector, reply);
    true
}

fn on_focus_input_context(hub: &mut Hub, message: Message) -> bool {
    let connector = match hub.source_connector(&message) {
        Some(connector) => connector,
        None => return false,
    };
    let icid = match hub.input_context(message.icid) {
        Some(context) if context.owner() == message.source => context.id(),
        _ => return hub.reply_error(connector, message, ErrorCode::InvalidInputContext),
    };
    if hub.focus_input_context(icid) {
        hub.reply_true(connector, message)
    } else {
        hub.reply_error(connector, message, ErrorCode::InvalidInputContext)
    }
}

fn on_blur_input_context(hub: &mut Hub, message: Message) -> bool {
    let connector = match hub.source_connector(&message) {
        Some(connector) => connector,
        None => return false,
    };
    let icid = match hub.input_context(message.icid) {
        Some(context) if context.owner() == message.source => context.id(),
        _ => return hub.reply_error(connector, message, ErrorCode::InvalidInputContext),
    };
    if hub.blur_input_context(icid) {
        hub.reply_true(connector, message)
    } else {
        hub.reply_error(connector, message, ErrorCode::InvalidInputContext)
    }
}

fn on_activate_component(hub: &mut Hub, message: Message) -> bool {
    let connector = match hub.source_connector(&message) {
        Some(connector) => connector,
        None => return false,
    };
    let icid = match hub.input_context(message.icid) {
        Some(context) => context.id(),
        None => return hub.reply_error(connector, message, ErrorCode::InvalidInputContext),
    };

    // No payload: the source asks to activate itself and may be attached
    // implicitly along the way.
    if message.payload.is_empty() {
        let state = hub.request_attach_to_input_context(
            message.source,
            icid,
            AttachState::Active,
            true,
        );
        return hub.reply_boolean(connector, message, state.is_some());
    }

    if message.payload.component_ids.is_empty() && message.payload.strings.is_empty() {
        return hub.reply_error(connector, message, ErrorCode::InvalidPayload);
    }

    // Otherwise each named component is asked to activate; implicit attach
    // is only allowed for the source itself.
    let mut results = Vec::new();
    let ids = message.payload.component_ids.clone();
    for id in ids {
        let activated = hub.is_component_valid(id)
            && hub
                .request_attach_to_input_context(
                    id,
                    icid,
                    AttachState::Active,
                    id == message.source,
                )
                .is_some();
        results.push(activated);
    }
    let string_ids = message.payload.strings.clone();
    for string_id in string_ids {
        let id = hub.registry.id_by_string_id(&string_id);
        let activated = match id {
            Some(id) => hub
                .request_attach_to_input_context(
                    id,
                    icid,
                    AttachState::Active,
                    id == message.source,
                )
                .is_some(),
            None => false,
        };
        results.push(activated);
    }

    if !message.needs_reply() {
        return true;
    }
    let mut message = message;
    message.payload = Payload {
        booleans: results,
        ..Payload::default()
    };
    let reply = message.into_reply();
    hub.deliver(connector, reply);
    true
}

fn on_assign_active_consumer(hub: &mut Hub, message: Message) -> bool {
    on_consumer_transfer(hub, message, true)
}

fn on_resign_active_consumer(hub: &mut Hub, message: Message) -> bool {
    on_consumer_transfer(hub, message, false)
}

fn on_consumer_transfer(hub: &mut Hub, message: Message, assign: bool) -> bool {
    let connector = match hub.source_connector(&message) {
        Some(connector) => connector,
        None => return false,
    };
    if message.payload.message_types.is_empty() {
        return hub.reply_error(connector, message, ErrorCode::InvalidPayload);
    }
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

    let mut events = Vec::new();
    {
        let registry = &hub.registry;
        let component = match registry.get(message.source) {
            Some(component) => component,
            None => return false,
        };
        let context = match hub.input_contexts.get_mut(&icid) {
            Some(context) => context,
            None => return false,
        };
        if assign {
            context.assign_active_consumer(
                registry,
                component,
                &message.payload.message_types,
                &mut events,
            );
        } else {
            context.resign_active_consumer(
                registry,
                component,
                &message.payload.message_types,
                &mut events,
            );
        }
    }
    hub.process_context_events(icid, events);
    hub.reply_true(connector, message)
}

fn on_query_active_consumer(hub: &mut Hub, message: Message) -> bool {
    let connector = match hub.source_connector(&message) {
        Some(connector) => connector,
        None => return false,
    };
    let mut message = match hub.check_needs_reply(connector, message) {
        Some(message) => message,
        None => return true,
    };
    if message.payload.message_types.is_empty() {
        return hub.reply_error(connector, message, ErrorCode::InvalidPayload);
    }
    let consumers: Vec<ComponentId> = match hub.input_context(message.icid) {
        Some(context) => message
            .payload
            .message_types
            .iter()
            .map(|message_type| {
                context
                    .active_consumer(*message_type)
                    .unwrap_or(ComponentId::BROADCAST)
            })
            .collect(),
        None => return hub.reply_error(connector, message, ErrorCode::InvalidInputContext),
    };

    message.payload = Payload {
        component_ids: consumers,
        ..Payload::default()
    };
    let reply = message.into_reply();
    hub.deliver(connector, reply);
    true
}

fn on_request_consumer(hub: &mut Hub, message: Message) -> bool {
    let connector = match hub.source_connector(&message) {
        Some(connector) => connector,
        None => return false,
    };
    let icid = match hub.input_context(message.icid) {
        Some(context) if context.id() != IcId::DEFAULT => context.id(),
        _ => return hub.reply_error(connector, message, ErrorCode::InvalidInputContext),
    };
    if message.payload.message_types.is_empty() {
        return hub.reply_error(connector, message, ErrorCode::InvalidPayload);
    }
    let known = hub
        .input_context(icid)
        .map_or(false, |context| context.attach_state(message.source).is_some());
    if !known {
        return hub.reply_error(connector, message, ErrorCode::ComponentNotAttached);
    }

    let mut events = Vec::new();
    let already_have = {
        let registry = &hub.registry;
        let component = match registry.get(message.source) {
            Some(component) => component,
            None => return false,
        };
        let context = match hub.input_contexts.get_mut(&icid) {
            Some(context) => context,
            None => return false,
        };
        context.set_messages_need_consumer(
            registry,
            component,
            &message.payload.message_types,
            &mut events,
        )
    };
    hub.process_context_events(icid, events);

    if !message.needs_reply() {
        return true;
    }
    let mut message = message;
    message.payload = Payload {
        booleans: vec![true],
        message_types: already_have,
        ..Payload::default()
    };
    let reply = message.into_reply();
    hub.deliver(connector, reply);
    true
}
