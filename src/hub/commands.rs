//! Built-in manager aggregating per-component command lists (menus,
//! toolbar entries) for each input context.

use std::collections::{BTreeMap, HashMap};

use log::warn;

use super::{ConnectorId, Hub};
use crate::{
    component::{ComponentId, ComponentInfo},
    context::{AttachState, IcId},
    message::{Command, CommandList, ErrorCode, Message, MessageType},
};

const STRING_ID: &str = "imhub.command-list-manager";
const NAME: &str = "Command List Manager";

#[derive(Debug, Default)]
pub(crate) struct CommandListManager {
    pub(super) connector: ConnectorId,
    pub(super) component: ComponentId,
    /// Last declared command list per (context, component), in component-id
    /// order so aggregated queries and broadcasts are stable.
    command_lists: HashMap<IcId, BTreeMap<ComponentId, CommandList>>,
}

impl CommandListManager {
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
        .produces(&[CommandListChanged])
        .consumes(&[
            InputContextCreated,
            InputContextDeleted,
            ComponentDetached,
            SetCommandList,
            UpdateCommands,
            QueryCommandList,
        ])
}

pub(super) fn handle(hub: &mut Hub, message: Message) -> bool {
    match message.message_type {
        MessageType::InputContextCreated => on_input_context_created(hub, message),
        MessageType::InputContextDeleted => on_input_context_deleted(hub, message),
        MessageType::ComponentDetached => on_component_detached(hub, message),
        MessageType::SetCommandList => on_set_command_list(hub, message),
        MessageType::UpdateCommands => on_update_commands(hub, message),
        MessageType::QueryCommandList => on_query_command_list(hub, message),
        other => {
            warn!("command-list manager received unexpected {:?}", other);
            false
        }
    }
}

fn on_input_context_created(hub: &mut Hub, message: Message) -> bool {
    let icid = match &message.payload.context_info {
        Some(info) => info.id,
        None => return false,
    };
    let manager = hub.command_list_manager.component;
    hub.attach_to_input_context(manager, icid, AttachState::ActiveSticky, true);
    true
}

fn on_input_context_deleted(hub: &mut Hub, message: Message) -> bool {
    let icid = match message.payload.context_ids.first() {
        Some(icid) => *icid,
        None => return false,
    };
    hub.command_list_manager.command_lists.remove(&icid);
    true
}

fn on_component_detached(hub: &mut Hub, message: Message) -> bool {
    let (icid, component) = match (
        message.payload.context_ids.first(),
        message.payload.component_ids.first(),
    ) {
        (Some(icid), Some(component)) => (*icid, *component),
        _ => return false,
    };
    delete_command_list(hub, icid, component);
    true
}

fn on_set_command_list(hub: &mut Hub, message: Message) -> bool {
    let connector = match hub.source_connector(&message) {
        Some(connector) => connector,
        None => return false,
    };
    let mut message = match hub.check_source_attached(connector, message) {
        Some(message) => message,
        None => return true,
    };

    let icid = message.icid;
    let source = message.source;

    let empty = message
        .payload
        .command_lists
        .first()
        .map_or(true, |list| list.commands.is_empty());
    if empty {
        delete_command_list(hub, icid, source);
        return hub.reply_true(connector, message);
    }

    let mut list = message.payload.command_lists.remove(0);
    set_command_list_owner(source, &mut list);
    hub.command_list_manager
        .command_lists
        .entry(icid)
        .or_default()
        .insert(source, list);

    broadcast_command_list_changed(hub, icid, source);
    hub.reply_true(connector, message)
}

fn on_update_commands(hub: &mut Hub, message: Message) -> bool {
    let connector = match hub.source_connector(&message) {
        Some(connector) => connector,
        None => return false,
    };
    let mut message = match hub.check_source_attached(connector, message) {
        Some(message) => message,
        None => return true,
    };

    let icid = message.icid;
    let source = message.source;

    let empty = message
        .payload
        .command_lists
        .first()
        .map_or(true, |list| list.commands.is_empty());
    if empty {
        return hub.reply_error(connector, message, ErrorCode::InvalidPayload);
    }

    let updates = message.payload.command_lists.remove(0);
    let changed = match hub
        .command_list_manager
        .command_lists
        .get_mut(&icid)
        .and_then(|lists| lists.get_mut(&source))
    {
        Some(stored) => {
            let mut changed = false;
            for command in updates.commands {
                if update_command(command, stored) {
                    changed = true;
                }
            }
            changed
        }
        None => return hub.reply_false(connector, message),
    };

    if changed {
        broadcast_command_list_changed(hub, icid, source);
    }
    hub.reply_boolean(connector, message, changed)
}

fn on_query_command_list(hub: &mut Hub, message: Message) -> bool {
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

    let lists: Vec<CommandList> = hub
        .command_list_manager
        .command_lists
        .get(&message.icid)
        .map(|lists| lists.values().cloned().collect())
        .unwrap_or_default();

    message.payload = Default::default();
    message.payload.command_lists = lists;
    let reply = message.into_reply();
    hub.deliver(connector, reply);
    true
}

fn delete_command_list(hub: &mut Hub, icid: IcId, component: ComponentId) {
    let existed = match hub.command_list_manager.command_lists.get_mut(&icid) {
        Some(lists) => match lists.get_mut(&component) {
            Some(list) => {
                list.commands.clear();
                true
            }
            None => false,
        },
        None => false,
    };
    if !existed {
        return;
    }
    // Broadcast with the emptied entry still present, then drop it.
    broadcast_command_list_changed(hub, icid, component);
    if let Some(lists) = hub.command_list_manager.command_lists.get_mut(&icid) {
        lists.remove(&component);
    }
}

fn broadcast_command_list_changed(hub: &mut Hub, icid: IcId, changed: ComponentId) {
    let wanted = hub.input_contexts.get(&icid).map_or(false, |context| {
        context.may_consume(&hub.registry, MessageType::CommandListChanged, false)
    });
    if !wanted {
        return;
    }

    let mut message = Message::new(MessageType::CommandListChanged)
        .with_source(hub.command_list_manager.component)
        .with_target(ComponentId::BROADCAST)
        .with_icid(icid);
    if let Some(lists) = hub.command_list_manager.command_lists.get(&icid) {
        for (owner, list) in lists {
            message.payload.command_lists.push(list.clone());
            message.payload.booleans.push(*owner == changed);
        }
    }
    let from = hub.command_list_manager.connector;
    hub.dispatch(from, message);
}

/// Stamps `owner` on a command tree, recursing into sub-menus so no node
/// carries a forged owner.
fn set_command_list_owner(owner: ComponentId, list: &mut CommandList) {
    list.owner = owner;
    for command in &mut list.commands {
        if let Some(sub_commands) = &mut command.sub_commands {
            set_command_list_owner(owner, sub_commands);
        }
    }
}

/// Replaces the command with the same id anywhere in the tree. Returns
/// whether a command was replaced.
fn update_command(new_command: Command, list: &mut CommandList) -> bool {
    let owner = list.owner;
    if let Some(position) = list
        .commands
        .iter()
        .position(|command| command.id == new_command.id)
    {
        list.commands[position] = new_command;
        if let Some(sub_commands) = &mut list.commands[position].sub_commands {
            set_command_list_owner(owner, sub_commands);
        }
        return true;
    }
    for command in &mut list.commands {
        if let Some(sub_commands) = &mut command.sub_commands {
            if update_command(new_command.clone(), sub_commands) {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::message::{Payload, ReplyMode};
    use crate::testing::{create_input_context, register_component, MockConnector};

    fn app_info(string_id: &str) -> ComponentInfo {
        use MessageType::*;
        ComponentInfo::new(string_id, "Application")
            .produces(&[CreateInputContext, QueryCommandList])
            .consumes(&[InsertText])
    }

    fn engine_info(string_id: &str) -> ComponentInfo {
        use MessageType::*;
        ComponentInfo::new(string_id, "Engine")
            .produces(&[AttachToInputContext, SetCommandList, UpdateCommands])
            .consumes(&[CompleteComposition])
    }

    fn toolbar_info(string_id: &str) -> ComponentInfo {
        use MessageType::*;
        ComponentInfo::new(string_id, "Toolbar")
            .produces(&[AttachToInputContext])
            .consumes(&[CommandListChanged])
    }

    fn command(id: u32, title: &str) -> Command {
        Command {
            id,
            title: title.into(),
            enabled: true,
            sub_commands: None,
        }
    }

    fn with_sub(mut parent: Command, sub: Vec<Command>) -> Command {
        parent.sub_commands = Some(CommandList {
            owner: ComponentId::DEFAULT,
            commands: sub,
        });
        parent
    }

    fn preorder(list: &CommandList, out: &mut Vec<u32>) {
        for command in &list.commands {
            out.push(command.id);
            if let Some(sub_commands) = &command.sub_commands {
                preorder(sub_commands, out);
            }
        }
    }

    struct CommandBed {
        hub: Hub,
        engine: Rc<MockConnector>,
        engine_id: ComponentId,
        toolbar: Rc<MockConnector>,
        icid: IcId,
    }

    fn command_bed() -> CommandBed {
        let mut hub = Hub::new();
        let app = MockConnector::new();
        let app_id = register_component(&mut hub, &app, app_info("test.app"));
        let engine = MockConnector::new();
        let engine_id = register_component(&mut hub, &engine, engine_info("test.engine"));
        let toolbar = MockConnector::new();
        let toolbar_id = register_component(&mut hub, &toolbar, toolbar_info("test.toolbar"));

        let icid = create_input_context(&mut hub, &app, app_id);
        for (connector, id) in [(&engine, engine_id), (&toolbar, toolbar_id)] {
            let message = Message::new(MessageType::AttachToInputContext)
                .with_reply_mode(ReplyMode::NeedReply)
                .with_source(id)
                .with_icid(icid);
            hub.dispatch(connector.connector(), message);
            connector.clear();
        }

        CommandBed {
            hub,
            engine,
            engine_id,
            toolbar,
            icid,
        }
    }

    fn set_command_list(bed: &mut CommandBed, commands: Vec<Command>) {
        let mut message = Message::new(MessageType::SetCommandList)
            .with_reply_mode(ReplyMode::NeedReply)
            .with_source(bed.engine_id)
            .with_icid(bed.icid);
        message.payload.command_lists.push(CommandList {
            owner: ComponentId::DEFAULT,
            commands,
        });
        bed.hub.dispatch(bed.engine.connector(), message);
    }

    #[test]
    fn set_command_list_broadcasts_the_owned_aggregate() {
        let mut bed = command_bed();

        set_command_list(
            &mut bed,
            vec![
                command(1, "copy"),
                with_sub(
                    command(2, "modes"),
                    vec![
                        command(4, "full"),
                        with_sub(command(5, "half"), vec![command(6, "narrow")]),
                    ],
                ),
                command(3, "paste"),
            ],
        );

        let changed = bed.toolbar.messages_of_type(MessageType::CommandListChanged);
        assert_eq!(changed.len(), 1);
        let payload = &changed[0].payload;
        assert_eq!(payload.command_lists.len(), 1);
        assert_eq!(payload.booleans, vec![true]);

        // Ownership is stamped on every level of the tree.
        let list = &payload.command_lists[0];
        assert_eq!(list.owner, bed.engine_id);
        let nested = list.commands[1].sub_commands.as_ref().unwrap();
        assert_eq!(nested.owner, bed.engine_id);
        assert_eq!(
            nested.commands[1].sub_commands.as_ref().unwrap().owner,
            bed.engine_id
        );

        let mut ids = Vec::new();
        preorder(list, &mut ids);
        assert_eq!(ids, vec![1, 2, 4, 5, 6, 3]);
    }

    #[test]
    fn broadcast_reaches_every_consumer_exactly_once() {
        let mut bed = command_bed();
        let second_toolbar = MockConnector::new();
        let second_toolbar_id = register_component(
            &mut bed.hub,
            &second_toolbar,
            toolbar_info("test.toolbar.second"),
        );
        let message = Message::new(MessageType::AttachToInputContext)
            .with_reply_mode(ReplyMode::NeedReply)
            .with_source(second_toolbar_id)
            .with_icid(bed.icid);
        bed.hub.dispatch(second_toolbar.connector(), message);
        second_toolbar.clear();

        set_command_list(&mut bed, vec![command(1, "copy")]);

        let manager = bed.hub.command_list_manager.component;
        for toolbar in [&bed.toolbar, &second_toolbar] {
            let received = toolbar.messages_of_type(MessageType::CommandListChanged);
            assert_eq!(received.len(), 1);
            assert_eq!(received[0].source, manager);
        }
        let first = bed.toolbar.messages_of_type(MessageType::CommandListChanged);
        let second = second_toolbar.messages_of_type(MessageType::CommandListChanged);
        assert_ne!(first[0].target, second[0].target);
    }

    #[test]
    fn update_commands_replaces_nested_entries() {
        let mut bed = command_bed();
        set_command_list(
            &mut bed,
            vec![
                command(1, "copy"),
                with_sub(command(2, "modes"), vec![command(4, "full")]),
            ],
        );
        bed.toolbar.clear();

        let mut message = Message::new(MessageType::UpdateCommands)
            .with_reply_mode(ReplyMode::NeedReply)
            .with_source(bed.engine_id)
            .with_icid(bed.icid);
        message.payload.command_lists.push(CommandList {
            owner: ComponentId::DEFAULT,
            commands: vec![command(4, "full width")],
        });
        bed.hub.dispatch(bed.engine.connector(), message);

        let reply = bed
            .engine
            .messages_of_type(MessageType::UpdateCommands)
            .pop()
            .unwrap();
        assert_eq!(reply.payload.booleans, vec![true]);

        let changed = bed.toolbar.messages_of_type(MessageType::CommandListChanged);
        assert_eq!(changed.len(), 1);
        let nested = changed[0].payload.command_lists[0].commands[1]
            .sub_commands
            .as_ref()
            .unwrap();
        assert_eq!(nested.commands[0].title, "full width");

        // Updating an id nobody declared changes nothing.
        bed.toolbar.clear();
        bed.engine.clear();
        let mut message = Message::new(MessageType::UpdateCommands)
            .with_reply_mode(ReplyMode::NeedReply)
            .with_source(bed.engine_id)
            .with_icid(bed.icid);
        message.payload.command_lists.push(CommandList {
            owner: ComponentId::DEFAULT,
            commands: vec![command(99, "ghost")],
        });
        bed.hub.dispatch(bed.engine.connector(), message);
        let reply = bed
            .engine
            .messages_of_type(MessageType::UpdateCommands)
            .pop()
            .unwrap();
        assert_eq!(reply.payload.booleans, vec![false]);
        assert!(bed
            .toolbar
            .messages_of_type(MessageType::CommandListChanged)
            .is_empty());
    }

    #[test]
    fn query_returns_the_aggregated_lists() {
        let mut bed = command_bed();
        set_command_list(&mut bed, vec![command(1, "copy")]);

        let app = MockConnector::new();
        let app_id = register_component(&mut bed.hub, &app, app_info("test.app.second"));
        let message = Message::new(MessageType::QueryCommandList)
            .with_reply_mode(ReplyMode::NeedReply)
            .with_source(app_id)
            .with_icid(bed.icid);
        bed.hub.dispatch(app.connector(), message);

        let reply = app
            .messages_of_type(MessageType::QueryCommandList)
            .pop()
            .unwrap();
        assert_eq!(reply.payload.command_lists.len(), 1);
        assert_eq!(reply.payload.command_lists[0].owner, bed.engine_id);
    }

    #[test]
    fn clearing_broadcasts_the_emptied_list_and_forgets_it() {
        let mut bed = command_bed();
        set_command_list(&mut bed, vec![command(1, "copy")]);
        bed.toolbar.clear();

        // An empty list clears the stored one.
        let message = Message::new(MessageType::SetCommandList)
            .with_reply_mode(ReplyMode::NeedReply)
            .with_source(bed.engine_id)
            .with_icid(bed.icid)
            .with_payload(Payload::default());
        bed.hub.dispatch(bed.engine.connector(), message);

        let changed = bed.toolbar.messages_of_type(MessageType::CommandListChanged);
        assert_eq!(changed.len(), 1);
        assert!(changed[0].payload.command_lists[0].commands.is_empty());

        // Clearing again is not a change.
        bed.toolbar.clear();
        let message = Message::new(MessageType::SetCommandList)
            .with_reply_mode(ReplyMode::NeedReply)
            .with_source(bed.engine_id)
            .with_icid(bed.icid)
            .with_payload(Payload::default());
        bed.hub.dispatch(bed.engine.connector(), message);
        assert!(bed
            .toolbar
            .messages_of_type(MessageType::CommandListChanged)
            .is_empty());
    }

    #[test]
    fn sender_must_be_attached() {
        let mut bed = command_bed();
        let outsider = MockConnector::new();
        let outsider_id =
            register_component(&mut bed.hub, &outsider, engine_info("test.outsider"));

        let mut message = Message::new(MessageType::SetCommandList)
            .with_reply_mode(ReplyMode::NeedReply)
            .with_source(outsider_id)
            .with_icid(bed.icid);
        message.payload.command_lists.push(CommandList {
            owner: ComponentId::DEFAULT,
            commands: vec![command(1, "copy")],
        });
        bed.hub.dispatch(outsider.connector(), message);
        let reply = outsider.messages().pop().unwrap();
        assert_eq!(
            reply.payload.error.as_ref().map(|error| error.code),
            Some(ErrorCode::ComponentNotAttached)
        );
    }
}
