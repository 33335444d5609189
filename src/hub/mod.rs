//! The hub runtime: connector lifecycle, message validation and routing,
//! broadcast fan-out, and the built-in components that service the hub's
//! own message surface.
//!
//! The hub is strictly single-threaded and re-entrant: delivering a message
//! to a connector may synchronously dispatch follow-up messages before the
//! original `dispatch` call returns. Built-in components are plain fields of
//! [`Hub`] that are reached through the same capability-checked delivery
//! path as external connectors, so nothing external can tell them apart.

pub(crate) mod commands;
pub(crate) mod compositions;
pub(crate) mod contexts;
pub(crate) mod hotkeys;
pub(crate) mod input_methods;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;

use log::{debug, warn};

use crate::{
    component::{Component, ComponentId, ComponentInfo, Registry},
    context::{AttachState, ContextEvent, IcId, InputContext},
    message::{ErrorCode, Message, MessageType, Payload, ReplyMode},
};

/// A bidirectional transport endpoint attached to the hub.
///
/// The hub calls [`send`](Connector::send) to deliver a message; the
/// connector submits messages by calling [`Hub::dispatch`] with the id it
/// received at attach time. `send` may re-enter the hub synchronously, e.g.
/// to answer a request inline.
pub trait Connector {
    /// Delivers a message to this endpoint. Returning `false` signals that
    /// the message could not be handed over; the hub then synthesizes an
    /// error reply if the message asked for one.
    fn send(&self, hub: &mut Hub, message: Message) -> bool;

    /// Called synchronously from [`Hub::attach`].
    fn attached(&self, _hub: &mut Hub, _id: ConnectorId) {}

    /// Called synchronously from [`Hub::detach`], after every component
    /// owned by this connector has been deregistered.
    fn detached(&self, _hub: &mut Hub) {}
}

/// Handle of an attached connector.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectorId(pub(crate) u32);

/// Tunables fixed at construction time.
#[derive(Clone, Copy, Debug, Default)]
pub struct HubOptions {
    /// Mirror every successful input-method switch to all other input
    /// contexts instead of keeping the choice per context.
    pub global_input_method: bool,
}

/// Which built-in subsystem a connector entry routes into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Builtin {
    Hub,
    Contexts,
    Hotkeys,
    InputMethods,
    Commands,
    Compositions,
}

#[derive(Clone)]
enum Endpoint {
    External(Rc<dyn Connector>),
    Builtin(Builtin),
    /// Scoped message cache installed while an input-method switch is in
    /// flight on the given context.
    SwitchCache(IcId),
}

struct ConnectorEntry {
    endpoint: Endpoint,
    /// Ids of the components this connector registered.
    components: BTreeSet<ComponentId>,
}

const HUB_STRING_ID: &str = "imhub.hub";
const HUB_NAME: &str = "IPC Hub";

fn hub_component_info() -> ComponentInfo {
    use MessageType::*;
    ComponentInfo::new(HUB_STRING_ID, HUB_NAME)
        .produces(&[
            ComponentCreated,
            ComponentDeleted,
            ComponentAttached,
            ComponentDetached,
            InputContextCreated,
            InputContextDeleted,
            AttachToInputContext,
            DetachedFromInputContext,
            InputContextGotFocus,
            InputContextLostFocus,
            ComponentActivated,
            ComponentDeactivated,
            ActiveConsumerChanged,
        ])
        .consumes(&[RegisterComponent, DeregisterComponent, QueryComponent])
}

/// The IPC hub.
///
/// Owns every component, input context and connector entry. All entry
/// points run to completion on the caller's thread; any asynchrony is
/// represented as pending state inside the built-in managers.
pub struct Hub {
    options: HubOptions,
    connectors: HashMap<ConnectorId, ConnectorEntry>,
    next_connector: u32,
    registry: Registry,
    input_contexts: HashMap<IcId, InputContext>,
    next_icid: u32,
    /// The focused input context; `IcId::DEFAULT` means nothing is focused.
    focused: IcId,
    hub_connector: ConnectorId,
    hub_component: ComponentId,
    context_manager: contexts::ContextManager,
    hotkey_manager: hotkeys::HotkeyManager,
    input_method_manager: input_methods::InputMethodManager,
    command_list_manager: commands::CommandListManager,
    composition_manager: compositions::CompositionManager,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self::with_options(HubOptions::default())
    }

    pub fn with_options(options: HubOptions) -> Self {
        let mut hub = Self {
            options,
            connectors: HashMap::new(),
            next_connector: 0,
            registry: Registry::new(),
            input_contexts: HashMap::new(),
            next_icid: 0,
            focused: IcId::DEFAULT,
            hub_connector: ConnectorId::default(),
            hub_component: ComponentId::DEFAULT,
            context_manager: contexts::ContextManager::default(),
            hotkey_manager: hotkeys::HotkeyManager::default(),
            input_method_manager: input_methods::InputMethodManager::default(),
            command_list_manager: commands::CommandListManager::default(),
            composition_manager: compositions::CompositionManager::default(),
        };

        // The hub's own component (id 0) and the default input context
        // (id 0) exist before anything else can attach.
        hub.hub_connector = hub.attach_endpoint(Endpoint::Builtin(Builtin::Hub));
        hub.hub_component = hub
            .create_component(hub.hub_connector, hub_component_info(), true)
            .expect("the hub component is the first registration");
        hub.create_input_context(hub.hub_component)
            .expect("the default input context is the first context");

        // Built-in managers, in dependency order. Each one is a synthetic
        // component attached sticky to the default input context.
        let (_, component) = hub.register_builtin(Builtin::Contexts, contexts::manager_info());
        hub.context_manager = contexts::ContextManager::new(component);

        let (connector, component) =
            hub.register_builtin(Builtin::InputMethods, input_methods::manager_info());
        hub.input_method_manager = input_methods::InputMethodManager::new(connector, component);

        let (connector, component) =
            hub.register_builtin(Builtin::Hotkeys, hotkeys::manager_info());
        hub.hotkey_manager = hotkeys::HotkeyManager::new(connector, component);

        let (connector, component) =
            hub.register_builtin(Builtin::Commands, commands::manager_info());
        hub.command_list_manager = commands::CommandListManager::new(connector, component);

        let (connector, component) =
            hub.register_builtin(Builtin::Compositions, compositions::manager_info());
        hub.composition_manager = compositions::CompositionManager::new(connector, component);

        hub
    }

    /// Attaches an external connector and returns its handle. The
    /// connector's [`attached`](Connector::attached) hook fires before this
    /// method returns.
    pub fn attach(&mut self, connector: Rc<dyn Connector>) -> ConnectorId {
        let id = self.attach_endpoint(Endpoint::External(Rc::clone(&connector)));
        connector.attached(self, id);
        id
    }

    /// Detaches a connector, deregistering every component it owns. The
    /// connector's [`detached`](Connector::detached) hook fires before this
    /// method returns; no message is delivered to the connector afterwards.
    pub fn detach(&mut self, connector: ConnectorId) {
        let entry = match self.connectors.remove(&connector) {
            Some(entry) => entry,
            None => return,
        };
        for component in &entry.components {
            self.delete_component(connector, *component);
        }
        if let Endpoint::External(external) = entry.endpoint {
            external.detached(self);
        }
    }

    /// Routes one message. Returns `true` when the hub took full
    /// responsibility for the message, including any required reply; the
    /// message is consumed either way.
    pub fn dispatch(&mut self, from: ConnectorId, mut message: Message) -> bool {
        if !self.connectors.contains_key(&from) {
            warn!("dispatch from detached connector {:?}", from);
            return false;
        }

        if message.icid == IcId::FOCUSED {
            message.icid = self.focused;
        }

        if message.source == ComponentId::BROADCAST {
            return self.reply_error(from, message, ErrorCode::InvalidSource);
        }

        // Registration traffic may legitimately come from a connector that
        // owns no component yet, so it is serviced before source lookup.
        match message.message_type {
            MessageType::RegisterComponent => {
                if message.target != ComponentId::DEFAULT {
                    return self.reply_error(from, message, ErrorCode::InvalidTarget);
                }
                if !message.needs_reply() {
                    return self.reply_error(from, message, ErrorCode::InvalidReplyMode);
                }
                return self.register_components(from, message);
            }
            MessageType::DeregisterComponent => {
                if message.target != ComponentId::DEFAULT {
                    return self.reply_error(from, message, ErrorCode::InvalidTarget);
                }
                if message.is_reply() {
                    return self.reply_error(from, message, ErrorCode::InvalidReplyMode);
                }
                return self.deregister_components(from, message);
            }
            _ => {}
        }

        let source_owned = self
            .registry
            .get(message.source)
            .map_or(false, |component| component.connector() == from);
        if !source_owned {
            return self.reply_error(from, message, ErrorCode::InvalidSource);
        }

        if !self.source_can_produce(message.source, &message) {
            return self.reply_error(from, message, ErrorCode::SourceCanNotProduce);
        }

        if message.target == ComponentId::BROADCAST {
            if message.reply_mode != ReplyMode::NoReply {
                return self.reply_error(from, message, ErrorCode::InvalidReplyMode);
            }
            return self.broadcast(message);
        }

        let target_connector = match self.registry.get(message.target) {
            Some(target) => target.connector(),
            None => return self.reply_error(from, message, ErrorCode::InvalidTarget),
        };
        if !self.connectors.contains_key(&target_connector) {
            return self.reply_error(from, message, ErrorCode::InvalidTarget);
        }

        // The hub itself may consume anything; everyone else is held to the
        // capability set they registered.
        if target_connector != self.hub_connector
            && !self.target_can_consume(message.target, &message)
        {
            return self.reply_error(from, message, ErrorCode::TargetCanNotConsume);
        }

        let (message_type, source, target, icid, serial, reply_mode) = (
            message.message_type,
            message.source,
            message.target,
            message.icid,
            message.serial,
            message.reply_mode,
        );

        if self.deliver(target_connector, message) {
            return true;
        }

        if reply_mode != ReplyMode::NeedReply {
            return false;
        }

        // The target consumed and lost the message; rebuild enough of it to
        // report the failure to the sender.
        let failed = Message::new(message_type)
            .with_reply_mode(reply_mode)
            .with_source(source)
            .with_target(target)
            .with_icid(icid)
            .with_serial(serial);
        self.reply_error(from, failed, ErrorCode::SendFailure)
    }

    // Read-only views.

    pub fn component(&self, id: ComponentId) -> Option<&Component> {
        self.registry.get(id)
    }

    pub fn component_by_string_id(&self, string_id: &str) -> Option<&Component> {
        self.registry
            .id_by_string_id(string_id)
            .and_then(|id| self.registry.get(id))
    }

    pub fn components(&self) -> impl Iterator<Item = &Component> {
        self.registry.iter()
    }

    /// Resolves an input context id, mapping [`IcId::FOCUSED`] to the
    /// focused context.
    pub fn input_context(&self, icid: IcId) -> Option<&InputContext> {
        let icid = if icid == IcId::FOCUSED {
            self.focused
        } else {
            icid
        };
        self.input_contexts.get(&icid)
    }

    pub fn focused_input_context(&self) -> IcId {
        self.focused
    }

    fn is_connector_attached(&self, connector: ConnectorId) -> bool {
        self.connectors.contains_key(&connector)
    }

    fn is_component_valid(&self, id: ComponentId) -> bool {
        self.registry
            .get(id)
            .map_or(false, |component| self.is_connector_attached(component.connector()))
    }

    // Connector plumbing.

    fn attach_endpoint(&mut self, endpoint: Endpoint) -> ConnectorId {
        let id = ConnectorId(self.next_connector);
        self.next_connector += 1;
        self.connectors.insert(
            id,
            ConnectorEntry {
                endpoint,
                components: BTreeSet::new(),
            },
        );
        id
    }

    fn register_builtin(
        &mut self,
        builtin: Builtin,
        info: ComponentInfo,
    ) -> (ConnectorId, ComponentId) {
        let connector = self.attach_endpoint(Endpoint::Builtin(builtin));
        let component = self
            .create_component(connector, info, true)
            .expect("built-in component descriptors are unique");
        (connector, component)
    }

    /// Hands a message to the connector's endpoint. The message is consumed
    /// regardless of the outcome.
    fn deliver(&mut self, connector: ConnectorId, message: Message) -> bool {
        let endpoint = match self.connectors.get(&connector) {
            Some(entry) => entry.endpoint.clone(),
            None => return false,
        };
        match endpoint {
            Endpoint::External(external) => external.send(self, message),
            Endpoint::Builtin(Builtin::Hub) => self.hub_send(message),
            Endpoint::Builtin(Builtin::Contexts) => contexts::handle(self, message),
            Endpoint::Builtin(Builtin::Hotkeys) => hotkeys::handle(self, message),
            Endpoint::Builtin(Builtin::InputMethods) => input_methods::handle(self, message),
            Endpoint::Builtin(Builtin::Commands) => commands::handle(self, message),
            Endpoint::Builtin(Builtin::Compositions) => compositions::handle(self, message),
            Endpoint::SwitchCache(icid) => input_methods::cache_send(self, icid, message),
        }
    }

    /// The hub component's own inbox: attach replies, component queries, and
    /// the default route that forwards everything else to the active
    /// consumer on the target context.
    fn hub_send(&mut self, message: Message) -> bool {
        match message.message_type {
            MessageType::AttachToInputContext if message.is_reply() => {
                self.on_attach_reply(message)
            }
            MessageType::QueryComponent => self.on_query_component(message),
            _ => self.dispatch_to_active_consumer(message),
        }
    }

    fn dispatch_to_active_consumer(&mut self, mut message: Message) -> bool {
        let from = match self.registry.get(message.source) {
            Some(source) => source.connector(),
            None => return false,
        };

        // A reply must name its target explicitly; electing a consumer for
        // it would hand it to an arbitrary component.
        if message.is_reply() {
            return self.reply_error(from, message, ErrorCode::InvalidTarget);
        }

        let (icid, consumer) = match self.input_context(message.icid) {
            Some(context) => (context.id(), context.active_consumer(message.message_type)),
            None => return self.reply_error(from, message, ErrorCode::InvalidInputContext),
        };
        let consumer = match consumer {
            Some(consumer) => consumer,
            None => return self.reply_error(from, message, ErrorCode::NoActiveConsumer),
        };

        message.target = consumer;
        message.icid = icid;
        self.dispatch(from, message)
    }

    // Reply helpers, shared with the built-in managers.

    /// Converts `message` into an error reply and sends it back through
    /// `connector`, or silently drops it when no reply was requested.
    /// Returns `true` only if a reply was actually sent.
    fn reply_error(&mut self, connector: ConnectorId, message: Message, code: ErrorCode) -> bool {
        warn!(
            "rejecting {:?} from component {}: {}",
            message.message_type, message.source, code
        );
        if !message.needs_reply() || !self.is_connector_attached(connector) {
            return false;
        }
        let reply = message.into_error_reply(code);
        self.deliver(connector, reply);
        true
    }

    /// Replies with a single boolean, or drops the message when no reply
    /// was requested. Always returns `true`: the message is dealt with.
    fn reply_boolean(&mut self, connector: ConnectorId, message: Message, value: bool) -> bool {
        if !message.needs_reply() || !self.is_connector_attached(connector) {
            return true;
        }
        let reply = message.into_boolean_reply(value);
        self.deliver(connector, reply);
        true
    }

    fn reply_true(&mut self, connector: ConnectorId, message: Message) -> bool {
        self.reply_boolean(connector, message, true)
    }

    fn reply_false(&mut self, connector: ConnectorId, message: Message) -> bool {
        self.reply_boolean(connector, message, false)
    }

    fn new_message(&self, message_type: MessageType, target: ComponentId, icid: IcId) -> Message {
        Message::new(message_type)
            .with_target(target)
            .with_icid(icid)
    }

    fn dispatch_from_hub(&mut self, message: Message) -> bool {
        self.dispatch(self.hub_connector, message)
    }

    fn source_can_produce(&self, id: ComponentId, message: &Message) -> bool {
        let component = match self.registry.get(id) {
            Some(component) => component,
            None => return false,
        };
        if message.is_reply() {
            component.can_consume(message.message_type)
        } else {
            component.may_produce(message.message_type)
        }
    }

    fn target_can_consume(&self, id: ComponentId, message: &Message) -> bool {
        let component = match self.registry.get(id) {
            Some(component) => component,
            None => return false,
        };
        if message.is_reply() {
            component.may_produce(message.message_type)
        } else {
            component.can_consume(message.message_type)
        }
    }

    // Component lifecycle.

    fn register_components(&mut self, from: ConnectorId, mut message: Message) -> bool {
        if message.payload.component_infos.is_empty() {
            return self.reply_error(from, message, ErrorCode::InvalidPayload);
        }

        let infos = std::mem::take(&mut message.payload.component_infos);
        let mut created = Vec::with_capacity(infos.len());
        let mut reply_infos = Vec::with_capacity(infos.len());
        for mut info in infos {
            let id = self.create_component(from, info.clone(), false);
            info.id = id.unwrap_or(ComponentId::DEFAULT);
            created.push(id);
            reply_infos.push(info);
        }

        message.payload.component_infos = reply_infos;
        let reply = message.into_reply();
        if !self.deliver(from, reply) {
            // Registration without its reply must not be observable; undo.
            for id in created.into_iter().flatten() {
                self.delete_component(from, id);
            }
            return false;
        }

        // Attach after the reply so the components receive no other message
        // before learning their own ids.
        for id in created.into_iter().flatten() {
            self.attach_to_input_context(id, IcId::DEFAULT, AttachState::Passive, true);
        }
        true
    }

    fn deregister_components(&mut self, from: ConnectorId, mut message: Message) -> bool {
        let need_reply = message.needs_reply();
        if message.payload.component_ids.is_empty() {
            return self.reply_error(from, message, ErrorCode::InvalidPayload);
        }

        let ids = std::mem::take(&mut message.payload.component_ids);
        let results: Vec<bool> = ids
            .iter()
            .map(|id| self.delete_component(from, *id))
            .collect();

        if need_reply {
            message.payload = Payload {
                booleans: results,
                ..Payload::default()
            };
            let reply = message.into_reply();
            self.deliver(from, reply);
        }
        true
    }

    pub(crate) fn create_component(
        &mut self,
        connector: ConnectorId,
        info: ComponentInfo,
        builtin: bool,
    ) -> Option<ComponentId> {
        if !self.is_connector_attached(connector) {
            return None;
        }

        let broadcast = self
            .input_contexts
            .get(&IcId::DEFAULT)
            .map_or(false, |context| {
                context.may_consume(&self.registry, MessageType::ComponentCreated, false)
            });

        let id = self.registry.insert(connector, info)?;
        if let Some(entry) = self.connectors.get_mut(&connector) {
            entry.components.insert(id);
        }
        debug!(
            "component {} registered as {:?}",
            self.registry.get(id).map(Component::string_id).unwrap_or(""),
            id
        );

        if broadcast {
            let mut message =
                self.new_message(MessageType::ComponentCreated, ComponentId::BROADCAST, IcId::DEFAULT);
            if let Some(component) = self.registry.get(id) {
                message.payload.component_infos.push(component.info().clone());
            }
            self.broadcast_excluding(message, id);
        }

        if builtin && self.input_contexts.contains_key(&IcId::DEFAULT) {
            self.attach_to_input_context(id, IcId::DEFAULT, AttachState::ActiveSticky, true);
        }
        Some(id)
    }

    pub(crate) fn delete_component(&mut self, connector: ConnectorId, id: ComponentId) -> bool {
        match self.registry.get(id) {
            Some(component) if component.connector() == connector => {}
            _ => return false,
        }
        // Out of the registry first, so nothing else can address it while
        // it is being torn down.
        let component = match self.registry.remove(id) {
            Some(component) => component,
            None => return false,
        };
        if let Some(entry) = self.connectors.get_mut(&connector) {
            entry.components.remove(&id);
        }
        debug!("component {:?} ({}) deregistered", id, component.string_id());

        // The default context first, then everything else it was attached
        // to; contexts it owns die with it.
        if self.input_contexts.contains_key(&IcId::DEFAULT) {
            if id == self.hub_component {
                self.delete_input_context(id, IcId::DEFAULT);
            } else {
                self.detach_removed_component(&component, IcId::DEFAULT);
            }
        }

        let attached: Vec<IcId> = component.attached_contexts().iter().copied().collect();
        for icid in attached {
            let owner = self
                .input_contexts
                .get(&icid)
                .map(InputContext::owner);
            if owner == Some(id) {
                self.delete_input_context(id, icid);
            } else {
                self.detach_removed_component(&component, icid);
            }
        }

        let broadcast = self
            .input_contexts
            .get(&IcId::DEFAULT)
            .map_or(false, |context| {
                context.may_consume(&self.registry, MessageType::ComponentDeleted, false)
            });
        if broadcast {
            let mut message =
                self.new_message(MessageType::ComponentDeleted, ComponentId::BROADCAST, IcId::DEFAULT);
            message.payload.component_ids.push(id);
            self.broadcast(message);
        }
        true
    }

    // Input context lifecycle.

    pub(crate) fn create_input_context(&mut self, owner: ComponentId) -> Option<IcId> {
        let icid = self.allocate_icid()?;
        let mut events = Vec::new();
        let context = InputContext::new(icid, &self.registry, owner, &mut events)?;
        self.input_contexts.insert(icid, context);
        if let Some(component) = self.registry.get_mut(owner) {
            component.attached_contexts_mut().insert(icid);
        }
        self.process_context_events(icid, events);

        if icid != IcId::DEFAULT {
            let broadcast = self
                .input_contexts
                .get(&IcId::DEFAULT)
                .map_or(false, |context| {
                    context.may_consume(&self.registry, MessageType::InputContextCreated, false)
                });
            if broadcast {
                let mut message = self.new_message(
                    MessageType::InputContextCreated,
                    ComponentId::BROADCAST,
                    IcId::DEFAULT,
                );
                message.payload.context_info =
                    self.input_contexts.get(&icid).map(InputContext::info);
                self.broadcast(message);
            }
        }
        Some(icid)
    }

    pub(crate) fn delete_input_context(&mut self, owner: ComponentId, icid: IcId) -> bool {
        match self.input_contexts.get(&icid) {
            Some(context) if context.owner() == owner => {}
            _ => return false,
        }
        let context = match self.input_contexts.remove(&icid) {
            Some(context) => context,
            None => return false,
        };
        if let Some(component) = self.registry.get_mut(owner) {
            component.attached_contexts_mut().remove(&icid);
        }
        if self.focused == icid {
            self.focused = IcId::DEFAULT;
        }

        for (component, state) in context.attached_components() {
            if component != owner {
                self.on_component_detached(icid, component, state);
            }
        }

        let broadcast = self
            .input_contexts
            .get(&IcId::DEFAULT)
            .map_or(false, |context| {
                context.may_consume(&self.registry, MessageType::InputContextDeleted, false)
            });
        if broadcast {
            let mut message = self.new_message(
                MessageType::InputContextDeleted,
                ComponentId::BROADCAST,
                IcId::DEFAULT,
            );
            message.payload.context_ids.push(icid);
            self.broadcast(message);
        }
        true
    }

    fn allocate_icid(&mut self) -> Option<IcId> {
        let start = self.next_icid;
        loop {
            let candidate = IcId(self.next_icid);
            let in_use =
                candidate == IcId::FOCUSED || self.input_contexts.contains_key(&candidate);
            if !in_use {
                self.next_icid = self.next_icid.wrapping_add(1);
                return Some(candidate);
            }
            self.next_icid = self.next_icid.wrapping_add(1);
            if self.next_icid == start {
                return None;
            }
        }
    }

    // Attachment.

    /// Attaches `component` to a context with the given state, delivering
    /// the focus notification and attach broadcast where applicable.
    pub(crate) fn attach_to_input_context(
        &mut self,
        component: ComponentId,
        icid: IcId,
        state: AttachState,
        persistent: bool,
    ) -> bool {
        let mut events = Vec::new();
        let attached = match self.input_contexts.get_mut(&icid) {
            Some(context) => {
                context.attach_component(&self.registry, component, state, persistent, &mut events)
            }
            None => false,
        };
        if !attached {
            return false;
        }
        self.process_context_events(icid, events);

        if let Some(entry) = self.registry.get_mut(component) {
            entry.attached_contexts_mut().insert(icid);
        }
        if !state.is_attached() {
            return true;
        }

        // Deliver the focus state up front so the component never has to
        // ask.
        if icid == self.focused && icid != IcId::DEFAULT {
            let recipient = self.registry.get(component).and_then(|entry| {
                entry
                    .can_consume(MessageType::InputContextGotFocus)
                    .then(|| entry.connector())
            });
            if let Some(connector) = recipient {
                let message =
                    self.new_message(MessageType::InputContextGotFocus, component, icid);
                self.deliver(connector, message);
            }
        }

        let broadcast = self
            .input_contexts
            .get(&IcId::DEFAULT)
            .map_or(false, |context| {
                context.may_consume(&self.registry, MessageType::ComponentAttached, false)
            });
        if broadcast {
            let mut message = self.new_message(
                MessageType::ComponentAttached,
                ComponentId::BROADCAST,
                IcId::DEFAULT,
            );
            message.payload.context_ids.push(icid);
            message.payload.component_ids.push(component);
            self.broadcast(message);
        }
        true
    }

    /// Detaches a still-registered component from a context.
    pub(crate) fn detach_component(&mut self, component: ComponentId, icid: IcId) -> bool {
        let component = match self.registry.get(component) {
            Some(component) => component.clone(),
            None => return false,
        };
        let mut events = Vec::new();
        let detached = match self.input_contexts.get_mut(&icid) {
            Some(context) => context.detach_component(&self.registry, &component, &mut events),
            None => false,
        };
        self.process_context_events(icid, events);
        detached
    }

    /// Detach path for a component that has already left the registry.
    fn detach_removed_component(&mut self, component: &Component, icid: IcId) {
        let mut events = Vec::new();
        let detached = match self.input_contexts.get_mut(&icid) {
            Some(context) => context.detach_component(&self.registry, component, &mut events),
            None => false,
        };
        if detached {
            self.process_context_events(icid, events);
        }
    }

    /// Tries to attach `component` to a context with the desired state,
    /// negotiating via `ATTACH_TO_INPUT_CONTEXT` when the component can
    /// consume it. Returns the state actually entered, `None` on failure.
    ///
    /// `state` must be `Passive` or `Active`. Components that cannot
    /// consume the attach request are attached outright, but only when
    /// `allow_implicit` permits it.
    pub(crate) fn request_attach_to_input_context(
        &mut self,
        component: ComponentId,
        icid: IcId,
        state: AttachState,
        allow_implicit: bool,
    ) -> Option<AttachState> {
        debug_assert!(matches!(state, AttachState::Passive | AttachState::Active));

        let implicit = !self
            .registry
            .get(component)?
            .can_consume(MessageType::AttachToInputContext);
        let context = self.input_contexts.get(&icid)?;
        let old_state = context.attach_state(component);
        let persistent = context.is_persistent(component);

        let mut state = state;
        if !old_state.map_or(false, AttachState::is_attached) {
            if implicit && !allow_implicit {
                return None;
            }
            if !implicit {
                state = if state == AttachState::Active {
                    AttachState::PendingActive
                } else {
                    AttachState::PendingPassive
                };
            }
        }

        if !self.attach_to_input_context(component, icid, state, persistent) {
            return None;
        }

        // Ask the component to confirm; it is actually attached when the
        // boolean reply comes back, possibly synchronously. A component
        // already pending has been asked before.
        if !implicit && old_state.is_none() {
            let mut message = self
                .new_message(MessageType::AttachToInputContext, component, icid)
                .with_reply_mode(ReplyMode::NeedReply);
            message.payload.context_info =
                self.input_contexts.get(&icid).map(InputContext::info);
            if !self.dispatch_from_hub(message) {
                self.detach_component(component, icid);
                return None;
            }
        }
        Some(state)
    }

    fn on_attach_reply(&mut self, message: Message) -> bool {
        if !message.is_reply() {
            return false;
        }
        let source = message.source;
        let icid = match self.input_context(message.icid) {
            Some(context) => context.id(),
            None => return false,
        };
        let state = match self.input_contexts.get(&icid).and_then(|c| c.attach_state(source)) {
            Some(state) if state.is_pending() => state,
            _ => return false,
        };

        let accepted = message.payload.error.is_none()
            && message.payload.booleans.first() == Some(&true);
        if !accepted {
            self.detach_component(source, icid);
            return false;
        }

        let promoted = if state == AttachState::PendingPassive {
            AttachState::Passive
        } else {
            AttachState::Active
        };
        self.attach_to_input_context(source, icid, promoted, false)
    }

    // Focus.

    pub(crate) fn focus_input_context(&mut self, icid: IcId) -> bool {
        if self.focused == icid {
            return true;
        }
        if icid == IcId::FOCUSED {
            return false;
        }
        self.blur_input_context(self.focused);
        self.focused = icid;
        if icid == IcId::DEFAULT {
            return true;
        }
        let message =
            self.new_message(MessageType::InputContextGotFocus, ComponentId::BROADCAST, icid);
        self.broadcast(message)
    }

    pub(crate) fn blur_input_context(&mut self, icid: IcId) -> bool {
        let icid = if icid == IcId::FOCUSED {
            self.focused
        } else {
            icid
        };
        if self.focused != icid {
            return true;
        }
        self.focused = IcId::DEFAULT;
        if icid == IcId::DEFAULT {
            return true;
        }
        let message =
            self.new_message(MessageType::InputContextLostFocus, ComponentId::BROADCAST, icid);
        self.broadcast(message)
    }

    // Broadcast fan-out.

    /// Clones the message to every eligible consumer on its context, the
    /// active consumer first. Consumers that disappear mid-loop are
    /// skipped; a refusing connector is skipped without consequence.
    fn broadcast(&mut self, message: Message) -> bool {
        self.broadcast_excluding(message, ComponentId::DEFAULT)
    }

    fn broadcast_excluding(&mut self, message: Message, exclude: ComponentId) -> bool {
        debug_assert_eq!(message.reply_mode, ReplyMode::NoReply);
        if message.reply_mode != ReplyMode::NoReply {
            return false;
        }

        let consumers = match self.input_context(message.icid) {
            Some(context) => context.all_consumers(&self.registry, message.message_type, false),
            None => return false,
        };

        let source = message.source;
        for consumer in consumers {
            if consumer == source || consumer == exclude {
                continue;
            }
            // Look each consumer up afresh; earlier deliveries may have
            // removed it.
            let connector = match self.registry.get(consumer) {
                Some(component) => component.connector(),
                None => continue,
            };
            if !self.is_connector_attached(connector) {
                continue;
            }
            let mut copy = message.clone();
            copy.target = consumer;
            self.deliver(connector, copy);
        }
        true
    }

    // Hub-side handlers.

    fn on_query_component(&mut self, mut message: Message) -> bool {
        let connector = match self.registry.get(message.source) {
            Some(source) => source.connector(),
            None => return false,
        };
        if !message.needs_reply() {
            return self.reply_error(connector, message, ErrorCode::InvalidReplyMode);
        }

        let queries = std::mem::take(&mut message.payload.component_queries);
        let mut matched: BTreeMap<ComponentId, ComponentInfo> = BTreeMap::new();
        if queries.is_empty() {
            for component in self.registry.iter() {
                matched.insert(component.id(), component.info().clone());
            }
        } else {
            for query in &queries {
                if let Some(id) = query.id {
                    if let Some(component) = self.registry.get(id) {
                        if component.matches_query(query) {
                            matched.insert(id, component.info().clone());
                        }
                    }
                } else if let Some(string_id) = &query.string_id {
                    let component = self
                        .registry
                        .id_by_string_id(string_id)
                        .and_then(|id| self.registry.get(id));
                    if let Some(component) = component {
                        if component.matches_query(query) {
                            matched.insert(component.id(), component.info().clone());
                        }
                    }
                } else {
                    for component in self.registry.iter() {
                        if component.matches_query(query) {
                            matched.insert(component.id(), component.info().clone());
                        }
                    }
                }
            }
        }

        message.payload = Payload::default();
        let reply = if matched.is_empty() {
            message.into_error_reply(ErrorCode::ComponentNotFound)
        } else {
            message.payload.component_infos = matched.into_values().collect();
            message.into_reply()
        };
        self.deliver(connector, reply);
        true
    }

    // Context-event processing: the hub's side of the InputContext
    // contract.

    fn process_context_events(&mut self, icid: IcId, events: Vec<ContextEvent>) {
        for event in events {
            match event {
                ContextEvent::Activated {
                    component,
                    messages,
                } => {
                    let wants = self
                        .registry
                        .get(component)
                        .map_or(false, |c| c.can_consume(MessageType::ComponentActivated));
                    if wants {
                        let mut message =
                            self.new_message(MessageType::ComponentActivated, component, icid);
                        message.payload.message_types = messages.to_vec();
                        self.dispatch_from_hub(message);
                    }
                }
                ContextEvent::Deactivated {
                    component,
                    messages,
                } => {
                    let wants = self
                        .registry
                        .get(component)
                        .map_or(false, |c| c.can_consume(MessageType::ComponentDeactivated));
                    if wants {
                        let mut message =
                            self.new_message(MessageType::ComponentDeactivated, component, icid);
                        message.payload.message_types = messages.to_vec();
                        self.dispatch_from_hub(message);
                    }
                }
                ContextEvent::Detached { component, state } => {
                    self.on_component_detached(icid, component, state);
                }
                ContextEvent::ConsumerChanged { messages } => {
                    let pairs = match self.input_contexts.get(&icid) {
                        Some(context)
                            if context.may_consume(
                                &self.registry,
                                MessageType::ActiveConsumerChanged,
                                false,
                            ) =>
                        {
                            messages
                                .iter()
                                .map(|t| (*t, context.has_active_consumer(*t)))
                                .collect::<Vec<_>>()
                        }
                        _ => continue,
                    };
                    let mut message = self.new_message(
                        MessageType::ActiveConsumerChanged,
                        ComponentId::BROADCAST,
                        icid,
                    );
                    for (message_type, has_consumer) in pairs {
                        message.payload.message_types.push(message_type);
                        message.payload.booleans.push(has_consumer);
                    }
                    self.broadcast(message);
                }
                ContextEvent::MaybeDetach { component } => {
                    // Everything stays attached to the default context.
                    if icid != IcId::DEFAULT {
                        self.detach_component(component, icid);
                    }
                }
                ContextEvent::RequestConsumer { messages, exclude } => {
                    self.request_consumer(icid, &messages, Some(exclude));
                }
            }
        }
    }

    fn on_component_detached(&mut self, icid: IcId, component: ComponentId, state: AttachState) {
        if let Some(entry) = self.registry.get_mut(component) {
            entry.attached_contexts_mut().remove(&icid);
        }
        if !state.is_attached() || component == self.hub_component {
            return;
        }

        let notify = icid != IcId::DEFAULT
            && self
                .registry
                .get(component)
                .map_or(false, |c| c.can_consume(MessageType::DetachedFromInputContext));
        if notify {
            let message =
                self.new_message(MessageType::DetachedFromInputContext, component, icid);
            self.dispatch_from_hub(message);
        }

        // Only broadcast while the context is still alive; a dying context
        // announces itself instead.
        let broadcast = self.input_contexts.contains_key(&icid)
            && self
                .input_contexts
                .get(&IcId::DEFAULT)
                .map_or(false, |context| {
                    context.may_consume(&self.registry, MessageType::ComponentDetached, false)
                });
        if broadcast {
            let mut message = self.new_message(
                MessageType::ComponentDetached,
                ComponentId::BROADCAST,
                IcId::DEFAULT,
            );
            message.payload.context_ids.push(icid);
            message.payload.component_ids.push(component);
            self.broadcast(message);
        }
    }

    /// Finds suppliers for messages nobody on `icid` consumes yet, by
    /// asking consumers known on the default context to attach passively.
    pub(crate) fn request_consumer(
        &mut self,
        icid: IcId,
        messages: &[MessageType],
        exclude: Option<ComponentId>,
    ) {
        if icid == IcId::DEFAULT {
            return;
        }
        for message_type in messages {
            let satisfied = match self.input_contexts.get(&icid) {
                Some(context) => context.may_consume(&self.registry, *message_type, true),
                None => continue,
            };
            if satisfied {
                continue;
            }

            let candidates = self
                .input_contexts
                .get(&IcId::DEFAULT)
                .map(|context| context.all_consumers(&self.registry, *message_type, false))
                .unwrap_or_default();

            for candidate in candidates {
                if Some(candidate) == exclude || !self.is_component_valid(candidate) {
                    continue;
                }
                let already_known = self
                    .input_contexts
                    .get(&icid)
                    .map_or(true, |context| context.attach_state(candidate).is_some());
                if already_known {
                    continue;
                }
                if self
                    .request_attach_to_input_context(candidate, icid, AttachState::Passive, false)
                    .is_some()
                {
                    break;
                }
            }
        }
    }

    // Shared precondition checks for the built-in managers. Each one
    // returns the message on success and otherwise replies/drops it, in
    // which case the caller is done.

    fn check_needs_reply(&mut self, connector: ConnectorId, message: Message) -> Option<Message> {
        if message.needs_reply() {
            Some(message)
        } else {
            self.reply_error(connector, message, ErrorCode::InvalidReplyMode);
            None
        }
    }

    fn check_input_context(
        &mut self,
        connector: ConnectorId,
        message: Message,
    ) -> Option<Message> {
        if self.input_context(message.icid).is_some() {
            Some(message)
        } else {
            self.reply_error(connector, message, ErrorCode::InvalidInputContext);
            None
        }
    }

    fn check_source_attached(
        &mut self,
        connector: ConnectorId,
        message: Message,
    ) -> Option<Message> {
        let message = self.check_input_context(connector, message)?;
        let attached = self
            .input_context(message.icid)
            .map_or(false, |context| context.is_attached(message.source));
        if attached {
            Some(message)
        } else {
            self.reply_error(connector, message, ErrorCode::ComponentNotAttached);
            None
        }
    }

    fn source_connector(&self, message: &Message) -> Option<ConnectorId> {
        self.registry
            .get(message.source)
            .map(Component::connector)
    }
}
