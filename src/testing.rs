//! Test doubles shared by the unit tests: a scriptable mock connector and
//! helpers for the registration handshakes every scenario starts with.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::{
    component::{ComponentId, ComponentInfo},
    context::IcId,
    hub::{Connector, ConnectorId, Hub},
    message::{Message, MessageType, ReplyMode},
};

/// Records every message the hub delivers and can be scripted to answer
/// attach requests and key events inline, the way a cooperative component
/// would.
pub(crate) struct MockConnector {
    connector: Cell<ConnectorId>,
    messages: RefCell<Vec<Message>>,
    send_result: Cell<bool>,
    accept_attach: Cell<bool>,
    key_event_answer: Cell<Option<bool>>,
    serial: Cell<u32>,
}

impl MockConnector {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            connector: Cell::new(ConnectorId::default()),
            messages: RefCell::new(Vec::new()),
            send_result: Cell::new(true),
            accept_attach: Cell::new(false),
            key_event_answer: Cell::new(None),
            serial: Cell::new(1),
        })
    }

    pub fn attach(self: &Rc<Self>, hub: &mut Hub) -> ConnectorId {
        hub.attach(Rc::clone(self) as Rc<dyn Connector>)
    }

    pub fn connector(&self) -> ConnectorId {
        self.connector.get()
    }

    /// Makes `send` fail until reset.
    pub fn refuse_sends(&self) {
        self.send_result.set(false);
    }

    /// Answer `ATTACH_TO_INPUT_CONTEXT` requests with `true` inline.
    pub fn accept_attach_requests(&self) {
        self.accept_attach.set(true);
    }

    /// Answer `PROCESS_KEY_EVENT` requests with the given verdict inline.
    pub fn answer_key_events(&self, handled: bool) {
        self.key_event_answer.set(Some(handled));
    }

    pub fn next_serial(&self) -> u32 {
        let serial = self.serial.get();
        self.serial.set(serial + 1);
        serial
    }

    pub fn clear(&self) {
        self.messages.borrow_mut().clear();
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.borrow().clone()
    }

    pub fn messages_of_type(&self, message_type: MessageType) -> Vec<Message> {
        self.messages
            .borrow()
            .iter()
            .filter(|message| message.message_type == message_type)
            .cloned()
            .collect()
    }
}

impl Connector for MockConnector {
    fn send(&self, hub: &mut Hub, message: Message) -> bool {
        if !self.send_result.get() {
            return false;
        }

        // Record before any scripted reply so the log reads in arrival
        // order; the borrow must not be held across `dispatch`, which can
        // re-enter this connector.
        self.messages.borrow_mut().push(message.clone());

        if self.accept_attach.get()
            && message.message_type == MessageType::AttachToInputContext
            && message.needs_reply()
        {
            let reply = message.into_boolean_reply(true);
            hub.dispatch(self.connector.get(), reply);
            return true;
        }
        if let Some(handled) = self.key_event_answer.get() {
            if message.message_type == MessageType::ProcessKeyEvent && message.needs_reply() {
                let reply = message.into_boolean_reply(handled);
                hub.dispatch(self.connector.get(), reply);
                return true;
            }
        }
        true
    }

    fn attached(&self, _hub: &mut Hub, id: ConnectorId) {
        self.connector.set(id);
    }
}

/// Registers one component through the normal handshake and returns the
/// assigned id.
pub(crate) fn register_component(
    hub: &mut Hub,
    connector: &Rc<MockConnector>,
    info: ComponentInfo,
) -> ComponentId {
    if connector.connector() == ConnectorId::default() {
        connector.attach(hub);
    }

    let mut message = Message::new(MessageType::RegisterComponent)
        .with_reply_mode(ReplyMode::NeedReply)
        .with_serial(connector.next_serial());
    message.payload.component_infos.push(info);
    assert!(hub.dispatch(connector.connector(), message));

    let reply = connector
        .messages_of_type(MessageType::RegisterComponent)
        .pop()
        .expect("registration reply");
    assert!(reply.is_reply());
    let id = reply.payload.component_infos[0].id;
    assert_ne!(id, ComponentId::DEFAULT);
    connector.clear();
    id
}

/// Creates an input context owned by `owner` and returns its id.
pub(crate) fn create_input_context(
    hub: &mut Hub,
    connector: &Rc<MockConnector>,
    owner: ComponentId,
) -> IcId {
    let message = Message::new(MessageType::CreateInputContext)
        .with_reply_mode(ReplyMode::NeedReply)
        .with_source(owner)
        .with_serial(connector.next_serial());
    assert!(hub.dispatch(connector.connector(), message));

    let reply = connector
        .messages_of_type(MessageType::CreateInputContext)
        .pop()
        .expect("create-context reply");
    assert!(reply.is_reply());
    assert_eq!(reply.payload.booleans, vec![true]);
    let icid = reply.icid;
    assert_ne!(icid, IcId::DEFAULT);
    connector.clear();
    icid
}

/// Installs the env_logger backend once; handy when debugging a failing
/// scenario with `RUST_LOG=debug`.
pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
