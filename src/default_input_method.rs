//! A stock input method that declines every key event.
//!
//! Registering it guarantees the hub always has an attachable input
//! method, so applications get a prompt `false` reply instead of a
//! `NO_ACTIVE_CONSUMER` error while no real input method is running.

use std::cell::Cell;
use std::rc::Rc;

use crate::{
    component::{ComponentId, ComponentInfo},
    hub::{Connector, ConnectorId, Hub},
    message::{Message, MessageType, ReplyMode},
};

pub const DEFAULT_INPUT_METHOD_STRING_ID: &str = "imhub.default-input-method";
const NAME: &str = "Default Input Method";

pub struct DefaultInputMethod {
    connector: Cell<ConnectorId>,
    id: Cell<ComponentId>,
}

impl DefaultInputMethod {
    /// Attaches to the hub and registers the component; the returned
    /// handle stays valid until [`Hub::detach`] removes it.
    pub fn register(hub: &mut Hub) -> Rc<Self> {
        let input_method = Rc::new(Self {
            connector: Cell::new(ConnectorId::default()),
            id: Cell::new(ComponentId::DEFAULT),
        });
        let connector = hub.attach(Rc::clone(&input_method) as Rc<dyn Connector>);

        let mut message =
            Message::new(MessageType::RegisterComponent).with_reply_mode(ReplyMode::NeedReply);
        message.payload.component_infos.push(
            ComponentInfo::new(DEFAULT_INPUT_METHOD_STRING_ID, NAME)
                .produces(&[MessageType::InsertText])
                .consumes(&[
                    MessageType::AttachToInputContext,
                    MessageType::ProcessKeyEvent,
                    MessageType::CancelComposition,
                    MessageType::CompleteComposition,
                ]),
        );
        hub.dispatch(connector, message);
        input_method
    }

    /// The component id assigned at registration.
    pub fn id(&self) -> ComponentId {
        self.id.get()
    }

    /// The connector handle, for [`Hub::detach`].
    pub fn connector(&self) -> ConnectorId {
        self.connector.get()
    }
}

impl Connector for DefaultInputMethod {
    fn send(&self, hub: &mut Hub, message: Message) -> bool {
        match message.message_type {
            MessageType::RegisterComponent if message.is_reply() => {
                if let Some(info) = message.payload.component_infos.first() {
                    self.id.set(info.id);
                }
            }
            MessageType::AttachToInputContext if message.needs_reply() => {
                let reply = message.into_boolean_reply(true);
                hub.dispatch(self.connector.get(), reply);
            }
            MessageType::ProcessKeyEvent if message.needs_reply() => {
                // Every key is left for the application to handle.
                let reply = message.into_boolean_reply(false);
                hub.dispatch(self.connector.get(), reply);
            }
            _ => {}
        }
        true
    }

    fn attached(&self, _hub: &mut Hub, id: ConnectorId) {
        self.connector.set(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::IcId;
    use crate::keyboard::KeyEvent;
    use crate::message::Payload;
    use crate::testing::{create_input_context, register_component, MockConnector};

    #[test]
    fn registers_as_an_input_method() {
        let mut hub = Hub::new();
        let input_method = DefaultInputMethod::register(&mut hub);

        assert_ne!(input_method.id(), ComponentId::DEFAULT);
        let component = hub.component(input_method.id()).unwrap();
        assert_eq!(component.string_id(), DEFAULT_INPUT_METHOD_STRING_ID);
    }

    #[test]
    fn declines_key_events_end_to_end() {
        let mut hub = Hub::new();
        let _input_method = DefaultInputMethod::register(&mut hub);

        let app = MockConnector::new();
        let app_id = register_component(
            &mut hub,
            &app,
            ComponentInfo::new("test.app", "App")
                .produces(&[
                    MessageType::CreateInputContext,
                    MessageType::RequestConsumer,
                    MessageType::SendKeyEvent,
                ])
                .consumes(&[MessageType::InsertText]),
        );
        let icid = create_input_context(&mut hub, &app, app_id);

        // Pull an input method in, then send a key.
        let mut request = Message::new(MessageType::RequestConsumer)
            .with_source(app_id)
            .with_icid(icid);
        request.payload.message_types.push(MessageType::SendKeyEvent);
        hub.dispatch(app.connector(), request);

        let message = Message::new(MessageType::SendKeyEvent)
            .with_reply_mode(ReplyMode::NeedReply)
            .with_source(app_id)
            .with_icid(icid)
            .with_serial(7)
            .with_payload(Payload {
                key_event: Some(KeyEvent::down(65)),
                ..Payload::default()
            });
        app.clear();
        hub.dispatch(app.connector(), message);

        let replies = app.messages_of_type(MessageType::SendKeyEvent);
        assert_eq!(replies.len(), 1);
        assert!(replies[0].is_reply());
        assert_eq!(replies[0].serial, 7);
        assert_eq!(replies[0].payload.booleans, vec![false]);
        assert_eq!(replies[0].icid, icid);
        assert_ne!(icid, IcId::DEFAULT);
    }
}
