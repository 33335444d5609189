//! Imhub is an in-process IPC hub for input-method frameworks.
//!
//! Applications, input-method engines and UI surfaces participate as
//! *components*, each registered with the message types it may produce and
//! consume. They talk to the [`Hub`](hub::Hub) through bidirectional
//! [`Connector`](hub::Connector)s; the hub validates every message against
//! the declared capabilities and either delivers it to an explicit target,
//! fans it out to every eligible consumer, or answers it itself.
//!
//! Per *input context* — one focusable composition session — the hub keeps
//! an attachment graph with an active-consumer table, so that for every
//! message type at most one component receives unicast traffic while any
//! number may observe broadcasts. Built-in components service the hub's own
//! message surface: input-context lifecycle, hotkey matching, input-method
//! switching, command lists, and composition/candidate state. They sit on
//! the same dispatch bus as external components and are indistinguishable
//! from them.
//!
//! The hub is strictly single-threaded and cooperative: `dispatch` runs to
//! completion, synchronously draining every follow-up message it causes.
//! Transports running on other threads must marshal onto the hub's thread.
//!
//! # A minimal session
//!
//! ```ignore
//! use std::rc::Rc;
//! use imhub::prelude::*;
//!
//! struct App;
//!
//! impl Connector for App {
//!     fn send(&self, hub: &mut Hub, message: Message) -> bool {
//!         // Replies and broadcasts from the hub arrive here.
//!         println!("app received {:?}", message.message_type);
//!         true
//!     }
//! }
//!
//! let mut hub = Hub::new();
//! let app = hub.attach(Rc::new(App));
//!
//! // Register a component that sends key events and accepts text.
//! let mut register = Message::new(MessageType::RegisterComponent)
//!     .with_reply_mode(ReplyMode::NeedReply);
//! register.payload.component_infos.push(
//!     ComponentInfo::new("org.example.app", "Example App")
//!         .produces(&[MessageType::CreateInputContext, MessageType::SendKeyEvent])
//!         .consumes(&[MessageType::InsertText]),
//! );
//! hub.dispatch(app, register);
//! ```

pub mod component;
pub mod context;
pub mod default_input_method;
pub mod hub;
pub mod keyboard;
pub mod message;

#[cfg(test)]
pub(crate) mod testing;

pub use component::{ComponentId, ComponentInfo, ComponentQuery};
pub use context::{AttachState, IcId, InputContextInfo};
pub use default_input_method::DefaultInputMethod;
pub use hub::{Connector, ConnectorId, Hub, HubOptions};
pub use keyboard::{modifiers, Hotkey, HotkeyList, KeyEvent, KeyState};
pub use message::{
    Candidate, CandidateList, Command, CommandList, Composition, ErrorCode, ErrorInfo, Message,
    MessageType, Payload, ReplyMode,
};

pub mod prelude {
    //! The imhub prelude.
    pub use super::{
        AttachState, Candidate, CandidateList, Command, CommandList, ComponentId, ComponentInfo,
        ComponentQuery, Composition, Connector, ConnectorId, ErrorCode, Hotkey, HotkeyList, Hub,
        HubOptions, IcId, KeyEvent, KeyState, Message, MessageType, Payload, ReplyMode,
    };
}
