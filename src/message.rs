//! The message record exchanged through the hub and its payload types.

use thiserror::Error;

use crate::{
    component::{ComponentId, ComponentInfo, ComponentQuery},
    context::{IcId, InputContextInfo},
    keyboard::{HotkeyList, KeyEvent},
};

/// How a message relates to the request/reply protocol.
///
/// A reply travels backwards: its source is the component that consumed the
/// original message and its target is the original producer. Capability
/// checks in the router are inverted accordingly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyMode {
    NoReply,
    NeedReply,
    IsReply,
}

/// Stable numeric tags for every message the hub routes.
///
/// The codes are grouped in blocks of 0x100 per subsystem; requests occupy
/// the low half of a block and unsolicited notifications or broadcasts the
/// `0x10` offset. Codes are wire-stable and must never be renumbered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum MessageType {
    // Component registry
    RegisterComponent = 0x0101,
    DeregisterComponent = 0x0102,
    QueryComponent = 0x0103,
    ComponentCreated = 0x0111,
    ComponentDeleted = 0x0112,
    ComponentAttached = 0x0113,
    ComponentDetached = 0x0114,

    // Input context lifecycle
    CreateInputContext = 0x0201,
    DeleteInputContext = 0x0202,
    QueryInputContext = 0x0203,
    FocusInputContext = 0x0204,
    BlurInputContext = 0x0205,
    InputContextCreated = 0x0211,
    InputContextDeleted = 0x0212,
    InputContextGotFocus = 0x0213,
    InputContextLostFocus = 0x0214,

    // Attachment
    AttachToInputContext = 0x0301,
    DetachFromInputContext = 0x0302,
    DetachedFromInputContext = 0x0311,

    // Active-consumer control
    ActivateComponent = 0x0401,
    AssignActiveConsumer = 0x0402,
    ResignActiveConsumer = 0x0403,
    QueryActiveConsumer = 0x0404,
    RequestConsumer = 0x0405,
    ComponentActivated = 0x0411,
    ComponentDeactivated = 0x0412,
    ActiveConsumerChanged = 0x0413,

    // Key events
    SendKeyEvent = 0x0501,
    ProcessKeyEvent = 0x0502,

    // Hotkeys
    AddHotkeyList = 0x0601,
    RemoveHotkeyList = 0x0602,
    ActivateHotkeyList = 0x0603,
    DeactivateHotkeyList = 0x0604,
    QueryActiveHotkeyList = 0x0605,
    CheckHotkeyConflict = 0x0606,
    ActiveHotkeyListUpdated = 0x0611,

    // Command lists
    SetCommandList = 0x0701,
    UpdateCommands = 0x0702,
    QueryCommandList = 0x0703,
    CommandListChanged = 0x0711,

    // Composition and candidate lists
    SetComposition = 0x0801,
    QueryComposition = 0x0802,
    SetCandidateList = 0x0803,
    SetSelectedCandidate = 0x0804,
    SetCandidateListVisibility = 0x0805,
    QueryCandidateList = 0x0806,
    CancelComposition = 0x0807,
    CompleteComposition = 0x0808,
    CompositionChanged = 0x0811,
    CandidateListChanged = 0x0812,
    SelectedCandidateChanged = 0x0813,
    CandidateListVisibilityChanged = 0x0814,

    // Input method management
    ListInputMethods = 0x0901,
    SwitchToInputMethod = 0x0902,
    SwitchToNextInputMethodInList = 0x0903,
    SwitchToPreviousInputMethod = 0x0904,
    QueryActiveInputMethod = 0x0905,
    InputMethodActivated = 0x0911,

    // Text editing
    InsertText = 0x0a01,
}

/// Stable error codes carried by error replies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ErrorCode {
    #[error("invalid source component")]
    InvalidSource,
    #[error("invalid target component")]
    InvalidTarget,
    #[error("invalid input context")]
    InvalidInputContext,
    #[error("invalid reply mode")]
    InvalidReplyMode,
    #[error("invalid payload")]
    InvalidPayload,
    #[error("invalid message")]
    InvalidMessage,
    #[error("source can not produce this message")]
    SourceCanNotProduce,
    #[error("target can not consume this message")]
    TargetCanNotConsume,
    #[error("component not attached to the input context")]
    ComponentNotAttached,
    #[error("component not found")]
    ComponentNotFound,
    #[error("no active consumer")]
    NoActiveConsumer,
    #[error("failed to deliver to the target connector")]
    SendFailure,
    #[error("not implemented")]
    NotImplemented,
}

/// The error payload of an error reply: a stable code plus optional
/// free-form detail.
#[derive(Clone, Debug, PartialEq)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: Option<String>,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            message: None,
        }
    }
}

/// A single command as shown in a menu or toolbar, possibly carrying a
/// sub-menu.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Command {
    pub id: u32,
    pub title: String,
    pub enabled: bool,
    pub sub_commands: Option<CommandList>,
}

/// A tree of commands declared by one component for one input context.
///
/// `owner` is stamped by the hub on every node of the tree; clients cannot
/// forge ownership of a sub-tree.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommandList {
    pub owner: ComponentId,
    pub commands: Vec<Command>,
}

/// Uncommitted composition text of an input context.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Composition {
    pub text: String,
    pub caret: u32,
}

/// One conversion candidate, possibly expanding into a nested candidate
/// list.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Candidate {
    pub id: u32,
    pub text: String,
    pub sub_candidates: Option<CandidateList>,
}

/// A candidate list tree. Like command lists, `owner` is stamped by the hub
/// on every node when the tree is stored.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CandidateList {
    pub id: u32,
    pub owner: ComponentId,
    pub candidates: Vec<Candidate>,
    pub selected_candidate: Option<u32>,
    pub visible: bool,
}

/// The heterogeneous payload of a message. Which fields are meaningful
/// depends entirely on the message type.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Payload {
    pub uints: Vec<u32>,
    pub booleans: Vec<bool>,
    pub strings: Vec<String>,
    pub message_types: Vec<MessageType>,
    pub component_ids: Vec<ComponentId>,
    pub context_ids: Vec<IcId>,
    pub component_infos: Vec<ComponentInfo>,
    pub component_queries: Vec<ComponentQuery>,
    pub context_info: Option<InputContextInfo>,
    pub command_lists: Vec<CommandList>,
    pub hotkey_lists: Vec<HotkeyList>,
    pub composition: Option<Composition>,
    pub candidate_list: Option<CandidateList>,
    pub key_event: Option<KeyEvent>,
    pub error: Option<ErrorInfo>,
}

impl Payload {
    pub fn is_empty(&self) -> bool {
        self.uints.is_empty()
            && self.booleans.is_empty()
            && self.strings.is_empty()
            && self.message_types.is_empty()
            && self.component_ids.is_empty()
            && self.context_ids.is_empty()
            && self.component_infos.is_empty()
            && self.component_queries.is_empty()
            && self.context_info.is_none()
            && self.command_lists.is_empty()
            && self.hotkey_lists.is_empty()
            && self.composition.is_none()
            && self.candidate_list.is_none()
            && self.key_event.is_none()
            && self.error.is_none()
    }
}

/// A message routed by the hub.
///
/// Messages are plain values with single-owner semantics: every transfer
/// moves the record, broadcast fan-out clones one copy per recipient, and
/// reply synthesis consumes the request. `serial` is chosen by the sender
/// and preserved across the reply transform so requests can be correlated.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub message_type: MessageType,
    pub reply_mode: ReplyMode,
    pub source: ComponentId,
    pub target: ComponentId,
    pub icid: IcId,
    pub serial: u32,
    pub payload: Payload,
}

impl Message {
    /// Creates a message of the given type with no payload, addressed from
    /// and to the default component on the default input context.
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            reply_mode: ReplyMode::NoReply,
            source: ComponentId::DEFAULT,
            target: ComponentId::DEFAULT,
            icid: IcId::DEFAULT,
            serial: 0,
            payload: Payload::default(),
        }
    }

    pub fn with_reply_mode(mut self, reply_mode: ReplyMode) -> Self {
        self.reply_mode = reply_mode;
        self
    }

    pub fn with_source(mut self, source: ComponentId) -> Self {
        self.source = source;
        self
    }

    pub fn with_target(mut self, target: ComponentId) -> Self {
        self.target = target;
        self
    }

    pub fn with_icid(mut self, icid: IcId) -> Self {
        self.icid = icid;
        self
    }

    pub fn with_serial(mut self, serial: u32) -> Self {
        self.serial = serial;
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    #[inline]
    pub fn needs_reply(&self) -> bool {
        self.reply_mode == ReplyMode::NeedReply
    }

    #[inline]
    pub fn is_reply(&self) -> bool {
        self.reply_mode == ReplyMode::IsReply
    }

    pub fn is_error_reply(&self) -> bool {
        self.is_reply() && self.payload.error.is_some()
    }

    /// Turns a request into its reply: source and target swap roles, the
    /// serial number survives and the payload is kept for the handler to
    /// overwrite where needed.
    pub fn into_reply(mut self) -> Self {
        std::mem::swap(&mut self.source, &mut self.target);
        self.reply_mode = ReplyMode::IsReply;
        self
    }

    /// Turns a request into an error reply carrying `code`.
    pub fn into_error_reply(mut self, code: ErrorCode) -> Self {
        self.payload = Payload {
            error: Some(ErrorInfo::new(code)),
            ..Payload::default()
        };
        self.into_reply()
    }

    /// Turns a request into a reply whose payload is a single boolean.
    pub fn into_boolean_reply(mut self, value: bool) -> Self {
        self.payload = Payload {
            booleans: vec![value],
            ..Payload::default()
        };
        self.into_reply()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_transform_swaps_endpoints_and_keeps_serial() {
        let request = Message::new(MessageType::QueryComponent)
            .with_reply_mode(ReplyMode::NeedReply)
            .with_source(ComponentId(7))
            .with_target(ComponentId::DEFAULT)
            .with_serial(42);

        let reply = request.into_reply();
        assert_eq!(reply.reply_mode, ReplyMode::IsReply);
        assert_eq!(reply.source, ComponentId::DEFAULT);
        assert_eq!(reply.target, ComponentId(7));
        assert_eq!(reply.serial, 42);
    }

    #[test]
    fn error_reply_replaces_payload() {
        let request = Message::new(MessageType::SendKeyEvent)
            .with_reply_mode(ReplyMode::NeedReply)
            .with_source(ComponentId(3))
            .with_payload(Payload {
                uints: vec![1, 2, 3],
                ..Payload::default()
            });

        let reply = request.into_error_reply(ErrorCode::InvalidPayload);
        assert!(reply.payload.uints.is_empty());
        assert_eq!(
            reply.payload.error,
            Some(ErrorInfo::new(ErrorCode::InvalidPayload))
        );
        assert!(reply.is_error_reply());
    }

    #[test]
    fn boolean_reply_carries_single_flag() {
        let request = Message::new(MessageType::AttachToInputContext)
            .with_reply_mode(ReplyMode::NeedReply);
        let reply = request.into_boolean_reply(true);
        assert_eq!(reply.payload.booleans, vec![true]);
        assert!(!reply.is_error_reply());
    }

    #[test]
    fn empty_payload_reports_empty() {
        assert!(Payload::default().is_empty());
        let payload = Payload {
            booleans: vec![false],
            ..Payload::default()
        };
        assert!(!payload.is_empty());
    }
}
