//! Built-in manager for composition text and candidate-list state.
//!
//! The manager keeps one composition record and one candidate-list tree
//! per input context, broadcasts every effective change, and answers
//! snapshot queries. Only the component that stored a candidate-list tree
//! may move its selection or toggle visibility.

use std::collections::HashMap;

use log::warn;

use super::{ConnectorId, Hub};
use crate::{
    component::{ComponentId, ComponentInfo},
    context::IcId,
    message::{CandidateList, Composition, ErrorCode, Message, MessageType, ReplyMode},
};

const STRING_ID: &str = "imhub.composition-manager";
const NAME: &str = "Composition Manager";

/// Broadcasts this manager produces; a consumer for them (typically a UI
/// surface) is requested whenever the manager joins a context.
const PRODUCE_MESSAGES: [MessageType; 5] = [
    MessageType::RequestConsumer,
    MessageType::CompositionChanged,
    MessageType::CandidateListChanged,
    MessageType::SelectedCandidateChanged,
    MessageType::CandidateListVisibilityChanged,
];

#[derive(Debug, Default)]
struct CandidateListState {
    list: CandidateList,
    /// Id of the sub-list the selection currently lives in.
    selected_list: u32,
}

#[derive(Debug, Default)]
pub(crate) struct CompositionManager {
    pub(super) connector: ConnectorId,
    pub(super) component: ComponentId,
    compositions: HashMap<IcId, Composition>,
    candidate_lists: HashMap<IcId, CandidateListState>,
}

impl CompositionManager {
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
        .produces(&PRODUCE_MESSAGES)
        .consumes(&[
            AttachToInputContext,
            DetachedFromInputContext,
            SetComposition,
            QueryComposition,
            SetCandidateList,
            SetSelectedCandidate,
            SetCandidateListVisibility,
            QueryCandidateList,
        ])
}

pub(super) fn handle(hub: &mut Hub, message: Message) -> bool {
    match message.message_type {
        MessageType::AttachToInputContext => on_attach_to_input_context(hub, message),
        MessageType::DetachedFromInputContext => on_detached_from_input_context(hub, message),
        MessageType::SetComposition => on_set_composition(hub, message),
        MessageType::QueryComposition => on_query_composition(hub, message),
        MessageType::SetCandidateList => on_set_candidate_list(hub, message),
        MessageType::SetSelectedCandidate => on_set_selected_candidate(hub, message),
        MessageType::SetCandidateListVisibility => {
            on_set_candidate_list_visibility(hub, message)
        }
        MessageType::QueryCandidateList => on_query_candidate_list(hub, message),
        other => {
            warn!("composition manager received unexpected {:?}", other);
            false
        }
    }
}

fn on_attach_to_input_context(hub: &mut Hub, message: Message) -> bool {
    let icid = message.icid;
    let connector = match hub.source_connector(&message) {
        Some(connector) => connector,
        None => return false,
    };
    hub.reply_true(connector, message);

    // The broadcasts are only useful if something displays them; ask the
    // hub to find a consumer (typically pulling in a UI surface).
    if icid != IcId::DEFAULT {
        let mut request = Message::new(MessageType::RequestConsumer)
            .with_source(hub.composition_manager.component)
            .with_target(ComponentId::DEFAULT)
            .with_icid(icid);
        request.payload.message_types.extend_from_slice(&PRODUCE_MESSAGES);
        let from = hub.composition_manager.connector;
        hub.dispatch(from, request);
    }
    true
}

fn on_detached_from_input_context(hub: &mut Hub, message: Message) -> bool {
    let icid = message.icid;
    hub.composition_manager.compositions.remove(&icid);
    hub.composition_manager.candidate_lists.remove(&icid);
    true
}

fn on_set_composition(hub: &mut Hub, message: Message) -> bool {
    let connector = match hub.source_connector(&message) {
        Some(connector) => connector,
        None => return false,
    };
    let mut message = match hub.check_source_attached(connector, message) {
        Some(message) => message,
        None => return true,
    };

    let icid = message.icid;
    let (changed, composition) = match message.payload.composition.take() {
        Some(composition) => {
            hub.composition_manager
                .compositions
                .insert(icid, composition.clone());
            (true, Some(composition))
        }
        None => (
            hub.composition_manager.compositions.remove(&icid).is_some(),
            None,
        ),
    };

    if changed {
        broadcast_change(hub, icid, MessageType::CompositionChanged, |payload| {
            payload.composition = composition.clone();
        });
    }
    hub.reply_true(connector, message)
}

fn on_query_composition(hub: &mut Hub, message: Message) -> bool {
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

    message.payload = Default::default();
    message.payload.composition = hub
        .composition_manager
        .compositions
        .get(&message.icid)
        .cloned();
    let reply = message.into_reply();
    hub.deliver(connector, reply);
    true
}

fn on_set_candidate_list(hub: &mut Hub, message: Message) -> bool {
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
    let (changed, snapshot) = match message.payload.candidate_list.take() {
        Some(mut list) => {
            set_candidate_list_owner(source, &mut list);
            let selected_list = list.id;
            hub.composition_manager.candidate_lists.insert(
                icid,
                CandidateListState {
                    list: list.clone(),
                    selected_list,
                },
            );
            (true, Some(list))
        }
        None => (
            hub.composition_manager
                .candidate_lists
                .remove(&icid)
                .is_some(),
            None,
        ),
    };

    if changed {
        broadcast_change(hub, icid, MessageType::CandidateListChanged, |payload| {
            payload.candidate_list = snapshot.clone();
        });
    }
    hub.reply_true(connector, message)
}

fn on_set_selected_candidate(hub: &mut Hub, message: Message) -> bool {
    let connector = match hub.source_connector(&message) {
        Some(connector) => connector,
        None => return false,
    };
    let message = match hub.check_source_attached(connector, message) {
        Some(message) => message,
        None => return true,
    };
    if message.payload.uints.len() != 2 {
        return hub.reply_error(connector, message, ErrorCode::InvalidPayload);
    }

    let icid = message.icid;
    let list_id = message.payload.uints[0];
    let candidate_id = message.payload.uints[1];

    let changed = match hub.composition_manager.candidate_lists.get_mut(&icid) {
        Some(state) => {
            let list = match find_candidate_list(&mut state.list, list_id) {
                Some(list) if list.owner == message.source => list,
                _ => return hub.reply_false(connector, message),
            };

            let mut changed = false;
            let candidate_count = list.candidates.len() as u32;
            if candidate_id < candidate_count {
                if list.selected_candidate != Some(candidate_id) {
                    list.selected_candidate = Some(candidate_id);
                    changed = true;
                }
            } else if list.selected_candidate.take().is_some() {
                changed = true;
            }
            if state.selected_list != list_id {
                state.selected_list = list_id;
                changed = true;
            }
            changed
        }
        None => return hub.reply_false(connector, message),
    };

    if changed {
        broadcast_change(hub, icid, MessageType::SelectedCandidateChanged, |payload| {
            payload.uints = vec![list_id, candidate_id];
        });
    }
    hub.reply_true(connector, message)
}

fn on_set_candidate_list_visibility(hub: &mut Hub, message: Message) -> bool {
    let connector = match hub.source_connector(&message) {
        Some(connector) => connector,
        None => return false,
    };
    let message = match hub.check_source_attached(connector, message) {
        Some(message) => message,
        None => return true,
    };
    if message.payload.uints.len() != 1 || message.payload.booleans.len() != 1 {
        return hub.reply_error(connector, message, ErrorCode::InvalidPayload);
    }

    let icid = message.icid;
    let list_id = message.payload.uints[0];
    let visible = message.payload.booleans[0];

    let changed = match hub.composition_manager.candidate_lists.get_mut(&icid) {
        Some(state) => {
            let list = match find_candidate_list(&mut state.list, list_id) {
                Some(list) if list.owner == message.source => list,
                _ => return hub.reply_false(connector, message),
            };
            if list.visible != visible {
                list.visible = visible;
                true
            } else {
                false
            }
        }
        None => return hub.reply_false(connector, message),
    };

    if changed {
        broadcast_change(
            hub,
            icid,
            MessageType::CandidateListVisibilityChanged,
            |payload| {
                payload.uints = vec![list_id];
                payload.booleans = vec![visible];
            },
        );
    }
    hub.reply_true(connector, message)
}

fn on_query_candidate_list(hub: &mut Hub, message: Message) -> bool {
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

    message.payload = Default::default();
    if let Some(state) = hub.composition_manager.candidate_lists.get(&message.icid) {
        message.payload.candidate_list = Some(state.list.clone());
        message.payload.uints.push(state.selected_list);
    }
    let reply = message.into_reply();
    hub.deliver(connector, reply);
    true
}

fn broadcast_change(
    hub: &mut Hub,
    icid: IcId,
    message_type: MessageType,
    fill: impl FnOnce(&mut crate::message::Payload),
) {
    let wanted = hub.input_contexts.get(&icid).map_or(false, |context| {
        context.may_consume(&hub.registry, message_type, false)
    });
    if !wanted {
        return;
    }
    let mut message = Message::new(message_type)
        .with_reply_mode(ReplyMode::NoReply)
        .with_source(hub.composition_manager.component)
        .with_target(ComponentId::BROADCAST)
        .with_icid(icid);
    fill(&mut message.payload);
    let from = hub.composition_manager.connector;
    hub.dispatch(from, message);
}

/// Stamps `owner` on every node of a candidate-list tree.
fn set_candidate_list_owner(owner: ComponentId, list: &mut CandidateList) {
    list.owner = owner;
    for candidate in &mut list.candidates {
        if let Some(sub_candidates) = &mut candidate.sub_candidates {
            set_candidate_list_owner(owner, sub_candidates);
        }
    }
}

/// Finds the (sub-)list with the given id anywhere in the tree.
fn find_candidate_list(top: &mut CandidateList, id: u32) -> Option<&mut CandidateList> {
    if top.id == id {
        return Some(top);
    }
    for candidate in &mut top.candidates {
        if let Some(sub_candidates) = &mut candidate.sub_candidates {
            if let Some(found) = find_candidate_list(sub_candidates, id) {
                return Some(found);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::message::{Candidate, ReplyMode};
    use crate::testing::{create_input_context, register_component, MockConnector};

    fn app_info(string_id: &str) -> ComponentInfo {
        use MessageType::*;
        ComponentInfo::new(string_id, "Application")
            .produces(&[CreateInputContext, QueryComposition, QueryCandidateList])
            .consumes(&[InsertText])
    }

    fn engine_info(string_id: &str) -> ComponentInfo {
        use MessageType::*;
        ComponentInfo::new(string_id, "Engine")
            .produces(&[
                AttachToInputContext,
                RequestConsumer,
                SetComposition,
                SetCandidateList,
                SetSelectedCandidate,
                SetCandidateListVisibility,
            ])
            .consumes(&[CompleteComposition])
    }

    fn ui_info(string_id: &str) -> ComponentInfo {
        use MessageType::*;
        ComponentInfo::new(string_id, "Candidate Window")
            .produces(&[AttachToInputContext])
            .consumes(&[
                CompositionChanged,
                CandidateListChanged,
                SelectedCandidateChanged,
                CandidateListVisibilityChanged,
            ])
    }

    struct CompositionBed {
        hub: Hub,
        engine: Rc<MockConnector>,
        engine_id: ComponentId,
        ui: Rc<MockConnector>,
        app: Rc<MockConnector>,
        app_id: ComponentId,
        icid: IcId,
    }

    fn composition_bed() -> CompositionBed {
        let mut hub = Hub::new();
        let app = MockConnector::new();
        let app_id = register_component(&mut hub, &app, app_info("test.app"));
        let engine = MockConnector::new();
        let engine_id = register_component(&mut hub, &engine, engine_info("test.engine"));
        let ui = MockConnector::new();
        let ui_id = register_component(&mut hub, &ui, ui_info("test.ui"));

        let icid = create_input_context(&mut hub, &app, app_id);
        for (connector, id) in [(&engine, engine_id), (&ui, ui_id)] {
            let message = Message::new(MessageType::AttachToInputContext)
                .with_reply_mode(ReplyMode::NeedReply)
                .with_source(id)
                .with_icid(icid);
            hub.dispatch(connector.connector(), message);
            connector.clear();
        }

        // Declaring what the engine will produce pulls the composition
        // manager into the context.
        let mut request = Message::new(MessageType::RequestConsumer)
            .with_source(engine_id)
            .with_icid(icid);
        request.payload.message_types.extend_from_slice(&[
            MessageType::SetComposition,
            MessageType::SetCandidateList,
            MessageType::SetSelectedCandidate,
            MessageType::SetCandidateListVisibility,
        ]);
        hub.dispatch(engine.connector(), request);
        engine.clear();
        ui.clear();

        CompositionBed {
            hub,
            engine,
            engine_id,
            ui,
            app,
            app_id,
            icid,
        }
    }

    /// id 1 at the top, candidate "b" expanding into list 12, whose
    /// candidate expands into list 15.
    fn nested_candidates(engine_id: ComponentId) -> CandidateList {
        CandidateList {
            id: 1,
            owner: engine_id,
            candidates: vec![
                Candidate {
                    id: 10,
                    text: "a".into(),
                    sub_candidates: None,
                },
                Candidate {
                    id: 11,
                    text: "b".into(),
                    sub_candidates: Some(CandidateList {
                        id: 12,
                        owner: engine_id,
                        candidates: vec![Candidate {
                            id: 13,
                            text: "b1".into(),
                            sub_candidates: Some(CandidateList {
                                id: 15,
                                owner: engine_id,
                                candidates: vec![Candidate {
                                    id: 16,
                                    text: "b1a".into(),
                                    sub_candidates: None,
                                }],
                                selected_candidate: None,
                                visible: false,
                            }),
                        }],
                        selected_candidate: None,
                        visible: false,
                    }),
                },
            ],
            selected_candidate: None,
            visible: true,
        }
    }

    fn set_candidate_list(bed: &mut CompositionBed, list: Option<CandidateList>) {
        let mut message = Message::new(MessageType::SetCandidateList)
            .with_reply_mode(ReplyMode::NeedReply)
            .with_source(bed.engine_id)
            .with_icid(bed.icid);
        message.payload.candidate_list = list;
        bed.hub.dispatch(bed.engine.connector(), message);
        bed.engine.clear();
    }

    #[test]
    fn composition_updates_broadcast_and_answer_queries() {
        let mut bed = composition_bed();

        let mut message = Message::new(MessageType::SetComposition)
            .with_reply_mode(ReplyMode::NeedReply)
            .with_source(bed.engine_id)
            .with_icid(bed.icid);
        message.payload.composition = Some(Composition {
            text: "ni hao".into(),
            caret: 6,
        });
        bed.hub.dispatch(bed.engine.connector(), message);

        let changed = bed.ui.messages_of_type(MessageType::CompositionChanged);
        assert_eq!(changed.len(), 1);
        assert_eq!(
            changed[0].payload.composition.as_ref().map(|c| c.text.as_str()),
            Some("ni hao")
        );

        let message = Message::new(MessageType::QueryComposition)
            .with_reply_mode(ReplyMode::NeedReply)
            .with_source(bed.app_id)
            .with_icid(bed.icid);
        bed.hub.dispatch(bed.app.connector(), message);
        let reply = bed
            .app
            .messages_of_type(MessageType::QueryComposition)
            .pop()
            .unwrap();
        assert_eq!(
            reply.payload.composition.as_ref().map(|c| c.caret),
            Some(6)
        );
    }

    #[test]
    fn clearing_an_absent_composition_is_silent() {
        let mut bed = composition_bed();

        let message = Message::new(MessageType::SetComposition)
            .with_reply_mode(ReplyMode::NeedReply)
            .with_source(bed.engine_id)
            .with_icid(bed.icid);
        bed.hub.dispatch(bed.engine.connector(), message);

        let reply = bed
            .engine
            .messages_of_type(MessageType::SetComposition)
            .pop()
            .unwrap();
        assert_eq!(reply.payload.booleans, vec![true]);
        assert!(bed
            .ui
            .messages_of_type(MessageType::CompositionChanged)
            .is_empty());
    }

    #[test]
    fn clearing_an_absent_candidate_list_is_silent() {
        let mut bed = composition_bed();
        let engine_id = bed.engine_id;
        set_candidate_list(&mut bed, Some(nested_candidates(engine_id)));
        bed.ui.clear();

        // First clear is a change, the second is not.
        set_candidate_list(&mut bed, None);
        assert_eq!(
            bed.ui
                .messages_of_type(MessageType::CandidateListChanged)
                .len(),
            1
        );
        bed.ui.clear();
        set_candidate_list(&mut bed, None);
        assert!(bed
            .ui
            .messages_of_type(MessageType::CandidateListChanged)
            .is_empty());
    }

    #[test]
    fn selection_and_visibility_travel_through_the_tree() {
        let mut bed = composition_bed();
        let engine_id = bed.engine_id;
        set_candidate_list(&mut bed, Some(nested_candidates(engine_id)));
        bed.ui.clear();

        // Select candidate 0 of the nested list 12.
        let mut message = Message::new(MessageType::SetSelectedCandidate)
            .with_reply_mode(ReplyMode::NeedReply)
            .with_source(bed.engine_id)
            .with_icid(bed.icid);
        message.payload.uints = vec![12, 0];
        bed.hub.dispatch(bed.engine.connector(), message);

        let changed = bed.ui.messages_of_type(MessageType::SelectedCandidateChanged);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].payload.uints, vec![12, 0]);

        // Show the innermost list 15.
        bed.ui.clear();
        let mut message = Message::new(MessageType::SetCandidateListVisibility)
            .with_reply_mode(ReplyMode::NeedReply)
            .with_source(bed.engine_id)
            .with_icid(bed.icid);
        message.payload.uints = vec![15];
        message.payload.booleans = vec![true];
        bed.hub.dispatch(bed.engine.connector(), message);

        let changed = bed
            .ui
            .messages_of_type(MessageType::CandidateListVisibilityChanged);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].payload.uints, vec![15]);
        assert_eq!(changed[0].payload.booleans, vec![true]);

        // A query reflects both mutations.
        let message = Message::new(MessageType::QueryCandidateList)
            .with_reply_mode(ReplyMode::NeedReply)
            .with_source(bed.app_id)
            .with_icid(bed.icid);
        bed.hub.dispatch(bed.app.connector(), message);
        let reply = bed
            .app
            .messages_of_type(MessageType::QueryCandidateList)
            .pop()
            .unwrap();
        assert_eq!(reply.payload.uints, vec![12]);
        let top = reply.payload.candidate_list.unwrap();
        let nested = top.candidates[1].sub_candidates.as_ref().unwrap();
        assert_eq!(nested.selected_candidate, Some(0));
        let innermost = nested.candidates[0].sub_candidates.as_ref().unwrap();
        assert!(innermost.visible);
    }

    #[test]
    fn only_the_tree_owner_may_mutate_it() {
        let mut bed = composition_bed();
        let engine_id = bed.engine_id;
        set_candidate_list(&mut bed, Some(nested_candidates(engine_id)));
        bed.ui.clear();

        let intruder = MockConnector::new();
        let intruder_id =
            register_component(&mut bed.hub, &intruder, engine_info("test.intruder"));
        let message = Message::new(MessageType::AttachToInputContext)
            .with_reply_mode(ReplyMode::NeedReply)
            .with_source(intruder_id)
            .with_icid(bed.icid);
        bed.hub.dispatch(intruder.connector(), message);
        intruder.clear();

        let mut message = Message::new(MessageType::SetSelectedCandidate)
            .with_reply_mode(ReplyMode::NeedReply)
            .with_source(intruder_id)
            .with_icid(bed.icid);
        message.payload.uints = vec![12, 0];
        bed.hub.dispatch(intruder.connector(), message);

        let reply = intruder
            .messages_of_type(MessageType::SetSelectedCandidate)
            .pop()
            .unwrap();
        assert_eq!(reply.payload.booleans, vec![false]);
        assert!(bed
            .ui
            .messages_of_type(MessageType::SelectedCandidateChanged)
            .is_empty());
    }

    #[test]
    fn selecting_out_of_range_clears_the_selection() {
        let mut bed = composition_bed();
        let mut list = nested_candidates(bed.engine_id);
        list.selected_candidate = Some(1);
        set_candidate_list(&mut bed, Some(list));
        bed.ui.clear();

        let mut message = Message::new(MessageType::SetSelectedCandidate)
            .with_reply_mode(ReplyMode::NeedReply)
            .with_source(bed.engine_id)
            .with_icid(bed.icid);
        message.payload.uints = vec![1, 7];
        bed.hub.dispatch(bed.engine.connector(), message);

        let message = Message::new(MessageType::QueryCandidateList)
            .with_reply_mode(ReplyMode::NeedReply)
            .with_source(bed.app_id)
            .with_icid(bed.icid);
        bed.hub.dispatch(bed.app.connector(), message);
        let reply = bed
            .app
            .messages_of_type(MessageType::QueryCandidateList)
            .pop()
            .unwrap();
        assert_eq!(reply.payload.candidate_list.unwrap().selected_candidate, None);
    }

    #[test]
    fn state_is_dropped_when_the_manager_leaves_the_context() {
        let mut bed = composition_bed();
        let engine_id = bed.engine_id;
        set_candidate_list(&mut bed, Some(nested_candidates(engine_id)));

        let manager = bed.hub.composition_manager.component;
        assert!(bed
            .hub
            .composition_manager
            .candidate_lists
            .contains_key(&bed.icid));
        bed.hub.detach_component(manager, bed.icid);
        assert!(!bed
            .hub
            .composition_manager
            .candidate_lists
            .contains_key(&bed.icid));
    }
}
