use std::collections::{BTreeMap, VecDeque};

use proptest::prelude::*;
use proptest::test_runner::TestCaseError;

use waitline::{
    dispatch::engine::{DispatchEngine, DispatchError},
    ticket::TicketDraft,
    types::{ProfessionalId, RoutingKey, TicketId, TicketStatus},
};

const DAY: u32 = 20_000;
const DEPARTMENTS: u32 = 2;
const PROFESSIONALS: u32 = 3;

#[derive(Debug, Clone)]
enum Action {
    Register { department: u8, assigned: Option<u8> },
    CallNext { professional: u8, department: u8 },
    Finish { professional: u8 },
    Cancel { target: u8 },
    Requeue { professional: u8 },
}

fn action_strategy() -> impl Strategy<Value = Action> {
    prop_oneof![
        3 => (0u8..DEPARTMENTS as u8, prop::option::of(0u8..PROFESSIONALS as u8))
            .prop_map(|(department, assigned)| Action::Register { department, assigned }),
        3 => (0u8..PROFESSIONALS as u8, 0u8..DEPARTMENTS as u8)
            .prop_map(|(professional, department)| Action::CallNext { professional, department }),
        2 => (0u8..PROFESSIONALS as u8).prop_map(|professional| Action::Finish { professional }),
        2 => (0u8..64).prop_map(|target| Action::Cancel { target }),
        1 => (0u8..PROFESSIONALS as u8).prop_map(|professional| Action::Requeue { professional }),
    ]
}

/// Reference model mirroring the engine's documented semantics.
#[derive(Debug, Default)]
struct Model {
    queues: BTreeMap<RoutingKey, VecDeque<(TicketId, u64)>>,
    active: BTreeMap<ProfessionalId, TicketId>,
    status: BTreeMap<TicketId, TicketStatus>,
    arrival: BTreeMap<TicketId, u64>,
}

impl Model {
    fn register(&mut self, id: TicketId, key: RoutingKey, arrival: u64) {
        self.queues.entry(key).or_default().push_back((id, arrival));
        self.status.insert(id, TicketStatus::Waiting);
        self.arrival.insert(id, arrival);
    }

    fn call_next(
        &mut self,
        professional: ProfessionalId,
        department: u32,
    ) -> Option<TicketId> {
        if self.active.contains_key(&professional) {
            return None;
        }
        let candidates = [
            RoutingKey::assigned(department, professional),
            RoutingKey::unassigned(department),
        ];
        let chosen = candidates
            .iter()
            .filter_map(|key| {
                self.queues
                    .get(key)
                    .and_then(|q| q.front())
                    .map(|&(id, arrival)| (arrival, id, *key))
            })
            .min()?;
        self.queues
            .get_mut(&chosen.2)
            .and_then(|q| q.pop_front())
            .map(|(id, _)| {
                self.active.insert(professional, id);
                self.status.insert(id, TicketStatus::InService);
                id
            })
    }

    fn finish(&mut self, professional: ProfessionalId) -> Option<TicketId> {
        let id = self.active.remove(&professional)?;
        self.status.insert(id, TicketStatus::Finished);
        Some(id)
    }

    fn cancel(&mut self, id: TicketId) -> bool {
        match self.status.get(&id) {
            Some(TicketStatus::Waiting) => {
                for queue in self.queues.values_mut() {
                    if let Some(pos) = queue.iter().position(|&(qid, _)| qid == id) {
                        queue.remove(pos);
                        break;
                    }
                }
                self.status.insert(id, TicketStatus::Cancelled);
                true
            }
            Some(TicketStatus::InService) => {
                self.active.retain(|_, &mut tid| tid != id);
                self.status.insert(id, TicketStatus::Cancelled);
                true
            }
            _ => false,
        }
    }

    fn requeue(&mut self, professional: ProfessionalId, key: RoutingKey) -> Option<TicketId> {
        let id = self.active.remove(&professional)?;
        let arrival = self.arrival.get(&id).copied().unwrap_or(0);
        self.queues.entry(key).or_default().push_back((id, arrival));
        self.status.insert(id, TicketStatus::Waiting);
        Some(id)
    }
}

fn routing_keys() -> Vec<RoutingKey> {
    let mut keys = Vec::new();
    for department in 0..DEPARTMENTS {
        keys.push(RoutingKey::unassigned(department));
        for professional in 0..PROFESSIONALS {
            keys.push(RoutingKey::assigned(department, professional));
        }
    }
    keys
}

proptest! {
    #[test]
    fn random_sequences_match_the_reference_model(
        actions in prop::collection::vec(action_strategy(), 1..150)
    ) {
        let engine = DispatchEngine::new();
        let mut model = Model::default();
        let mut ids: Vec<TicketId> = Vec::new();
        let mut arrival: u64 = 0;

        for action in actions {
            match action {
                Action::Register { department, assigned } => {
                    arrival += 1;
                    let department = u32::from(department);
                    let professional = assigned.map(u32::from);
                    let (id, stored) = engine
                        .register(
                            TicketDraft {
                                patient_id: arrival,
                                department,
                                professional,
                                arrival_ms: arrival,
                            },
                            DAY,
                        )
                        .expect("register");
                    prop_assert_eq!(stored.ticket.status, TicketStatus::Waiting);
                    let key = RoutingKey { department, professional };
                    model.register(id, key, arrival);
                    ids.push(id);
                }
                Action::CallNext { professional, department } => {
                    let professional = u32::from(professional);
                    let department = u32::from(department);
                    let expected = model.call_next(professional, department);
                    match engine.call_next(professional, department) {
                        Ok((ticket, stored)) => {
                            prop_assert_eq!(Some(ticket.id), expected);
                            prop_assert_eq!(ticket.status, TicketStatus::InService);
                            prop_assert_eq!(ticket.served_by, Some(professional));
                            prop_assert_eq!(stored.transition.old_status, Some(TicketStatus::Waiting));
                        }
                        Err(DispatchError::QueueEmpty) => {
                            prop_assert_eq!(expected, None);
                        }
                        Err(DispatchError::ProfessionalBusy(p)) => {
                            prop_assert_eq!(p, professional);
                            prop_assert_eq!(expected, None);
                        }
                        Err(other) => prop_assert!(false, "unexpected call_next error: {other:?}"),
                    }
                }
                Action::Finish { professional } => {
                    let professional = u32::from(professional);
                    let ticket = engine.active_ticket(professional);
                    let expected = model.finish(professional);
                    match (ticket, expected) {
                        (Some(ticket), Some(id)) => {
                            prop_assert_eq!(ticket.id, id);
                            prop_assert!(engine.finish(id, professional).is_ok());
                        }
                        (None, None) => {}
                        (got, want) => {
                            prop_assert!(false, "active mismatch: engine={got:?} model={want:?}")
                        }
                    }
                }
                Action::Cancel { target } => {
                    if ids.is_empty() {
                        continue;
                    }
                    let id = ids[usize::from(target) % ids.len()];
                    let expected = model.cancel(id);
                    match engine.cancel(id, "test") {
                        Ok(Some(stored)) => {
                            prop_assert!(expected);
                            prop_assert_eq!(stored.ticket.status, TicketStatus::Cancelled);
                        }
                        // Repeat cancel: model refuses, engine no-ops.
                        Ok(None) => prop_assert!(!expected),
                        Err(DispatchError::InvalidTransition { from, .. }) => {
                            prop_assert!(!expected);
                            prop_assert_eq!(from, TicketStatus::Finished);
                        }
                        Err(other) => prop_assert!(false, "unexpected cancel error: {other:?}"),
                    }
                }
                Action::Requeue { professional } => {
                    let professional = u32::from(professional);
                    let ticket = engine.active_ticket(professional);
                    match ticket {
                        Some(ticket) => {
                            let expected = model.requeue(professional, ticket.routing_key());
                            prop_assert_eq!(expected, Some(ticket.id));
                            let stored = engine.requeue(ticket.id).expect("requeue");
                            prop_assert_eq!(stored.ticket.status, TicketStatus::Waiting);
                            prop_assert_eq!(stored.ticket.arrival_ms, ticket.arrival_ms);
                        }
                        None => {}
                    }
                }
            }

            check_location_exclusivity(&engine, &model, &ids)?;
        }
    }
}

fn check_location_exclusivity(
    engine: &DispatchEngine,
    model: &Model,
    ids: &[TicketId],
) -> Result<(), TestCaseError> {
    for key in routing_keys() {
        let engine_ids = engine.store().waiting_ids(key);
        let model_ids: Vec<TicketId> = model
            .queues
            .get(&key)
            .map(|q| q.iter().map(|&(id, _)| id).collect())
            .unwrap_or_default();
        prop_assert_eq!(engine_ids, model_ids, "queue mismatch for {:?}", key);
    }

    for &id in ids {
        let waiting = engine.store().contains(id);
        let in_service = engine.lookup(id).is_some_and(|t| t.status == TicketStatus::InService);
        let terminal = engine.terminal_status(id).is_some();
        let places = usize::from(waiting) + usize::from(in_service) + usize::from(terminal);
        prop_assert!(places <= 1, "ticket {} in {} places", id, places);

        let model_status = model.status.get(&id).copied();
        match model_status {
            Some(TicketStatus::Waiting) => prop_assert!(waiting),
            Some(TicketStatus::InService) => prop_assert!(in_service),
            Some(status) => prop_assert_eq!(engine.terminal_status(id), Some(status)),
            None => prop_assert_eq!(places, 0),
        }
    }
    Ok(())
}
