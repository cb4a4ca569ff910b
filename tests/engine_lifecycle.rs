use waitline::{
    core::{sequencer::{SequenceError, SequencerConfig}, store::StoreError},
    dispatch::engine::{DispatchEngine, DispatchError},
    ticket::TicketDraft,
    types::{RoutingKey, TicketStatus},
};

const DAY: u32 = 20_000;

fn draft(department: u32, professional: Option<u32>, arrival_ms: u64) -> TicketDraft {
    TicketDraft {
        patient_id: arrival_ms,
        department,
        professional,
        arrival_ms,
    }
}

#[test]
fn fifo_dispatch_across_two_professionals() {
    let engine = DispatchEngine::new();
    let (t1, _) = engine.register(draft(1, None, 100), DAY).unwrap();
    let (t2, _) = engine.register(draft(1, None, 105), DAY).unwrap();

    let (first, _) = engine.call_next(10, 1).unwrap();
    assert_eq!(first.id, t1);
    assert_eq!(first.status, TicketStatus::InService);
    assert_eq!(first.served_by, Some(10));
    assert!(first.called_ms.is_some());

    let (second, _) = engine.call_next(11, 1).unwrap();
    assert_eq!(second.id, t2);

    let stored = engine.finish(t1, 10).unwrap();
    assert!(stored.ticket.is_terminal());
    assert!(stored.ticket.finished_ms.is_some());
    assert_eq!(engine.terminal_status(t1), Some(TicketStatus::Finished));
    assert!(engine.lookup(t1).is_none());
}

#[test]
fn finish_requires_in_service_and_ownership() {
    let engine = DispatchEngine::new();
    let (id, _) = engine.register(draft(1, None, 1), DAY).unwrap();

    // Still waiting.
    assert_eq!(
        engine.finish(id, 10),
        Err(DispatchError::InvalidTransition {
            ticket_id: id,
            from: TicketStatus::Waiting
        })
    );

    engine.call_next(10, 1).unwrap();

    // Wrong professional.
    assert_eq!(
        engine.finish(id, 11),
        Err(DispatchError::InvalidTransition {
            ticket_id: id,
            from: TicketStatus::InService
        })
    );

    engine.finish(id, 10).unwrap();

    // Already terminal.
    assert_eq!(
        engine.finish(id, 10),
        Err(DispatchError::InvalidTransition {
            ticket_id: id,
            from: TicketStatus::Finished
        })
    );

    assert_eq!(
        engine.finish(999, 10),
        Err(DispatchError::Store(StoreError::NotFound(999)))
    );
}

#[test]
fn professional_holds_at_most_one_ticket() {
    let engine = DispatchEngine::new();
    engine.register(draft(1, None, 1), DAY).unwrap();
    engine.register(draft(1, None, 2), DAY).unwrap();

    let (first, _) = engine.call_next(10, 1).unwrap();
    assert_eq!(
        engine.call_next(10, 1),
        Err(DispatchError::ProfessionalBusy(10))
    );

    engine.finish(first.id, 10).unwrap();
    let (second, _) = engine.call_next(10, 1).unwrap();
    assert_ne!(second.id, first.id);
}

#[test]
fn call_next_prefers_the_oldest_across_candidate_queues() {
    let engine = DispatchEngine::new();
    // Older ticket sits in the shared queue, newer in the fixed queue.
    let (shared, _) = engine.register(draft(1, None, 10), DAY).unwrap();
    let (fixed, _) = engine.register(draft(1, Some(10), 20), DAY).unwrap();

    let (first, _) = engine.call_next(10, 1).unwrap();
    assert_eq!(first.id, shared);
    // Routing assignment stays unassigned; only the claimer is recorded.
    assert_eq!(first.professional, None);
    assert_eq!(first.served_by, Some(10));

    engine.finish(shared, 10).unwrap();
    let (second, _) = engine.call_next(10, 1).unwrap();
    assert_eq!(second.id, fixed);
}

#[test]
fn empty_queues_report_queue_empty() {
    let engine = DispatchEngine::new();
    assert_eq!(engine.call_next(10, 1), Err(DispatchError::QueueEmpty));

    // A fixed queue of another professional is not a candidate.
    engine.register(draft(1, Some(11), 1), DAY).unwrap();
    assert_eq!(engine.call_next(10, 1), Err(DispatchError::QueueEmpty));
}

#[test]
fn cancelled_waiting_tickets_are_skipped() {
    let engine = DispatchEngine::new();
    let (t1, _) = engine.register(draft(1, None, 1), DAY).unwrap();
    let (t2, _) = engine.register(draft(1, None, 2), DAY).unwrap();

    let stored = engine.cancel(t1, "left the building").unwrap().unwrap();
    assert_eq!(stored.transition.old_status, Some(TicketStatus::Waiting));
    assert_eq!(stored.ticket.cancel_reason.as_deref(), Some("left the building"));
    assert!(stored.ticket.called_ms.is_none());

    let (called, _) = engine.call_next(10, 1).unwrap();
    assert_eq!(called.id, t2);
}

#[test]
fn cancel_is_idempotent_and_rejects_finished() {
    let engine = DispatchEngine::new();
    let (t1, _) = engine.register(draft(1, None, 1), DAY).unwrap();

    assert!(engine.cancel(t1, "no-show").unwrap().is_some());
    // Second cancel: success, no new transition, status unchanged.
    assert!(engine.cancel(t1, "no-show").unwrap().is_none());
    assert_eq!(engine.terminal_status(t1), Some(TicketStatus::Cancelled));

    let (t2, _) = engine.register(draft(1, None, 2), DAY).unwrap();
    engine.call_next(10, 1).unwrap();
    engine.finish(t2, 10).unwrap();
    assert_eq!(
        engine.cancel(t2, "too late"),
        Err(DispatchError::InvalidTransition {
            ticket_id: t2,
            from: TicketStatus::Finished
        })
    );

    assert_eq!(
        engine.cancel(999, "ghost"),
        Err(DispatchError::Store(StoreError::NotFound(999)))
    );
}

#[test]
fn cancel_in_service_keeps_called_timestamp() {
    let engine = DispatchEngine::new();
    let (id, _) = engine.register(draft(1, None, 1), DAY).unwrap();
    engine.call_next(10, 1).unwrap();

    let stored = engine.cancel(id, "patient abandoned").unwrap().unwrap();
    assert_eq!(stored.transition.old_status, Some(TicketStatus::InService));
    assert!(stored.ticket.called_ms.is_some());
    // The professional is free again.
    assert!(engine.active_ticket(10).is_none());
    engine.register(draft(1, None, 2), DAY).unwrap();
    assert!(engine.call_next(10, 1).is_ok());
}

#[test]
fn requeue_goes_to_the_tail_with_original_arrival() {
    let engine = DispatchEngine::new();
    let (t1, _) = engine.register(draft(1, None, 10), DAY).unwrap();
    let (t2, _) = engine.register(draft(1, None, 20), DAY).unwrap();

    let (called, _) = engine.call_next(10, 1).unwrap();
    assert_eq!(called.id, t1);

    let stored = engine.requeue(t1).unwrap();
    assert_eq!(stored.ticket.status, TicketStatus::Waiting);
    assert_eq!(stored.ticket.arrival_ms, 10);
    assert!(stored.ticket.called_ms.is_none());
    assert!(stored.ticket.served_by.is_none());

    // Behind all current waiters despite the older arrival.
    assert_eq!(
        engine.store().waiting_ids(RoutingKey::unassigned(1)),
        vec![t2, t1]
    );
    // Reported wait still accrues from the original arrival.
    assert_eq!(stored.ticket.waited_ms(100), 90);

    // Requeue of a waiting ticket is invalid.
    assert_eq!(
        engine.requeue(t1),
        Err(DispatchError::InvalidTransition {
            ticket_id: t1,
            from: TicketStatus::Waiting
        })
    );
}

#[test]
fn reassign_preserves_fairness_accounting() {
    let engine = DispatchEngine::new();
    let (id, _) = engine.register(draft(1, None, 5), DAY).unwrap();
    let new_key = RoutingKey::assigned(2, 7);

    let stored = engine.reassign(id, new_key).unwrap();
    assert_eq!(stored.ticket.routing_key(), new_key);
    assert_eq!(stored.ticket.arrival_ms, 5);

    let (called, _) = engine.call_next(7, 2).unwrap();
    assert_eq!(called.id, id);

    // In-service tickets cannot be reassigned.
    assert_eq!(
        engine.reassign(id, RoutingKey::unassigned(1)),
        Err(DispatchError::InvalidTransition {
            ticket_id: id,
            from: TicketStatus::InService
        })
    );
}

#[test]
fn sequence_codes_scope_per_department_and_day() {
    let engine = DispatchEngine::new();
    let (_, s1) = engine.register(draft(0, None, 1), DAY).unwrap();
    let (_, s2) = engine.register(draft(0, None, 2), DAY).unwrap();
    let (_, s3) = engine.register(draft(1, None, 3), DAY).unwrap();
    let (_, s4) = engine.register(draft(0, None, 4), DAY + 1).unwrap();

    assert_eq!(s1.ticket.seq_code, "A001");
    assert_eq!(s2.ticket.seq_code, "A002");
    assert_eq!(s3.ticket.seq_code, "B001");
    assert_eq!(s4.ticket.seq_code, "A001");
}

#[test]
fn exhausted_code_space_surfaces_unwrapped() {
    let engine =
        DispatchEngine::with_sequencer_config(SequencerConfig { code_digits: 1 });
    for i in 0..9 {
        engine.register(draft(0, None, i), DAY).unwrap();
    }
    assert_eq!(
        engine.register(draft(0, None, 9), DAY),
        Err(DispatchError::Sequence(SequenceError::ExhaustedRange {
            department: 0,
            day: DAY
        }))
    );
}

#[test]
fn snapshot_restores_queues_actives_and_counters() {
    let engine = DispatchEngine::new();
    let (t1, _) = engine.register(draft(1, None, 1), DAY).unwrap();
    let (t2, _) = engine.register(draft(1, None, 2), DAY).unwrap();
    let (t3, _) = engine.register(draft(1, None, 3), DAY).unwrap();
    engine.call_next(10, 1).unwrap();
    engine.cancel(t3, "gone").unwrap();

    let snapshot = engine.export_snapshot();
    let restored =
        DispatchEngine::from_snapshot(snapshot, SequencerConfig::default()).unwrap();

    // Waiting order and active ownership survive.
    assert_eq!(
        restored.store().waiting_ids(RoutingKey::unassigned(1)),
        vec![t2]
    );
    assert_eq!(restored.active_ticket(10).map(|t| t.id), Some(t1));
    assert_eq!(restored.terminal_status(t3), Some(TicketStatus::Cancelled));

    // The sequencer does not restart, so codes stay unique.
    let (_, stored) = restored.register(draft(1, None, 4), DAY).unwrap();
    assert_eq!(stored.ticket.seq_code, "B004");
    // Ticket ids keep climbing past the snapshot watermark.
    assert!(stored.ticket.id > t3);
}
