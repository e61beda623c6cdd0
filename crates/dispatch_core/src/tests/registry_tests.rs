use super::*;

#[test]
fn second_claim_on_busy_session_is_refused_until_evicted() {
    let registry = SessionRegistry::new();
    let id = SessionId::new("alpha");

    assert!(registry.claim(&id));
    assert!(!registry.claim(&id));
    assert!(registry.is_active(&id));

    registry.evict(&id);
    assert!(!registry.is_active(&id));
    assert!(registry.claim(&id));
}

#[test]
fn evict_reports_release_only_for_held_sessions() {
    let registry = SessionRegistry::new();
    let mut events = registry.subscribe();
    let id = SessionId::new("alpha");

    registry.evict(&id);
    assert!(events.try_recv().is_err());

    registry.claim(&id);
    registry.evict(&id);
    assert_eq!(
        events.try_recv().expect("released event"),
        SessionEvent::Released { session_id: id }
    );
}

#[test]
fn active_sessions_are_sorted() {
    let registry = SessionRegistry::new();
    registry.claim(&SessionId::new("charlie"));
    registry.claim(&SessionId::new("alpha"));
    registry.claim(&SessionId::new("bravo"));

    assert_eq!(
        registry.active_sessions(),
        vec![
            SessionId::new("alpha"),
            SessionId::new("bravo"),
            SessionId::new("charlie"),
        ]
    );
}

#[tokio::test]
async fn shutdown_aborts_pairing_tasks_and_keeps_running_operations() {
    let registry = SessionRegistry::new();
    let pairing = SessionId::new("pairing");
    let operation = SessionId::new("operation");
    let mut events = registry.subscribe();
    registry.claim(&pairing);
    registry.claim(&operation);

    let (started_tx, started_rx) = tokio::sync::oneshot::channel();
    registry.spawn_pairing(&pairing, async move {
        let _ = started_tx.send(());
        std::future::pending::<()>().await;
    });
    started_rx.await.expect("pairing task started");
    assert_eq!(registry.pending_pairings(), 1);

    registry.shutdown();

    assert_eq!(registry.pending_pairings(), 0);
    assert_eq!(registry.active_sessions(), vec![operation.clone()]);
    assert!(!registry.claim(&operation));

    registry.evict(&operation);
    assert_eq!(
        events.try_recv().expect("released event"),
        SessionEvent::Released {
            session_id: operation
        }
    );
}

#[tokio::test]
async fn a_pairing_task_that_finishes_at_once_still_releases_its_slot() {
    let registry = std::sync::Arc::new(SessionRegistry::new());
    let id = SessionId::new("pairing");
    registry.claim(&id);
    let mut events = registry.subscribe();

    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let task_registry = std::sync::Arc::clone(&registry);
    let task_id = id.clone();
    registry.spawn_pairing(&id, async move {
        task_registry.evict(&task_id);
        let _ = done_tx.send(());
    });
    done_rx.await.expect("pairing task finished");

    assert!(!registry.is_active(&id));
    assert_eq!(registry.pending_pairings(), 0);
    assert_eq!(
        events.try_recv().expect("released event"),
        SessionEvent::Released { session_id: id.clone() }
    );
    assert!(registry.claim(&id));
}
