//! Manager tests over the sync API with mock transports.


use std::sync::{mpsc, Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use eventsub_manager::EventSubManager;
use eventsub_stream::{
    AccountId, EventKind, FnListener, KindFilter, LifecycleState, Listener, ListenerResult,
    NormalizedEvent, SessionStatus, StatusLevel,
};
use mock_transport::{account, init_tracing, wait_until, KindRecorder, MockFactory, Shared};
use serde_json::json;

fn manager() -> (EventSubManager, MockFactory) {
    init_tracing();
    let factory = MockFactory::default();
    let manager = EventSubManager::with_factory(Arc::new(factory.clone())).unwrap();
    (manager, factory)
}

fn noop() -> Arc<dyn Listener> {
    Arc::new(FnListener::new(|_, _| Ok(())))
}

fn is_active(manager: &EventSubManager, id: &AccountId) -> bool {
    manager
        .status(id)
        .is_some_and(|s| s.state == LifecycleState::Active)
}

#[test]
fn test_listeners_share_one_session() {
    let (manager, factory) = manager();
    let alice = account("1001");
    let id = alice.account_id.clone();

    let first = manager.attach(alice.clone(), noop());
    let second = manager.attach(alice, noop());
    assert!(manager.has_session(&id));
    assert_eq!(manager.listener_count(&id), 2);

    wait_until(|| is_active(&manager, &id));
    let status = manager.status(&id).unwrap();
    assert_eq!(status.level, StatusLevel::Green);
    assert_eq!(status.text, "Logged in as user1001");
    assert_eq!(factory.log.count("connect:1001"), 1);

    assert!(manager.detach(&id, first));
    assert!(manager.has_session(&id));
    assert_eq!(factory.log.count("stop:1001"), 0);

    assert!(manager.detach(&id, second));
    assert!(!manager.has_session(&id));
    assert_eq!(manager.listener_count(&id), 0);
    assert!(manager.status(&id).is_none());

    wait_until(|| factory.log.count("stop:1001") == 1);
    assert_eq!(factory.log.count("revoke:sub-1001-channelFollow"), 1);
    assert_eq!(factory.log.count("revoke:sub-1001-channelRaidTo"), 1);

    // Already gone.
    assert!(!manager.detach(&id, second));

    manager.shutdown().unwrap();
}

#[test]
fn test_reopen_waits_for_previous_teardown() {
    let (manager, factory) = manager();
    let alice = account("1001");
    let id = alice.account_id.clone();

    let listener = manager.attach(alice.clone(), noop());
    wait_until(|| is_active(&manager, &id));

    manager.detach(&id, listener);
    manager.attach(alice, noop());
    wait_until(|| is_active(&manager, &id));

    let connects_and_stops: Vec<_> = factory
        .log
        .entries()
        .into_iter()
        .filter(|e| e.starts_with("connect:") || e.starts_with("stop:"))
        .collect();
    assert_eq!(
        connects_and_stops,
        vec!["connect:1001", "stop:1001", "connect:1001"]
    );

    manager.shutdown().unwrap();
}

#[test]
fn test_events_fan_out_per_listener_filter() {
    let (manager, factory) = manager();
    let alice = account("1001");
    let id = alice.account_id.clone();

    let everything = Arc::new(KindRecorder::default());
    let follows = Arc::new(KindRecorder::default());
    manager.attach(alice.clone(), Arc::new(Shared(Arc::clone(&everything))));
    manager.attach(
        alice,
        Arc::new(KindFilter::new(
            [EventKind::ChannelFollow],
            Shared(Arc::clone(&follows)),
        )),
    );
    wait_until(|| is_active(&manager, &id));

    assert!(factory
        .log
        .notify(&id, EventKind::ChannelFollow, json!({"user_name": "viewer"})));
    assert!(factory
        .log
        .notify(&id, EventKind::ChannelRaidTo, json!({"viewers": 12})));

    wait_until(|| everything.kinds().len() == 2);
    assert_eq!(
        everything.kinds(),
        vec![EventKind::ChannelFollow, EventKind::ChannelRaidTo]
    );
    wait_until(|| !follows.kinds().is_empty());
    assert_eq!(follows.kinds(), vec![EventKind::ChannelFollow]);

    manager.shutdown().unwrap();
}

#[test]
fn test_accounts_are_independent() {
    let (manager, factory) = manager();
    let alice = account("1001");
    let bob = account("2002");

    let alice_listener = manager.attach(alice.clone(), noop());
    manager.attach(bob.clone(), noop());
    assert_eq!(
        manager.accounts(),
        vec![alice.account_id.clone(), bob.account_id.clone()]
    );

    wait_until(|| is_active(&manager, &alice.account_id));
    wait_until(|| is_active(&manager, &bob.account_id));

    manager.detach(&alice.account_id, alice_listener);
    assert_eq!(manager.accounts(), vec![bob.account_id.clone()]);
    wait_until(|| factory.log.count("stop:1001") == 1);
    assert_eq!(factory.log.count("stop:2002"), 0);
    assert!(is_active(&manager, &bob.account_id));

    manager.shutdown().unwrap();
}

#[test]
fn test_shutdown_closes_every_session() {
    let (manager, factory) = manager();
    let alice = account("1001");
    let bob = account("2002");

    manager.attach(alice.clone(), noop());
    manager.attach(bob.clone(), noop());
    wait_until(|| is_active(&manager, &alice.account_id));
    wait_until(|| is_active(&manager, &bob.account_id));

    manager.shutdown().unwrap();

    assert_eq!(factory.log.count("stop:1001"), 1);
    assert_eq!(factory.log.count("stop:2002"), 1);
}

#[test]
fn test_detach_unknown_account() {
    let (manager, _factory) = manager();
    let alice = account("1001");
    let listener = manager.attach(alice, noop());

    assert!(!manager.detach(&AccountId::new("9999"), listener));
    assert!(manager.accounts().len() == 1);

    manager.shutdown().unwrap();
}

#[test]
fn test_stale_listener_id_does_not_detach_next_session() {
    let (manager, factory) = manager();
    let alice = account("1001");
    let id = alice.account_id.clone();

    let first = manager.attach(alice.clone(), noop());
    assert!(manager.detach(&id, first));
    let second = manager.attach(alice, noop());
    assert_ne!(first, second);

    assert!(!manager.detach(&id, first));
    assert!(manager.has_session(&id));
    assert_eq!(manager.listener_count(&id), 1);

    wait_until(|| is_active(&manager, &id));
    assert!(factory.log.count("connect:1001") >= 1);

    manager.shutdown().unwrap();
}

/// Calls back into the manager from every status update.
struct Reentrant {
    manager: Arc<OnceLock<Weak<EventSubManager>>>,
    seen: Mutex<Vec<usize>>,
}

impl Listener for Reentrant {
    fn on_event(&self, _event: &NormalizedEvent, _kind: EventKind) -> ListenerResult {
        Ok(())
    }

    fn on_status(&self, _status: &SessionStatus) {
        if let Some(manager) = self.manager.get().and_then(Weak::upgrade) {
            let accounts = manager.accounts().len();
            self.seen.lock().unwrap().push(accounts);
        }
    }
}

#[test]
fn test_listener_may_call_back_into_manager_on_attach() {
    init_tracing();
    let manager = Arc::new(EventSubManager::with_factory(Arc::new(MockFactory::default())).unwrap());
    let slot = Arc::new(OnceLock::new());
    let _ = slot.set(Arc::downgrade(&manager));

    manager.attach(account("1001"), noop());
    let listener = Arc::new(Reentrant {
        manager: Arc::clone(&slot),
        seen: Mutex::new(Vec::new()),
    });

    let (done_tx, done_rx) = mpsc::channel();
    let attaching = Arc::clone(&manager);
    let attached = Arc::clone(&listener);
    std::thread::spawn(move || {
        attaching.attach(account("2002"), attached);
        let _ = done_tx.send(());
    });

    done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("attach did not return");
    assert_eq!(listener.seen.lock().unwrap().first(), Some(&2));
    assert_eq!(manager.accounts().len(), 2);
}
