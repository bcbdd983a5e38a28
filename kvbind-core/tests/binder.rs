use std::{sync::Arc, time::Duration};

use kvbind_core::{
    binding::{Bindable, BoundValue, CreateStrategy, SubscribeType},
    election::{LeaderState, LeaderTarget},
    error::BindError,
    kv_coordination::{ConnectionState, MemoryCoordinator, PathKey, RetryPolicy},
    watch::SyncState,
    Binder,
};
use parking_lot::Mutex;
use tokio::time::timeout;

const EVENTUALLY: Duration = Duration::from_secs(5);

fn path(p: &str) -> PathKey {
    PathKey::new(p).unwrap()
}

fn binder(store: &Arc<MemoryCoordinator>) -> Binder {
    Binder::with_retry_policy(
        store.clone(),
        RetryPolicy {
            max_retries: 20,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        },
    )
}

async fn eventually<T: PartialEq + Clone>(slot: &BoundValue<T>, want: T) {
    let mut rx = slot.subscribe();
    timeout(EVENTUALLY, rx.wait_for(|v| v.as_ref() == Some(&want)))
        .await
        .expect("timed out waiting for bound value")
        .unwrap();
}

async fn eventually_leader(binder: &Binder, p: &str, want: LeaderState) {
    timeout(EVENTUALLY, async {
        while binder.leader_state(p).unwrap() != Some(want) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for leader state");
}

async fn eventually_armed(binder: &Binder, p: &str) {
    timeout(EVENTUALLY, async {
        while binder.sync_state(p).unwrap() != Some(SyncState::Armed) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for watch");
}

#[tokio::test]
async fn config_limit_follows_external_writes() {
    let store = Arc::new(MemoryCoordinator::new());
    store.set(&path("/config/limit"), "10");
    let limit = BoundValue::<i32>::new();

    let mut binder = binder(&store);
    binder
        .register_value_binding(
            "/config/limit",
            "limit",
            limit.clone(),
            SubscribeType::DataChange,
            CreateStrategy::ConstructFromString,
            true,
        )
        .await
        .unwrap();
    // applied before any watch exists
    assert_eq!(limit.get(), Some(10));

    binder.start().await.unwrap();
    eventually_armed(&binder, "/config/limit").await;
    store.set(&path("/config/limit"), "25");
    eventually(&limit, 25).await;

    binder.stop().await.unwrap();
}

#[tokio::test]
async fn write_right_after_start_is_observed_without_initial_read() {
    let store = Arc::new(MemoryCoordinator::new());
    store.set(&path("/config/limit"), "10");
    let limit = BoundValue::<i32>::new();

    let mut binder = binder(&store);
    binder
        .register_value_binding(
            "/config/limit",
            "limit",
            limit.clone(),
            SubscribeType::DataChange,
            CreateStrategy::ConstructFromString,
            false,
        )
        .await
        .unwrap();
    binder.start().await.unwrap();
    // start returns with the watch armed
    assert_eq!(
        binder.sync_state("/config/limit").unwrap(),
        Some(SyncState::Armed)
    );
    assert_eq!(store.armed_watches(&path("/config/limit")), 1);

    store.set(&path("/config/limit"), "25");
    eventually(&limit, 25).await;
    binder.stop().await.unwrap();
}

#[tokio::test]
async fn start_fails_when_a_watch_cannot_arm() {
    let store = Arc::new(MemoryCoordinator::new());
    let mut binder = binder(&store);
    binder
        .register_value_binding(
            "/config/limit",
            "limit",
            BoundValue::<i32>::new(),
            SubscribeType::DataChange,
            CreateStrategy::ConstructFromString,
            false,
        )
        .await
        .unwrap();
    binder
        .register_leadership_binding("/member", LeaderTarget::flag(BoundValue::new()))
        .unwrap();

    store.set_connection_state(ConnectionState::Lost);
    let err = binder.start().await.unwrap_err();
    assert!(matches!(err, BindError::Coordination(ref err) if err.is_retryable()));
    assert_eq!(binder.sync_state("/config/limit").unwrap(), None);
    assert_eq!(binder.leader_state("/member").unwrap(), None);
}

#[tokio::test]
async fn every_binding_on_a_path_gets_the_initial_value() {
    let store = Arc::new(MemoryCoordinator::new());
    store.set(&path("/sms/phoneProvider"), "twilio");
    store.set(&path("/config/retries"), "3");
    let a = BoundValue::<String>::new();
    let b = BoundValue::<String>::new();
    let retries = BoundValue::<u8>::new();
    let calls = Arc::new(Mutex::new(Vec::new()));

    let mut binder = binder(&store);
    for slot in [&a, &b] {
        binder
            .register_value_binding(
                "/sms/phoneProvider",
                "phone",
                slot.clone(),
                SubscribeType::None,
                CreateStrategy::ConstructFromString,
                true,
            )
            .await
            .unwrap();
    }
    let sink = Arc::clone(&calls);
    binder
        .register_invoker_binding(
            "/sms/phoneProvider",
            "provider_changed",
            move |raw: &str| {
                sink.lock().push(raw.to_owned());
                Ok(())
            },
            SubscribeType::None,
            CreateStrategy::ConstructFromString,
            true,
        )
        .await
        .unwrap();
    binder
        .register_value_binding(
            "/config/retries",
            "retries",
            retries.clone(),
            SubscribeType::None,
            CreateStrategy::ConstructFromString,
            true,
        )
        .await
        .unwrap();
    binder.start().await.unwrap();

    assert_eq!(a.get().as_deref(), Some("twilio"));
    assert_eq!(b.get().as_deref(), Some("twilio"));
    assert_eq!(*calls.lock(), vec!["twilio".to_owned()]);
    assert_eq!(retries.get(), Some(3));
    // NONE paths are not watched
    assert_eq!(binder.sync_state("/config/retries").unwrap(), None);
    binder.stop().await.unwrap();
}

#[tokio::test]
async fn conflicting_policies_fail_before_arming() {
    let store = Arc::new(MemoryCoordinator::new());
    store.set(&path("/config/limit"), "10");
    store.set(&path("/config/other"), "1");
    let mut binder = binder(&store);
    binder
        .register_value_binding(
            "/config/other",
            "other",
            BoundValue::<i32>::new(),
            SubscribeType::DataChange,
            CreateStrategy::ConstructFromString,
            true,
        )
        .await
        .unwrap();
    binder
        .register_value_binding(
            "/config/limit",
            "a",
            BoundValue::<i32>::new(),
            SubscribeType::DataChange,
            CreateStrategy::ConstructFromString,
            true,
        )
        .await
        .unwrap();
    binder
        .register_value_binding(
            "/config/limit",
            "b",
            BoundValue::<i32>::new(),
            SubscribeType::None,
            CreateStrategy::ConstructFromString,
            true,
        )
        .await
        .unwrap();
    binder
        .register_leadership_binding("/member", LeaderTarget::flag(BoundValue::new()))
        .unwrap();

    let err = binder.start().await.unwrap_err();
    assert!(
        matches!(err, BindError::ConflictingSubscribeType { ref path } if path.as_str() == "/config/limit")
    );
    // no partial activation
    assert_eq!(store.armed_watches(&path("/config/other")), 0);
    assert_eq!(binder.sync_state("/config/other").unwrap(), None);
    assert_eq!(binder.leader_state("/member").unwrap(), None);
}

#[tokio::test]
async fn missing_path_fails_registration() {
    let store = Arc::new(MemoryCoordinator::new());
    let mut binder = binder(&store);
    let err = binder
        .register_value_binding(
            "/config/limit",
            "limit",
            BoundValue::<i32>::new(),
            SubscribeType::DataChange,
            CreateStrategy::ConstructFromString,
            true,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BindError::NoData { .. }));
}

#[derive(Debug, Clone, PartialEq)]
struct Provider(String);

impl Bindable for Provider {}

#[tokio::test]
async fn type_without_constructor_fails_registration() {
    let store = Arc::new(MemoryCoordinator::new());
    store.set(&path("/sms/phoneProvider"), "twilio");
    let mut binder = binder(&store);
    let err = binder
        .register_value_binding(
            "/sms/phoneProvider",
            "phone",
            BoundValue::<Provider>::new(),
            SubscribeType::None,
            CreateStrategy::ConstructFromString,
            true,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BindError::NoConstructor { .. }));
}

#[tokio::test]
async fn lookup_by_name_follows_changes() {
    let store = Arc::new(MemoryCoordinator::new());
    store.set(&path("/sms/phoneProvider"), "twilio");
    let phone = BoundValue::<Provider>::new();

    let mut binder = binder(&store);
    binder
        .dependencies()
        .insert("twilio", Provider("twilio".into()));
    binder
        .dependencies()
        .insert("nexmo", Provider("nexmo".into()));
    binder
        .register_value_binding(
            "/sms/phoneProvider",
            "phone",
            phone.clone(),
            SubscribeType::DataChange,
            CreateStrategy::LookupByName,
            true,
        )
        .await
        .unwrap();
    binder.start().await.unwrap();
    assert_eq!(phone.get(), Some(Provider("twilio".into())));
    eventually_armed(&binder, "/sms/phoneProvider").await;

    store.set(&path("/sms/phoneProvider"), "nexmo");
    eventually(&phone, Provider("nexmo".into())).await;

    // unknown name leaves the value as it was
    store.set(&path("/sms/phoneProvider"), "unknown");
    store.set(&path("/sms/phoneProvider"), "twilio");
    eventually(&phone, Provider("twilio".into())).await;
    binder.stop().await.unwrap();
}

#[tokio::test]
async fn last_write_wins() {
    let store = Arc::new(MemoryCoordinator::new());
    store.set(&path("/config/limit"), "0");
    let limit = BoundValue::<u64>::new();

    let mut binder = binder(&store);
    binder
        .register_value_binding(
            "/config/limit",
            "limit",
            limit.clone(),
            SubscribeType::DataChange,
            CreateStrategy::ConstructFromString,
            true,
        )
        .await
        .unwrap();
    binder.start().await.unwrap();

    for i in 1..=50u64 {
        store.set(&path("/config/limit"), i.to_string());
    }
    eventually(&limit, 50).await;
    binder.stop().await.unwrap();
}

#[tokio::test]
async fn leadership_is_exclusive_and_handed_over() {
    let store = Arc::new(MemoryCoordinator::new());
    let flag_a = BoundValue::new();
    let flag_b = BoundValue::new();

    let mut a = binder(&store);
    a.register_leadership_binding("/member", LeaderTarget::flag(flag_a.clone()))
        .unwrap();
    a.start().await.unwrap();
    eventually(&flag_a, true).await;

    let mut b = binder(&store);
    b.register_leadership_binding("/member", LeaderTarget::flag(flag_b.clone()))
        .unwrap();
    b.start().await.unwrap();
    eventually_leader(&b, "/member", LeaderState::Candidate).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(flag_a.is_true());
    assert!(!flag_b.is_true());

    a.stop().await.unwrap();
    assert!(!flag_a.is_true());
    eventually(&flag_b, true).await;
    assert_eq!(a.leader_state("/member").unwrap(), Some(LeaderState::Stopped));

    b.stop().await.unwrap();
    assert!(!flag_b.is_true());
}

#[tokio::test]
async fn step_down_releases_to_the_next_candidate() {
    let store = Arc::new(MemoryCoordinator::new());
    let flag_a = BoundValue::new();
    let flag_b = BoundValue::new();

    let mut a = binder(&store);
    a.register_leadership_binding("/member", LeaderTarget::flag(flag_a.clone()))
        .unwrap();
    a.start().await.unwrap();
    eventually(&flag_a, true).await;

    let mut b = binder(&store);
    b.register_leadership_binding("/member", LeaderTarget::flag(flag_b.clone()))
        .unwrap();
    b.start().await.unwrap();
    eventually_leader(&b, "/member", LeaderState::Candidate).await;

    assert!(a.step_down("/member").unwrap());
    eventually(&flag_b, true).await;
    assert!(!flag_a.is_true());
    assert!(!a.step_down("/member").unwrap());

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test]
async fn lost_connection_clears_flag_while_leading() {
    let store = Arc::new(MemoryCoordinator::new());
    let flag = BoundValue::new();
    let mut binder = binder(&store);
    binder
        .register_leadership_binding("/member", LeaderTarget::flag(flag.clone()))
        .unwrap();
    binder.start().await.unwrap();
    eventually(&flag, true).await;

    store.set_connection_state(ConnectionState::Lost);
    eventually(&flag, false).await;

    store.set_connection_state(ConnectionState::Reconnected);
    eventually(&flag, true).await;
    binder.stop().await.unwrap();
}

#[tokio::test]
async fn invoker_sees_leadership_transitions() {
    let store = Arc::new(MemoryCoordinator::new());
    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&states);
    let mut binder = binder(&store);
    binder
        .register_leadership_binding(
            "/member",
            LeaderTarget::invoker(move |leader| sink.lock().push(leader)),
        )
        .unwrap();
    binder.start().await.unwrap();
    eventually_leader(&binder, "/member", LeaderState::Leader).await;
    assert_eq!(*states.lock(), vec![false, true]);

    binder.stop().await.unwrap();
    assert_eq!(states.lock().last(), Some(&false));
}

#[tokio::test]
async fn stop_reports_failed_paths() {
    let store = Arc::new(MemoryCoordinator::new());
    store.set(&path("/config/limit"), "10");
    let limit = BoundValue::<i32>::new();
    let mut binder = binder(&store);
    binder
        .register_value_binding(
            "/config/limit",
            "limit",
            limit.clone(),
            SubscribeType::DataChange,
            CreateStrategy::ConstructFromString,
            true,
        )
        .await
        .unwrap();
    binder.start().await.unwrap();
    eventually_armed(&binder, "/config/limit").await;

    store.set(&path("/config/limit"), "not a number");
    timeout(EVENTUALLY, async {
        while binder.sync_state("/config/limit").unwrap() != Some(SyncState::Failed) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(limit.get(), Some(10));

    let snapshot = binder.snapshot();
    assert_eq!(snapshot.paths[0].state, Some(SyncState::Failed));
    assert!(matches!(
        binder.stop().await,
        Err(BindError::SyncFailed { paths }) if paths == vec![path("/config/limit")]
    ));
}
