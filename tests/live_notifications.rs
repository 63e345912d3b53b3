use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveTime};
use tokio::sync::broadcast;
use tokio_test::{assert_err, assert_ok};
use ulid::Ulid;

use reservo::auth::{Actor, Gate, Role};
use reservo::clock::FixedClock;
use reservo::config::Policy;
use reservo::engine::{Engine, ErrorKind, NewItem, NewSpace};
use reservo::model::*;

// ── Test infrastructure ──────────────────────────────────────

fn t(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 5, 1).unwrap()
}

fn actor(role: Role) -> Actor {
    Actor { id: Ulid::new(), role }
}

async fn start_gate() -> (Gate, Space) {
    let dir = std::env::temp_dir().join(format!("reservo_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let now = NaiveDate::from_ymd_opt(2025, 4, 28).unwrap().and_time(t(8, 0));
    let engine = Engine::open(&dir.join("reservo.wal"), Policy::default(), Arc::new(FixedClock::new(now))).unwrap();
    let gate = Gate::new(Arc::new(engine));
    let space = gate
        .create_space(
            actor(Role::Admin),
            NewSpace {
                name: "Sala 204".into(),
                kind: SpaceKind::MeetingRoom,
                building: Some("B".into()),
                floor: Some("2".into()),
                capacity: 12,
            },
        )
        .await
        .unwrap();
    (gate, space)
}

/// Wait for a notification with timeout.
async fn recv_notification(rx: &mut broadcast::Receiver<Notification>, timeout: Duration) -> Option<Notification> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().and_then(|r| r.ok())
}

async fn book(gate: &Gate, who: Actor, space: &Space, start: NaiveTime, end: NaiveTime) -> Ulid {
    gate.create_reservation(who, space.id, day(), start, end, "team sync".into(), 6)
        .await
        .unwrap()
        .id
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn staff_feed_receives_new_requests() {
    let (gate, space) = start_gate().await;
    let mut staff = gate.engine().subscribe(Recipient::Staff);

    let requester = actor(Role::Requester);
    let id = book(&gate, requester, &space, t(9, 0), t(10, 0)).await;

    let n = recv_notification(&mut staff, Duration::from_secs(5))
        .await
        .expect("expected staff notification");
    assert_eq!(n.kind, NotificationKind::ReservationCreated);
    assert_eq!(n.reservation_id, Some(id));
    assert_eq!(n.priority, Priority::High);
    assert!(n.body.contains("Sala 204"), "{}", n.body);
}

#[tokio::test]
async fn requester_hears_about_review() {
    let (gate, space) = start_gate().await;
    let requester = actor(Role::Requester);
    let mut inbox = gate.engine().subscribe(Recipient::User(requester.id));

    let id = book(&gate, requester, &space, t(9, 0), t(10, 0)).await;
    let created = recv_notification(&mut inbox, Duration::from_secs(5)).await.unwrap();
    assert_eq!(created.kind, NotificationKind::ReservationCreated);
    assert!(!created.staff_initiated);

    gate.approve_reservation(actor(Role::Approver), id, Some("enjoy".into()))
        .await
        .unwrap();
    let approved = recv_notification(&mut inbox, Duration::from_secs(5)).await.unwrap();
    assert_eq!(approved.kind, NotificationKind::ReservationApproved);
    assert!(approved.staff_initiated);
    assert!(approved.body.contains("Comment: enjoy"), "{}", approved.body);
}

#[tokio::test]
async fn notification_payload_is_valid_json() {
    let (gate, space) = start_gate().await;
    let requester = actor(Role::Requester);
    let mut inbox = gate.engine().subscribe(Recipient::User(requester.id));
    let id = book(&gate, requester, &space, t(9, 0), t(10, 0)).await;

    let n = recv_notification(&mut inbox, Duration::from_secs(5)).await.unwrap();
    let json = serde_json::to_value(&n).unwrap();
    assert_eq!(json["kind"], "ReservationCreated");
    assert_eq!(json["reservation_id"], id.to_string());
    assert_eq!(json["read"], false);
}

#[tokio::test]
async fn inbox_only_gets_own_reservations() {
    let (gate, space) = start_gate().await;
    let alice = actor(Role::Requester);
    let bob = actor(Role::Requester);
    let mut alice_inbox = gate.engine().subscribe(Recipient::User(alice.id));

    book(&gate, bob, &space, t(9, 0), t(10, 0)).await;
    assert!(
        recv_notification(&mut alice_inbox, Duration::from_millis(200)).await.is_none(),
        "should not receive someone else's notification"
    );

    book(&gate, alice, &space, t(10, 0), t(11, 0)).await;
    assert!(recv_notification(&mut alice_inbox, Duration::from_secs(5)).await.is_some());
}

#[tokio::test]
async fn dropped_subscriber_does_not_block_writers() {
    let (gate, space) = start_gate().await;
    let requester = actor(Role::Requester);
    let inbox = gate.engine().subscribe(Recipient::User(requester.id));
    drop(inbox);

    let id = book(&gate, requester, &space, t(9, 0), t(10, 0)).await;
    assert_ok!(gate.cancel_reservation(requester, id, None).await);
    assert_eq!(gate.list_notifications(requester, false, 10).len(), 2);
}

#[tokio::test]
async fn events_arrive_in_order() {
    let (gate, space) = start_gate().await;
    let requester = actor(Role::Requester);
    let staff = actor(Role::Admin);
    let mut inbox = gate.engine().subscribe(Recipient::User(requester.id));

    let id = book(&gate, requester, &space, t(9, 0), t(10, 0)).await;
    gate.approve_reservation(staff, id, None).await.unwrap();
    let item = gate
        .add_equipment_item(
            staff,
            NewItem {
                name: "HDMI cable".into(),
                category: ItemCategory::Electronics,
                total_qty: 10,
            },
        )
        .await
        .unwrap();
    let link = gate.request_equipment_loan(staff, id, item.id, 2).await.unwrap();
    gate.return_equipment_loan(staff, link.id).await.unwrap();
    gate.cancel_reservation(requester, id, Some("plans changed".into()))
        .await
        .unwrap();

    let mut kinds = Vec::new();
    while let Some(n) = recv_notification(&mut inbox, Duration::from_millis(200)).await {
        kinds.push(n.kind);
    }
    assert_eq!(
        kinds,
        vec![
            NotificationKind::ReservationCreated,
            NotificationKind::ReservationApproved,
            NotificationKind::EquipmentLoaned,
            NotificationKind::EquipmentReturned,
            NotificationKind::ReservationCancelled,
        ]
    );
}

#[tokio::test]
async fn requesters_cannot_review_or_read_staff_feed() {
    let (gate, space) = start_gate().await;
    let requester = actor(Role::Requester);
    let id = book(&gate, requester, &space, t(9, 0), t(10, 0)).await;

    let err = assert_err!(gate.approve_reservation(requester, id, None).await);
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    let err = assert_err!(gate.list_staff_notifications(requester, false, 10));
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    let other = actor(Role::Requester);
    let err = assert_err!(gate.cancel_reservation(other, id, None).await);
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    assert_eq!(assert_ok!(gate.list_staff_notifications(actor(Role::Approver), false, 10)).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_through_gate_admit_one() {
    let (gate, space) = start_gate().await;
    let gate = Arc::new(gate);
    let mut staff = gate.engine().subscribe(Recipient::Staff);

    let tasks = (0..16).map(|_| {
        let gate = gate.clone();
        let space_id = space.id;
        tokio::spawn(async move {
            gate.create_reservation(actor(Role::Requester), space_id, day(), t(14, 0), t(15, 0), "demo".into(), 4)
                .await
        })
    });
    let admitted = futures::future::join_all(tasks)
        .await
        .into_iter()
        .filter(|r| matches!(r, Ok(Ok(_))))
        .count();
    assert_eq!(admitted, 1);

    assert!(recv_notification(&mut staff, Duration::from_secs(5)).await.is_some());
    assert!(recv_notification(&mut staff, Duration::from_millis(200)).await.is_none());
}
