mod availability;
mod catalog;
mod error;
mod inventory;
mod lifecycle;
mod queries;
pub mod validator;

pub use availability::{free_slots, merge_overlapping, subtract_intervals};
pub use catalog::{NewItem, NewMaintenance, NewSpace, NewWindow};
pub use error::{EngineError, Entity, ErrorKind};
pub use lifecycle::NewReservation;
pub use queries::{AuditReport, UsageStats};

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::clock::Clock;
use crate::config::Policy;
use crate::model::*;
use crate::notify::{LifecycleEvent, NotificationDispatcher, NotificationStore, NotifyHub};
use crate::observability;
use crate::wal::Wal;

pub type SharedCalendar = Arc<RwLock<SpaceCalendar>>;
pub type SharedItem = Arc<Mutex<ItemLedger>>;
/// Active reservation ids of one requester on one date.
type DayLedger = Arc<Mutex<Vec<Ulid>>>;

// ── Journal seam ─────────────────────────────────────────

/// Durable, ordered storage for engine events.
#[async_trait]
pub trait Journal: Send + Sync {
    /// Resolves once the event is durable.
    async fn append(&self, event: &Event) -> io::Result<()>;
    /// Replace the whole journal with `snapshot`.
    async fn compact(&self, snapshot: Vec<Event>) -> io::Result<()>;
    async fn appends_since_compact(&self) -> io::Result<u64>;
}

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the shared result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, batch);
        // Compaction must see every append queued ahead of it.
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
    debug!("journal writer stopped");
}

fn commit_batch(wal: &mut Wal, mut batch: Vec<Pending>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();
    let result = flush_batch(wal, &batch);
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        error!(error = %e, batch = batch.len(), "journal flush failed");
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after a failed append so half-written bytes never leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => {}
    }
}

fn writer_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "journal writer shut down")
}

/// File-backed journal with a group-commit writer task.
pub struct WalJournal {
    tx: mpsc::Sender<WalCommand>,
}

impl WalJournal {
    /// Must be called inside a tokio runtime.
    pub fn spawn(wal: Wal) -> Self {
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, rx));
        Self { tx }
    }
}

#[async_trait]
impl Journal for WalJournal {
    async fn append(&self, event: &Event) -> io::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WalCommand::Append { event: event.clone(), response: tx })
            .await
            .map_err(|_| writer_gone())?;
        rx.await.map_err(|_| writer_gone())?
    }

    async fn compact(&self, snapshot: Vec<Event>) -> io::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WalCommand::Compact { events: snapshot, response: tx })
            .await
            .map_err(|_| writer_gone())?;
        rx.await.map_err(|_| writer_gone())?
    }

    async fn appends_since_compact(&self) -> io::Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .map_err(|_| writer_gone())?;
        rx.await.map_err(|_| writer_gone())
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    calendars: DashMap<Ulid, SharedCalendar>,
    items: DashMap<Ulid, SharedItem>,
    /// reservation id → (space id, date)
    reservation_index: DashMap<Ulid, (Ulid, NaiveDate)>,
    /// requester id → reservation ids, oldest first
    requester_index: DashMap<Ulid, Vec<Ulid>>,
    /// window / maintenance block id → space id
    catalog_index: DashMap<Ulid, Ulid>,
    day_ledgers: DashMap<(Ulid, NaiveDate), DayLedger>,
    /// link id → item id
    link_index: DashMap<Ulid, Ulid>,
    /// reservation id → link ids
    loans_by_reservation: DashMap<Ulid, Vec<Ulid>>,
    approvals: DashMap<Ulid, Vec<ApprovalEvent>>,
    notifications: NotificationStore,
    hub: NotifyHub,
    /// Held shared by every mutation, exclusively by compaction.
    writers: RwLock<()>,
    journal: Arc<dyn Journal>,
    clock: Arc<dyn Clock>,
    policy: Policy,
}

fn apply_to_calendar(cal: &mut SpaceCalendar, event: &Event) {
    match event {
        Event::SpaceUpdated { capacity, state, .. } => {
            cal.space.capacity = *capacity;
            cal.space.state = *state;
        }
        Event::WindowAdded { window } => cal.windows.push(window.clone()),
        Event::WindowRemoved { id, .. } => cal.windows.retain(|w| w.id != *id),
        Event::MaintenanceScheduled { block } => cal.blocks.push(block.clone()),
        Event::MaintenanceStateChanged { id, state, .. } => {
            if let Some(block) = cal.blocks.iter_mut().find(|b| b.id == *id) {
                block.state = *state;
            }
        }
        Event::ReservationCreated { reservation } => cal.insert_reservation(reservation.clone()),
        Event::ReservationRescheduled { id, from_date, date, range, .. } => {
            if let Some(mut r) = cal.remove_reservation(*from_date, *id) {
                r.date = *date;
                r.range = *range;
                cal.insert_reservation(r);
            }
        }
        Event::ReservationTransitioned { date, approval, .. } => {
            if let Some(r) = cal.reservation_mut(*date, approval.reservation_id) {
                r.apply_transition(approval);
            }
        }
        _ => {}
    }
}

fn apply_to_item(ledger: &mut ItemLedger, event: &Event) {
    match event {
        Event::ItemStateChanged { state, .. } => ledger.item.state = *state,
        Event::LoanRecorded { link, qty } => ledger.record_loan(link.clone(), *qty),
        Event::LoanReturned { link_id, at, .. } => {
            ledger.record_return(*link_id, *at);
        }
        Event::LinkRestored { link } => ledger.restore_link(link.clone()),
        Event::ReservationTransitioned { approval, returned, .. } => ledger.record_returns(returned, approval.at),
        _ => {}
    }
}

fn calendar_target(event: &Event) -> Option<Ulid> {
    match event {
        Event::SpaceUpdated { id, .. } => Some(*id),
        Event::WindowAdded { window } => Some(window.space_id),
        Event::MaintenanceScheduled { block } => Some(block.space_id),
        Event::ReservationCreated { reservation } => Some(reservation.space_id),
        Event::WindowRemoved { space_id, .. }
        | Event::MaintenanceStateChanged { space_id, .. }
        | Event::ReservationRescheduled { space_id, .. }
        | Event::ReservationTransitioned { space_id, .. } => Some(*space_id),
        _ => None,
    }
}

fn item_targets(event: &Event) -> Vec<Ulid> {
    match event {
        Event::ItemStateChanged { id, .. } => vec![*id],
        Event::LoanRecorded { link, .. } | Event::LinkRestored { link } => vec![link.item_id],
        Event::LoanReturned { item_id, .. } => vec![*item_id],
        Event::ReservationTransitioned { returned, .. } => returned.iter().map(|r| r.item_id).collect(),
        _ => Vec::new(),
    }
}

impl Engine {
    /// Replay the journal at `path`, then start its writer. Must run inside a tokio runtime.
    pub fn open(path: &Path, policy: Policy, clock: Arc<dyn Clock>) -> io::Result<Self> {
        let replay = Wal::replay(path)?;
        if replay.torn_tail {
            warn!(path = %path.display(), kept = replay.valid_len, "discarding torn journal tail");
            Wal::truncate_to(path, replay.valid_len)?;
        }
        let mut wal = Wal::open(path)?;
        wal.count_existing(replay.events.len() as u64);
        let journal = Arc::new(WalJournal::spawn(wal));
        Ok(Self::from_events(&replay.events, journal, policy, clock))
    }

    /// Rebuild state from `events` on top of an arbitrary journal.
    pub fn from_events(events: &[Event], journal: Arc<dyn Journal>, policy: Policy, clock: Arc<dyn Clock>) -> Self {
        let engine = Self {
            calendars: DashMap::new(),
            items: DashMap::new(),
            reservation_index: DashMap::new(),
            requester_index: DashMap::new(),
            catalog_index: DashMap::new(),
            day_ledgers: DashMap::new(),
            link_index: DashMap::new(),
            loans_by_reservation: DashMap::new(),
            approvals: DashMap::new(),
            notifications: NotificationStore::new(),
            hub: NotifyHub::new(),
            writers: RwLock::new(()),
            journal,
            clock,
            policy,
        };

        // Sole owner of every Arc here, so try_write/try_lock always succeed.
        // Never block: this may run inside an async context.
        for event in events {
            engine.index(event);
            if let Some(space_id) = calendar_target(event)
                && let Some(cal) = engine.calendars.get(&space_id)
            {
                let mut guard = cal.try_write().expect("replay: uncontended write");
                apply_to_calendar(&mut guard, event);
            }
            for item_id in item_targets(event) {
                if let Some(item) = engine.items.get(&item_id) {
                    let mut guard = item.try_lock().expect("replay: uncontended lock");
                    apply_to_item(&mut guard, event);
                }
            }
        }
        engine.rebuild_day_ledgers();
        engine
            .notifications
            .prune_dedup(engine.clock.now(), engine.policy.dedup_window);

        info!(
            events = events.len(),
            spaces = engine.calendars.len(),
            items = engine.items.len(),
            reservations = engine.reservation_index.len(),
            "engine state restored"
        );
        engine
    }

    fn rebuild_day_ledgers(&self) {
        let mut days: HashMap<(Ulid, NaiveDate), Vec<Ulid>> = HashMap::new();
        for entry in self.calendars.iter() {
            let cal = entry.value().try_read().expect("replay: uncontended read");
            for r in cal.bookings.values().flatten().filter(|r| r.state.is_active()) {
                days.entry((r.requester_id, r.date)).or_default().push(r.id);
            }
        }
        for (key, ids) in days {
            self.day_ledgers.insert(key, Arc::new(Mutex::new(ids)));
        }
    }

    /// Index and entity-creation side of an event. Locks nothing but DashMap shards.
    fn index(&self, event: &Event) {
        match event {
            Event::SpaceCreated { space } => {
                self.calendars
                    .insert(space.id, Arc::new(RwLock::new(SpaceCalendar::new(space.clone()))));
            }
            Event::ItemAdded { item } => {
                self.items.insert(item.id, Arc::new(Mutex::new(ItemLedger::new(item.clone()))));
            }
            Event::WindowAdded { window } => {
                self.catalog_index.insert(window.id, window.space_id);
            }
            Event::MaintenanceScheduled { block } => {
                self.catalog_index.insert(block.id, block.space_id);
            }
            Event::WindowRemoved { id, .. } => {
                self.catalog_index.remove(id);
            }
            Event::ReservationCreated { reservation } => {
                self.reservation_index
                    .insert(reservation.id, (reservation.space_id, reservation.date));
                self.requester_index
                    .entry(reservation.requester_id)
                    .or_default()
                    .push(reservation.id);
            }
            Event::ReservationRescheduled { id, space_id, date, .. } => {
                self.reservation_index.insert(*id, (*space_id, *date));
            }
            Event::ReservationTransitioned { approval, .. } => {
                self.approvals
                    .entry(approval.reservation_id)
                    .or_default()
                    .push(approval.clone());
            }
            Event::LoanRecorded { link, .. } | Event::LinkRestored { link } => {
                self.link_index.insert(link.id, link.item_id);
                let mut links = self.loans_by_reservation.entry(link.reservation_id).or_default();
                if !links.contains(&link.id) {
                    links.push(link.id);
                }
            }
            Event::NotificationCreated { notification } => {
                self.notifications.insert(notification.clone());
            }
            Event::NotificationRead { id, recipient, at } => {
                self.notifications.mark_read(*recipient, *id, *at);
            }
            _ => {}
        }
    }

    // ── Persistence ──────────────────────────────────────

    async fn persist(&self, event: &Event) -> Result<(), EngineError> {
        self.journal.append(event).await.map_err(|e| {
            error!(error = %e, "journal append failed");
            EngineError::Persistence(e.to_string())
        })
    }

    /// Journal-append, then apply to the locked calendar and the indexes.
    /// A failed append leaves memory untouched.
    async fn persist_to_calendar(&self, cal: &mut SpaceCalendar, event: &Event) -> Result<(), EngineError> {
        self.persist(event).await?;
        apply_to_calendar(cal, event);
        self.index(event);
        Ok(())
    }

    async fn persist_to_item(&self, ledger: &mut ItemLedger, event: &Event) -> Result<(), EngineError> {
        self.persist(event).await?;
        apply_to_item(ledger, event);
        self.index(event);
        Ok(())
    }

    /// For events that change a calendar and several item ledgers at once.
    /// Every affected lock is held by the caller.
    async fn persist_to_calendar_and_items(
        &self,
        cal: &mut SpaceCalendar,
        ledgers: &mut [OwnedMutexGuard<ItemLedger>],
        event: &Event,
    ) -> Result<(), EngineError> {
        self.persist(event).await?;
        apply_to_calendar(cal, event);
        for ledger in ledgers.iter_mut() {
            apply_to_item(ledger, event);
        }
        self.index(event);
        Ok(())
    }

    /// For events that touch neither a calendar nor an item.
    async fn persist_and_index(&self, event: &Event) -> Result<(), EngineError> {
        self.persist(event).await?;
        self.index(event);
        Ok(())
    }

    /// Store and deliver the notifications for a committed transition.
    /// Never fails the caller: a lost notification is logged and counted.
    async fn dispatch(&self, event: LifecycleEvent) {
        for notification in NotificationDispatcher::emit(&event) {
            if !self.notifications.claim(&notification, self.policy.dedup_window) {
                metrics::counter!(observability::NOTIFICATIONS_TOTAL, "outcome" => "deduplicated").increment(1);
                debug!(
                    reservation = %event.reservation.id,
                    kind = ?notification.kind,
                    recipient = ?notification.recipient,
                    "duplicate notification suppressed"
                );
                continue;
            }
            let record = Event::NotificationCreated { notification: notification.clone() };
            match self.journal.append(&record).await {
                Ok(()) => {
                    self.index(&record);
                    self.hub.send(&notification);
                    metrics::counter!(observability::NOTIFICATIONS_TOTAL, "outcome" => "sent").increment(1);
                }
                Err(e) => {
                    self.notifications.release(&notification);
                    metrics::counter!(observability::NOTIFICATIONS_TOTAL, "outcome" => "failed").increment(1);
                    warn!(
                        error = %e,
                        reservation = %event.reservation.id,
                        kind = ?notification.kind,
                        "notification not stored"
                    );
                }
            }
        }
    }

    // ── Lookups ──────────────────────────────────────────

    fn calendar(&self, space_id: Ulid) -> Result<SharedCalendar, EngineError> {
        self.calendars
            .get(&space_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::not_found(Entity::Space, space_id))
    }

    fn item(&self, item_id: Ulid) -> Result<SharedItem, EngineError> {
        self.items
            .get(&item_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::not_found(Entity::Item, item_id))
    }

    /// Where a reservation lives. The date is only stable while its calendar is locked.
    fn locate(&self, reservation_id: Ulid) -> Result<(Ulid, NaiveDate), EngineError> {
        self.reservation_index
            .get(&reservation_id)
            .map(|e| *e.value())
            .ok_or(EngineError::not_found(Entity::Reservation, reservation_id))
    }

    fn day_ledger(&self, requester_id: Ulid, date: NaiveDate) -> DayLedger {
        self.day_ledgers.entry((requester_id, date)).or_default().clone()
    }

    /// Drop an empty ledger nobody else holds. Call after releasing your own handle.
    fn release_day_ledger(&self, requester_id: Ulid, date: NaiveDate) {
        self.day_ledgers.remove_if(&(requester_id, date), |_, ledger| {
            Arc::strong_count(ledger) == 1 && ledger.try_lock().is_ok_and(|ids| ids.is_empty())
        });
    }

    #[cfg(test)]
    fn day_ledger_count(&self) -> usize {
        self.day_ledgers.len()
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn now(&self) -> NaiveDateTime {
        self.clock.now()
    }

    /// Live feed of new notifications for `recipient`.
    pub fn subscribe(&self, recipient: Recipient) -> broadcast::Receiver<Notification> {
        self.hub.subscribe(recipient)
    }

    // ── Compaction ───────────────────────────────────────

    /// Events that recreate the current state.
    async fn snapshot(&self) -> Vec<Event> {
        let mut events = Vec::new();

        let mut calendars: Vec<(Ulid, SharedCalendar)> =
            self.calendars.iter().map(|e| (*e.key(), e.value().clone())).collect();
        calendars.sort_by_key(|(id, _)| *id);
        for (space_id, cal) in calendars {
            let cal = cal.read().await;
            events.push(Event::SpaceCreated { space: cal.space.clone() });
            events.extend(cal.windows.iter().map(|w| Event::WindowAdded { window: w.clone() }));
            events.extend(cal.blocks.iter().map(|b| Event::MaintenanceScheduled { block: b.clone() }));
            for r in cal.bookings.values().flatten() {
                events.push(Event::ReservationCreated {
                    reservation: Reservation {
                        state: ReservationState::Pending,
                        approver_id: None,
                        admin_comment: None,
                        ..r.clone()
                    },
                });
                let history = self.approvals.get(&r.id).map(|a| a.value().clone()).unwrap_or_default();
                // Loans come back through LinkRestored below.
                events.extend(history.into_iter().map(|approval| Event::ReservationTransitioned {
                    space_id,
                    date: r.date,
                    approval,
                    returned: Vec::new(),
                }));
            }
        }

        let mut items: Vec<(Ulid, SharedItem)> =
            self.items.iter().map(|e| (*e.key(), e.value().clone())).collect();
        items.sort_by_key(|(id, _)| *id);
        for (_, item) in items {
            let ledger = item.lock().await;
            events.push(Event::ItemAdded { item: ledger.item.clone() });
            events.extend(ledger.links.iter().map(|l| Event::LinkRestored { link: l.clone() }));
        }

        events.extend(
            self.notifications
                .snapshot()
                .into_iter()
                .map(|notification| Event::NotificationCreated { notification }),
        );
        events
    }

    /// Rewrite the journal with only the events needed to recreate the current state.
    pub async fn compact_journal(&self) -> Result<(), EngineError> {
        let _exclusive = self.writers.write().await;
        let events = self.snapshot().await;
        let count = events.len();
        self.journal.compact(events).await.map_err(|e| {
            error!(error = %e, "journal compaction failed");
            EngineError::Persistence(e.to_string())
        })?;
        self.hub.prune();
        self.notifications.prune_dedup(self.clock.now(), self.policy.dedup_window);
        info!(events = count, "journal compacted");
        Ok(())
    }

    pub async fn journal_appends_since_compact(&self) -> u64 {
        self.journal.appends_since_compact().await.unwrap_or(0)
    }
}
