use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::*;

const CHANNEL_CAPACITY: usize = 256;

// ── Dispatcher ───────────────────────────────────────────────────

/// What happened to a reservation (or its equipment).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Created,
    Approved { comment: Option<String> },
    Rejected { reason: Option<String> },
    Cancelled { reason: Option<String> },
    Rescheduled { previous_date: NaiveDate, previous_range: TimeRange },
    EquipmentLoaned { link_id: Ulid, item_name: String, qty: u32 },
    EquipmentReturned { link_id: Ulid, item_name: String, qty: u32 },
}

/// A committed transition, with enough context to phrase the notifications.
#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    pub reservation: Reservation,
    pub space_name: String,
    pub actor_id: Ulid,
    pub at: NaiveDateTime,
    pub change: Change,
}

/// Maps lifecycle and inventory events to notification records. Holds no state.
pub struct NotificationDispatcher;

impl NotificationDispatcher {
    /// One notification for the requester and one audit entry for the staff feed.
    pub fn emit(event: &LifecycleEvent) -> Vec<Notification> {
        let r = &event.reservation;
        let when = format!("{} {}", r.date.format("%d/%m/%Y"), r.range);
        let staff_initiated = event.actor_id != r.requester_id;
        let space = &event.space_name;

        let (kind, user_title, user_body, staff_title, staff_body, priority) = match &event.change {
            Change::Created => (
                NotificationKind::ReservationCreated,
                "Reservation request received".to_string(),
                format!("Your request for {space} on {when} was received and is pending approval."),
                "New reservation request".to_string(),
                format!("A new request for {space} on {when} is waiting for review."),
                Priority::High,
            ),
            Change::Approved { comment } => (
                NotificationKind::ReservationApproved,
                "Reservation approved".to_string(),
                with_note(format!("Your reservation for {space} on {when} was approved."), "Comment", comment),
                "Reservation approved".to_string(),
                format!("Reservation for {space} on {when} was approved by {}.", event.actor_id),
                Priority::Medium,
            ),
            Change::Rejected { reason } => (
                NotificationKind::ReservationRejected,
                "Reservation rejected".to_string(),
                with_note(format!("Your reservation for {space} on {when} was rejected."), "Reason", reason),
                "Reservation rejected".to_string(),
                with_note(
                    format!("Reservation for {space} on {when} was rejected by {}.", event.actor_id),
                    "Reason",
                    reason,
                ),
                Priority::Medium,
            ),
            Change::Cancelled { reason } => {
                let by = if staff_initiated { "by staff" } else { "by the requester" };
                (
                    NotificationKind::ReservationCancelled,
                    "Reservation cancelled".to_string(),
                    with_note(
                        format!("Your reservation for {space} on {when} was cancelled {by}."),
                        "Reason",
                        reason,
                    ),
                    "Reservation cancelled".to_string(),
                    with_note(format!("Reservation for {space} on {when} was cancelled {by}."), "Reason", reason),
                    Priority::Medium,
                )
            }
            Change::Rescheduled { previous_date, previous_range } => {
                let before = format!("{} {}", previous_date.format("%d/%m/%Y"), previous_range);
                (
                    NotificationKind::ReservationRescheduled,
                    "Reservation rescheduled".to_string(),
                    format!("Your request for {space} moved from {before} to {when} and is pending approval."),
                    "Reservation rescheduled".to_string(),
                    format!("A pending request for {space} moved from {before} to {when}."),
                    Priority::Medium,
                )
            }
            Change::EquipmentLoaned { item_name, qty, .. } => (
                NotificationKind::EquipmentLoaned,
                "Equipment handed out".to_string(),
                format!("{qty} × {item_name} were loaned for your reservation of {space} on {when}."),
                "Equipment loaned".to_string(),
                format!("{qty} × {item_name} loaned against the reservation of {space} on {when}."),
                Priority::Low,
            ),
            Change::EquipmentReturned { item_name, qty, .. } => (
                NotificationKind::EquipmentReturned,
                "Equipment returned".to_string(),
                format!("{qty} × {item_name} from your reservation of {space} on {when} were returned."),
                "Equipment returned".to_string(),
                format!("{qty} × {item_name} returned from the reservation of {space} on {when}."),
                Priority::Low,
            ),
        };

        let link_id = match &event.change {
            Change::EquipmentLoaned { link_id, .. } | Change::EquipmentReturned { link_id, .. } => Some(*link_id),
            _ => None,
        };
        let base = |recipient, title, body, priority| Notification {
            id: Ulid::new(),
            recipient,
            kind,
            title,
            body,
            priority,
            read: false,
            read_at: None,
            created_at: event.at,
            reservation_id: Some(r.id),
            link_id,
            staff_initiated,
        };

        vec![
            base(Recipient::User(r.requester_id), user_title, user_body, Priority::Medium),
            base(Recipient::Staff, staff_title, staff_body, priority),
        ]
    }
}

fn with_note(mut body: String, label: &str, note: &Option<String>) -> String {
    if let Some(note) = note.as_deref().filter(|n| !n.trim().is_empty()) {
        body.push_str(&format!(" {label}: {note}"));
    }
    body
}

// ── Store ────────────────────────────────────────────────────────

/// Same kind, same reservation, same stream. Equipment kinds add the loan link.
type DedupKey = (Recipient, NotificationKind, Ulid, Option<Ulid>);

fn dedup_key(n: &Notification) -> Option<DedupKey> {
    n.reservation_id.map(|rid| (n.recipient, n.kind, rid, n.link_id))
}

/// User inboxes plus the staff feed, with the duplicate guard.
pub struct NotificationStore {
    /// Oldest first.
    inboxes: DashMap<Recipient, Vec<Notification>>,
    last_sent: DashMap<DedupKey, NaiveDateTime>,
}

impl Default for NotificationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationStore {
    pub fn new() -> Self {
        Self {
            inboxes: DashMap::new(),
            last_sent: DashMap::new(),
        }
    }

    /// Reserve the dedup slot for `n`. Returns false if an identical
    /// notification went out less than `window` ago.
    pub fn claim(&self, n: &Notification, window: TimeDelta) -> bool {
        let Some(key) = dedup_key(n) else { return true };
        match self.last_sent.entry(key) {
            Entry::Occupied(mut e) => {
                if n.created_at - *e.get() < window {
                    return false;
                }
                e.insert(n.created_at);
                true
            }
            Entry::Vacant(e) => {
                e.insert(n.created_at);
                true
            }
        }
    }

    /// Forget send times that can no longer suppress anything.
    pub fn prune_dedup(&self, now: NaiveDateTime, window: TimeDelta) {
        self.last_sent.retain(|_, at| now - *at < window);
    }

    /// Undo a claim whose notification could not be stored.
    pub fn release(&self, n: &Notification) {
        if let Some(key) = dedup_key(n) {
            self.last_sent.remove_if(&key, |_, at| *at == n.created_at);
        }
    }

    pub fn insert(&self, n: Notification) {
        if let Some(key) = dedup_key(&n) {
            self.last_sent
                .entry(key)
                .and_modify(|at| *at = (*at).max(n.created_at))
                .or_insert(n.created_at);
        }
        self.inboxes.entry(n.recipient).or_default().push(n);
    }

    /// Newest first.
    pub fn list(&self, recipient: Recipient, unread_only: bool, limit: usize) -> Vec<Notification> {
        let Some(inbox) = self.inboxes.get(&recipient) else { return Vec::new() };
        inbox
            .iter()
            .rev()
            .filter(|n| !unread_only || !n.read)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn unread_count(&self, recipient: Recipient) -> usize {
        self.inboxes
            .get(&recipient)
            .map(|inbox| inbox.iter().filter(|n| !n.read).count())
            .unwrap_or(0)
    }

    pub fn contains(&self, recipient: Recipient, id: Ulid) -> Option<bool> {
        self.inboxes
            .get(&recipient)?
            .iter()
            .find(|n| n.id == id)
            .map(|n| n.read)
    }

    /// Returns false if `id` is not in `recipient`'s inbox.
    pub fn mark_read(&self, recipient: Recipient, id: Ulid, at: NaiveDateTime) -> bool {
        let Some(mut inbox) = self.inboxes.get_mut(&recipient) else { return false };
        match inbox.iter_mut().find(|n| n.id == id) {
            Some(n) => {
                if !n.read {
                    n.read = true;
                    n.read_at = Some(at);
                }
                true
            }
            None => false,
        }
    }

    pub fn unread_ids(&self, recipient: Recipient) -> Vec<Ulid> {
        self.inboxes
            .get(&recipient)
            .map(|inbox| inbox.iter().filter(|n| !n.read).map(|n| n.id).collect())
            .unwrap_or_default()
    }

    /// Every stored notification, for journal compaction. Each inbox keeps its order.
    pub fn snapshot(&self) -> Vec<Notification> {
        self.inboxes.iter().flat_map(|e| e.value().clone()).collect()
    }
}

// ── Live delivery ────────────────────────────────────────────────

/// Broadcast hub for live notification delivery per recipient.
pub struct NotifyHub {
    channels: DashMap<Recipient, broadcast::Sender<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to new notifications for a recipient. Creates the channel if needed.
    pub fn subscribe(&self, recipient: Recipient) -> broadcast::Receiver<Notification> {
        self.channels
            .entry(recipient)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, notification: &Notification) {
        if let Some(sender) = self.channels.get(&notification.recipient) {
            let _ = sender.send(notification.clone());
        }
    }

    /// Drop channels whose subscribers have all gone away.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }
}
