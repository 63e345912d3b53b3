use std::collections::BTreeMap;
use std::fmt;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Weekday};
use serde::{Deserialize, Serialize};
use tracing::warn;
use ulid::Ulid;

/// Half-open time-of-day interval `[start, end)` on a single date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeRange {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        debug_assert!(start < end, "TimeRange start must be before end");
        Self { start, end }
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    /// Strict overlap: ranges that only touch at a boundary do not overlap.
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_range(&self, other: &TimeRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}–{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

// ── Spaces ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpaceKind {
    MeetingRoom,
    Auditorium,
    Laboratory,
    Office,
    Classroom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpaceState {
    Available,
    Maintenance,
    OutOfService,
}

impl fmt::Display for SpaceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SpaceState::Available => "available",
            SpaceState::Maintenance => "under maintenance",
            SpaceState::OutOfService => "out of service",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Space {
    pub id: Ulid,
    pub name: String,
    pub kind: SpaceKind,
    pub building: Option<String>,
    pub floor: Option<String>,
    pub capacity: u32,
    pub state: SpaceState,
}

/// Opening hours of a space on one weekday, effective from a date onwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatingWindow {
    pub id: Ulid,
    pub space_id: Ulid,
    pub weekday: Weekday,
    pub open: NaiveTime,
    pub close: NaiveTime,
    pub effective_from: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaintenanceKind {
    Preventive,
    Corrective,
    Urgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaintenanceState {
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
}

impl MaintenanceState {
    pub fn is_blocking(self) -> bool {
        matches!(self, MaintenanceState::Scheduled | MaintenanceState::InProgress)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceBlock {
    pub id: Ulid,
    pub space_id: Ulid,
    pub kind: MaintenanceKind,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub state: MaintenanceState,
    pub description: Option<String>,
}

impl MaintenanceBlock {
    /// Inclusive on both ends.
    pub fn covers(&self, date: NaiveDate) -> bool {
        self.start_date <= date && date <= self.end_date
    }
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationState {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

impl ReservationState {
    /// Active bookings hold their slot and count towards the daily quota.
    pub fn is_active(self) -> bool {
        matches!(self, ReservationState::Pending | ReservationState::Approved)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ReservationState::Rejected | ReservationState::Cancelled)
    }

    /// Allowed moves: Pending → {Approved, Rejected, Cancelled}, Approved → Cancelled.
    pub fn can_become(self, next: ReservationState) -> bool {
        use ReservationState::*;
        matches!(
            (self, next),
            (Pending, Approved) | (Pending, Rejected) | (Pending, Cancelled) | (Approved, Cancelled)
        )
    }
}

impl fmt::Display for ReservationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReservationState::Pending => "Pending",
            ReservationState::Approved => "Approved",
            ReservationState::Rejected => "Rejected",
            ReservationState::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub space_id: Ulid,
    pub requester_id: Ulid,
    pub date: NaiveDate,
    pub range: TimeRange,
    pub purpose: String,
    pub attendee_count: u32,
    pub state: ReservationState,
    pub created_at: NaiveDateTime,
    pub approver_id: Option<Ulid>,
    pub admin_comment: Option<String>,
}

impl Reservation {
    pub fn starts_at(&self) -> NaiveDateTime {
        self.date.and_time(self.range.start)
    }

    /// Apply a recorded transition. The caller has already checked `can_become`.
    pub fn apply_transition(&mut self, approval: &ApprovalEvent) {
        self.state = approval.action.resulting_state();
        match approval.action {
            ApprovalAction::Approved => {
                self.approver_id = Some(approval.actor_id);
                self.admin_comment = approval.reason.clone();
            }
            ApprovalAction::Rejected => {
                self.admin_comment = approval.reason.clone();
            }
            ApprovalAction::Cancelled => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApprovalAction {
    Approved,
    Rejected,
    Cancelled,
}

impl ApprovalAction {
    pub fn resulting_state(self) -> ReservationState {
        match self {
            ApprovalAction::Approved => ReservationState::Approved,
            ApprovalAction::Rejected => ReservationState::Rejected,
            ApprovalAction::Cancelled => ReservationState::Cancelled,
        }
    }
}

/// Immutable audit record of one lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalEvent {
    pub id: Ulid,
    pub reservation_id: Ulid,
    pub actor_id: Ulid,
    pub action: ApprovalAction,
    pub at: NaiveDateTime,
    pub reason: Option<String>,
}

// ── Notifications ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationKind {
    ReservationCreated,
    ReservationApproved,
    ReservationRejected,
    ReservationCancelled,
    ReservationRescheduled,
    EquipmentLoaned,
    EquipmentReturned,
}

/// A user's inbox, or the shared staff audit feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Recipient {
    User(Ulid),
    Staff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Ulid,
    pub recipient: Recipient,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub priority: Priority,
    pub read: bool,
    pub read_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub reservation_id: Option<Ulid>,
    /// The loan link an equipment notification is about.
    pub link_id: Option<Ulid>,
    /// Set when a staff member acted on someone else's reservation.
    pub staff_initiated: bool,
}

// ── Equipment ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemCategory {
    Audio,
    Video,
    Computing,
    Electronics,
    Furniture,
    Networking,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemState {
    Available,
    OnLoan,
    Maintenance,
    Retired,
}

impl ItemState {
    pub fn is_lendable(self) -> bool {
        matches!(self, ItemState::Available | ItemState::OnLoan)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquipmentItem {
    pub id: Ulid,
    pub name: String,
    pub category: ItemCategory,
    pub total_qty: u32,
    pub available_qty: u32,
    pub state: ItemState,
}

impl EquipmentItem {
    /// Take `qty` units out. The caller has checked `available_qty >= qty`;
    /// a journal that says otherwise is clamped at zero.
    pub fn lend(&mut self, qty: u32) {
        if qty > self.available_qty {
            warn!(item = %self.id, qty, available = self.available_qty, "loan exceeds available stock");
        }
        self.available_qty = self.available_qty.saturating_sub(qty);
        if self.available_qty == 0 {
            self.state = ItemState::OnLoan;
        }
    }

    /// Put `qty` units back, never exceeding `total_qty`.
    pub fn restock(&mut self, qty: u32) {
        self.available_qty = (self.available_qty + qty).min(self.total_qty);
        if self.available_qty > 0 && self.state == ItemState::OnLoan {
            self.state = ItemState::Available;
        }
    }
}

/// Checkout record of one item for one reservation. Unique per (reservation, item).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanLink {
    pub id: Ulid,
    pub reservation_id: Ulid,
    pub item_id: Ulid,
    pub qty: u32,
    pub loaned: bool,
    pub returned: bool,
    pub loaned_at: Option<NaiveDateTime>,
    pub returned_at: Option<NaiveDateTime>,
}

impl LoanLink {
    pub fn is_outstanding(&self) -> bool {
        self.loaned && !self.returned
    }
}

// ── In-memory aggregates ─────────────────────────────────────────

/// Everything the validator needs about one space, guarded by a single lock.
#[derive(Debug, Clone)]
pub struct SpaceCalendar {
    pub space: Space,
    pub windows: Vec<OperatingWindow>,
    pub blocks: Vec<MaintenanceBlock>,
    /// Reservations per date (any state), sorted by `range.start`.
    pub bookings: BTreeMap<NaiveDate, Vec<Reservation>>,
}

impl SpaceCalendar {
    pub fn new(space: Space) -> Self {
        Self {
            space,
            windows: Vec::new(),
            blocks: Vec::new(),
            bookings: BTreeMap::new(),
        }
    }

    /// Insert reservation maintaining sort order by start time.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let day = self.bookings.entry(reservation.date).or_default();
        let pos = day
            .binary_search_by_key(&reservation.range.start, |r| r.range.start)
            .unwrap_or_else(|e| e);
        day.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, date: NaiveDate, id: Ulid) -> Option<Reservation> {
        let day = self.bookings.get_mut(&date)?;
        let pos = day.iter().position(|r| r.id == id)?;
        let removed = day.remove(pos);
        if day.is_empty() {
            self.bookings.remove(&date);
        }
        Some(removed)
    }

    pub fn reservation(&self, date: NaiveDate, id: Ulid) -> Option<&Reservation> {
        self.bookings.get(&date)?.iter().find(|r| r.id == id)
    }

    pub fn reservation_mut(&mut self, date: NaiveDate, id: Ulid) -> Option<&mut Reservation> {
        self.bookings.get_mut(&date)?.iter_mut().find(|r| r.id == id)
    }

    pub fn on_date(&self, date: NaiveDate) -> &[Reservation] {
        self.bookings.get(&date).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Active reservations on `date` whose range strictly overlaps `query`.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, date: NaiveDate, query: TimeRange) -> impl Iterator<Item = &Reservation> {
        let day = self.on_date(date);
        let right_bound = day.partition_point(|r| r.range.start < query.end);
        day[..right_bound]
            .iter()
            .filter(move |r| r.state.is_active() && r.range.end > query.start)
    }

    /// The window for `date`'s weekday with the latest `effective_from <= date`.
    pub fn window_for(&self, date: NaiveDate) -> Option<&OperatingWindow> {
        self.windows
            .iter()
            .filter(|w| w.weekday == date.weekday() && w.effective_from <= date)
            .max_by_key(|w| w.effective_from)
    }

    /// First Scheduled or InProgress block covering `date`.
    pub fn blackout_on(&self, date: NaiveDate) -> Option<&MaintenanceBlock> {
        self.blocks
            .iter()
            .find(|b| b.state.is_blocking() && b.covers(date))
    }
}

/// An equipment item together with every loan link that references it.
#[derive(Debug, Clone)]
pub struct ItemLedger {
    pub item: EquipmentItem,
    pub links: Vec<LoanLink>,
}

impl ItemLedger {
    pub fn new(item: EquipmentItem) -> Self {
        Self { item, links: Vec::new() }
    }

    pub fn link(&self, id: Ulid) -> Option<&LoanLink> {
        self.links.iter().find(|l| l.id == id)
    }

    pub fn link_for_reservation(&self, reservation_id: Ulid) -> Option<&LoanLink> {
        self.links.iter().find(|l| l.reservation_id == reservation_id)
    }

    pub fn outstanding_qty(&self) -> u32 {
        self.links
            .iter()
            .filter(|l| l.is_outstanding())
            .map(|l| l.qty)
            .sum()
    }

    /// Upsert a link after `qty` more units were lent through it.
    pub fn record_loan(&mut self, link: LoanLink, qty: u32) {
        self.item.lend(qty);
        match self.links.iter_mut().find(|l| l.id == link.id) {
            Some(existing) => *existing = link,
            None => self.links.push(link),
        }
    }

    /// Put a link back as-is, leaving item counts alone. Used when loading a snapshot.
    pub fn restore_link(&mut self, link: LoanLink) {
        match self.links.iter_mut().find(|l| l.id == link.id) {
            Some(existing) => *existing = link,
            None => self.links.push(link),
        }
    }

    /// Apply the returns of a cancellation that belong to this item.
    pub fn record_returns(&mut self, returned: &[LinkReturn], at: NaiveDateTime) {
        let item_id = self.item.id;
        for r in returned.iter().filter(|r| r.item_id == item_id) {
            self.record_return(r.link_id, at);
        }
    }

    pub fn record_return(&mut self, link_id: Ulid, at: NaiveDateTime) -> Option<&LoanLink> {
        let pos = self.links.iter().position(|l| l.id == link_id)?;
        let qty = self.links[pos].qty;
        self.links[pos].returned = true;
        self.links[pos].returned_at = Some(at);
        self.item.restock(qty);
        Some(&self.links[pos])
    }
}

/// A loan link closed by a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkReturn {
    pub link_id: Ulid,
    pub item_id: Ulid,
}

/// Journal record. Flat, no nesting beyond value records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SpaceCreated {
        space: Space,
    },
    SpaceUpdated {
        id: Ulid,
        capacity: u32,
        state: SpaceState,
    },
    WindowAdded {
        window: OperatingWindow,
    },
    WindowRemoved {
        id: Ulid,
        space_id: Ulid,
    },
    MaintenanceScheduled {
        block: MaintenanceBlock,
    },
    MaintenanceStateChanged {
        id: Ulid,
        space_id: Ulid,
        state: MaintenanceState,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationRescheduled {
        id: Ulid,
        space_id: Ulid,
        from_date: NaiveDate,
        date: NaiveDate,
        range: TimeRange,
    },
    /// A cancellation carries the loans it closed, so both commit together.
    ReservationTransitioned {
        space_id: Ulid,
        date: NaiveDate,
        approval: ApprovalEvent,
        returned: Vec<LinkReturn>,
    },
    ItemAdded {
        item: EquipmentItem,
    },
    ItemStateChanged {
        id: Ulid,
        state: ItemState,
    },
    LoanRecorded {
        link: LoanLink,
        qty: u32,
    },
    LoanReturned {
        link_id: Ulid,
        item_id: Ulid,
        at: NaiveDateTime,
    },
    /// Snapshot form of a link: no effect on item counts.
    LinkRestored {
        link: LoanLink,
    },
    NotificationCreated {
        notification: Notification,
    },
    NotificationRead {
        id: Ulid,
        recipient: Recipient,
        at: NaiveDateTime,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn space() -> Space {
        Space {
            id: Ulid::new(),
            name: "Lab-1".into(),
            kind: SpaceKind::Laboratory,
            building: None,
            floor: None,
            capacity: 10,
            state: SpaceState::Available,
        }
    }

    fn reservation(space_id: Ulid, date: NaiveDate, start: NaiveTime, end: NaiveTime) -> Reservation {
        Reservation {
            id: Ulid::new(),
            space_id,
            requester_id: Ulid::new(),
            date,
            range: TimeRange::new(start, end),
            purpose: "seminar".into(),
            attendee_count: 4,
            state: ReservationState::Pending,
            created_at: date.and_time(t(0, 0)),
            approver_id: None,
            admin_comment: None,
        }
    }

    #[test]
    fn range_overlap_is_half_open() {
        let a = TimeRange::new(t(9, 0), t(10, 0));
        let b = TimeRange::new(t(9, 30), t(10, 30));
        let c = TimeRange::new(t(10, 0), t(11, 0));
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // back-to-back
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn range_display_and_duration() {
        let r = TimeRange::new(t(9, 0), t(10, 30));
        assert_eq!(r.to_string(), "09:00–10:30");
        assert_eq!(r.duration(), TimeDelta::minutes(90));
    }

    #[test]
    fn state_transitions() {
        use ReservationState::*;
        assert!(Pending.can_become(Approved));
        assert!(Pending.can_become(Cancelled));
        assert!(Approved.can_become(Cancelled));
        assert!(!Approved.can_become(Rejected));
        assert!(!Rejected.can_become(Cancelled));
        assert!(!Cancelled.can_become(Cancelled));
        assert!(!Approved.can_become(Approved));
    }

    #[test]
    fn calendar_keeps_bookings_sorted() {
        let mut cal = SpaceCalendar::new(space());
        let day = d(2025, 5, 1);
        let sid = cal.space.id;
        cal.insert_reservation(reservation(sid, day, t(14, 0), t(15, 0)));
        cal.insert_reservation(reservation(sid, day, t(9, 0), t(10, 0)));
        cal.insert_reservation(reservation(sid, day, t(11, 0), t(12, 0)));
        let starts: Vec<_> = cal.on_date(day).iter().map(|r| r.range.start).collect();
        assert_eq!(starts, vec![t(9, 0), t(11, 0), t(14, 0)]);
    }

    #[test]
    fn overlapping_skips_inactive_and_adjacent() {
        let mut cal = SpaceCalendar::new(space());
        let day = d(2025, 5, 1);
        let sid = cal.space.id;
        let mut rejected = reservation(sid, day, t(9, 0), t(10, 0));
        rejected.state = ReservationState::Rejected;
        cal.insert_reservation(rejected);
        cal.insert_reservation(reservation(sid, day, t(8, 0), t(9, 0)));
        let live = reservation(sid, day, t(9, 30), t(11, 0));
        let live_id = live.id;
        cal.insert_reservation(live);

        let hits: Vec<_> = cal
            .overlapping(day, TimeRange::new(t(9, 0), t(10, 0)))
            .map(|r| r.id)
            .collect();
        assert_eq!(hits, vec![live_id]);
    }

    #[test]
    fn overlapping_other_date_is_empty() {
        let mut cal = SpaceCalendar::new(space());
        let sid = cal.space.id;
        cal.insert_reservation(reservation(sid, d(2025, 5, 1), t(9, 0), t(10, 0)));
        let hits: Vec<_> = cal
            .overlapping(d(2025, 5, 2), TimeRange::new(t(9, 0), t(10, 0)))
            .collect();
        assert!(hits.is_empty());
    }

    #[test]
    fn remove_reservation_drops_empty_day() {
        let mut cal = SpaceCalendar::new(space());
        let day = d(2025, 5, 1);
        let r = reservation(cal.space.id, day, t(9, 0), t(10, 0));
        let id = r.id;
        cal.insert_reservation(r);
        assert!(cal.remove_reservation(day, id).is_some());
        assert!(cal.bookings.is_empty());
        assert!(cal.remove_reservation(day, id).is_none());
    }

    #[test]
    fn latest_effective_window_wins() {
        let mut cal = SpaceCalendar::new(space());
        let sid = cal.space.id;
        // 2025-05-05 is a Monday
        let monday = d(2025, 5, 5);
        for (from, open) in [(d(2025, 1, 1), 8), (d(2025, 4, 1), 10), (d(2025, 6, 1), 12)] {
            cal.windows.push(OperatingWindow {
                id: Ulid::new(),
                space_id: sid,
                weekday: Weekday::Mon,
                open: t(open, 0),
                close: t(18, 0),
                effective_from: from,
            });
        }
        let w = cal.window_for(monday).unwrap();
        assert_eq!(w.open, t(10, 0));
        assert!(cal.window_for(d(2025, 5, 6)).is_none()); // Tuesday
    }

    #[test]
    fn only_active_blocks_black_out() {
        let mut cal = SpaceCalendar::new(space());
        let sid = cal.space.id;
        let mut block = MaintenanceBlock {
            id: Ulid::new(),
            space_id: sid,
            kind: MaintenanceKind::Preventive,
            start_date: d(2025, 5, 1),
            end_date: d(2025, 5, 3),
            state: MaintenanceState::Completed,
            description: None,
        };
        cal.blocks.push(block.clone());
        assert!(cal.blackout_on(d(2025, 5, 2)).is_none());
        block.state = MaintenanceState::InProgress;
        cal.blocks.push(block);
        assert!(cal.blackout_on(d(2025, 5, 1)).is_some());
        assert!(cal.blackout_on(d(2025, 5, 3)).is_some());
        assert!(cal.blackout_on(d(2025, 5, 4)).is_none());
    }

    #[test]
    fn item_lend_and_restock() {
        let mut item = EquipmentItem {
            id: Ulid::new(),
            name: "Projector".into(),
            category: ItemCategory::Video,
            total_qty: 5,
            available_qty: 5,
            state: ItemState::Available,
        };
        item.lend(3);
        assert_eq!(item.available_qty, 2);
        assert_eq!(item.state, ItemState::Available);
        item.lend(2);
        assert_eq!(item.state, ItemState::OnLoan);
        item.restock(10);
        assert_eq!(item.available_qty, 5); // capped
        assert_eq!(item.state, ItemState::Available);
    }

    #[test]
    fn lend_beyond_stock_clamps_at_zero() {
        let mut item = EquipmentItem {
            id: Ulid::new(),
            name: "Tripod".into(),
            category: ItemCategory::Video,
            total_qty: 3,
            available_qty: 1,
            state: ItemState::Available,
        };
        item.lend(4);
        assert_eq!(item.available_qty, 0);
        assert_eq!(item.state, ItemState::OnLoan);
    }

    #[test]
    fn cancellation_closes_only_this_items_link() {
        let mut ledger = ItemLedger::new(EquipmentItem {
            id: Ulid::new(),
            name: "Laptop".into(),
            category: ItemCategory::Computing,
            total_qty: 4,
            available_qty: 4,
            state: ItemState::Available,
        });
        let link = LoanLink {
            id: Ulid::new(),
            reservation_id: Ulid::new(),
            item_id: ledger.item.id,
            qty: 2,
            loaned: true,
            returned: false,
            loaned_at: None,
            returned_at: None,
        };
        ledger.record_loan(link.clone(), 2);
        let at = d(2025, 5, 1).and_time(t(9, 0));
        ledger.record_returns(
            &[
                LinkReturn { link_id: Ulid::new(), item_id: Ulid::new() },
                LinkReturn { link_id: link.id, item_id: ledger.item.id },
            ],
            at,
        );
        assert_eq!(ledger.item.available_qty, 4);
        assert_eq!(ledger.link(link.id).unwrap().returned_at, Some(at));
    }

    #[test]
    fn restock_does_not_revive_retired_item() {
        let mut item = EquipmentItem {
            id: Ulid::new(),
            name: "Mic".into(),
            category: ItemCategory::Audio,
            total_qty: 2,
            available_qty: 0,
            state: ItemState::Retired,
        };
        item.restock(2);
        assert_eq!(item.available_qty, 2);
        assert_eq!(item.state, ItemState::Retired);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::SpaceCreated { space: space() };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
