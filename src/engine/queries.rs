use std::collections::BTreeSet;

use chrono::{Datelike, NaiveDate, TimeDelta};
use serde::Serialize;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::free_slots;
use super::{Engine, EngineError, Entity};

/// Monthly occupancy of one space, counting Approved reservations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageStats {
    pub space_id: Ulid,
    pub year: i32,
    pub month: u32,
    pub approved: usize,
    pub distinct_days: usize,
    pub booked_hours: f64,
}

/// Invariant check over the whole engine state. Empty lists mean healthy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub spaces: usize,
    pub reservations: usize,
    pub items: usize,
    /// Pairs of active reservations on the same space and date whose ranges intersect.
    pub overlapping: Vec<(Ulid, Ulid)>,
    /// Items where available + outstanding != total.
    pub unbalanced_items: Vec<Ulid>,
    /// Reservations whose approval history does not explain their state.
    pub unexplained_states: Vec<Ulid>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.overlapping.is_empty() && self.unbalanced_items.is_empty() && self.unexplained_states.is_empty()
    }
}

/// One event per transition taken, in order.
fn history_explains(state: ReservationState, actions: &[ApprovalAction]) -> bool {
    use ApprovalAction as A;
    match state {
        ReservationState::Pending => actions.is_empty(),
        ReservationState::Approved => actions == [A::Approved],
        ReservationState::Rejected => actions == [A::Rejected],
        ReservationState::Cancelled => actions == [A::Cancelled] || actions == [A::Approved, A::Cancelled],
    }
}

fn clamp_limit(limit: usize) -> usize {
    limit.clamp(1, MAX_LIST_LIMIT)
}

impl Engine {
    // ── Spaces & reservations ────────────────────────────

    pub async fn get_space(&self, space_id: Ulid) -> Result<Space, EngineError> {
        let calendar = self.calendar(space_id)?;
        let cal = calendar.read().await;
        Ok(cal.space.clone())
    }

    /// Every space, ordered by id.
    pub async fn spaces(&self) -> Vec<Space> {
        let handles: Vec<_> = self.calendars.iter().map(|e| e.value().clone()).collect();
        let mut spaces = Vec::with_capacity(handles.len());
        for cal in handles {
            spaces.push(cal.read().await.space.clone());
        }
        spaces.sort_by_key(|s| s.id);
        spaces
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let (space_id, _) = self.locate(id)?;
        let calendar = self.calendar(space_id)?;
        let cal = calendar.read().await;
        let (_, date) = self.locate(id)?;
        cal.reservation(date, id)
            .cloned()
            .ok_or(EngineError::not_found(Entity::Reservation, id))
    }

    pub(super) async fn reservation_with_space(&self, id: Ulid) -> Option<(Reservation, String)> {
        let (space_id, _) = self.locate(id).ok()?;
        let calendar = self.calendar(space_id).ok()?;
        let cal = calendar.read().await;
        let (_, date) = self.locate(id).ok()?;
        let reservation = cal.reservation(date, id)?.clone();
        Some((reservation, cal.space.name.clone()))
    }

    /// All reservations of a space on a date, any state, by start time.
    pub async fn reservations_for_space(&self, space_id: Ulid, date: NaiveDate) -> Result<Vec<Reservation>, EngineError> {
        let calendar = self.calendar(space_id)?;
        let cal = calendar.read().await;
        Ok(cal.on_date(date).to_vec())
    }

    /// A requester's reservations, any state, by date then start time.
    pub async fn reservations_for_requester(&self, requester_id: Ulid) -> Vec<Reservation> {
        let ids = self
            .requester_index
            .get(&requester_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(r) = self.get_reservation(id).await {
                out.push(r);
            }
        }
        out.sort_by_key(|r| (r.date, r.range.start));
        out
    }

    /// Transitions of a reservation, oldest first.
    pub fn approval_history(&self, reservation_id: Ulid) -> Result<Vec<ApprovalEvent>, EngineError> {
        self.locate(reservation_id)?;
        Ok(self
            .approvals
            .get(&reservation_id)
            .map(|e| e.value().clone())
            .unwrap_or_default())
    }

    pub async fn free_slots(
        &self,
        space_id: Ulid,
        date: NaiveDate,
        min_duration: Option<TimeDelta>,
    ) -> Result<Vec<TimeRange>, EngineError> {
        let calendar = self.calendar(space_id)?;
        let cal = calendar.read().await;
        Ok(free_slots(&cal, date, min_duration))
    }

    pub async fn usage_stats(&self, space_id: Ulid, year: i32, month: u32) -> Result<UsageStats, EngineError> {
        let first = NaiveDate::from_ymd_opt(year, month, 1)
            .ok_or_else(|| EngineError::Validation(format!("invalid month {year}-{month:02}")))?;
        let calendar = self.calendar(space_id)?;
        let cal = calendar.read().await;

        let mut days = BTreeSet::new();
        let mut approved = 0;
        let mut minutes = 0i64;
        for (date, bookings) in cal.bookings.range(first..) {
            if date.month() != month || date.year() != year {
                break;
            }
            for r in bookings.iter().filter(|r| r.state == ReservationState::Approved) {
                approved += 1;
                minutes += r.range.duration().num_minutes();
                days.insert(*date);
            }
        }
        Ok(UsageStats {
            space_id,
            year,
            month,
            approved,
            distinct_days: days.len(),
            booked_hours: minutes as f64 / 60.0,
        })
    }

    // ── Equipment ────────────────────────────────────────

    pub async fn get_item(&self, item_id: Ulid) -> Result<EquipmentItem, EngineError> {
        let item = self.item(item_id)?;
        let ledger = item.lock().await;
        Ok(ledger.item.clone())
    }

    pub async fn get_link(&self, link_id: Ulid) -> Result<LoanLink, EngineError> {
        let item_id = self
            .link_index
            .get(&link_id)
            .map(|e| *e.value())
            .ok_or(EngineError::not_found(Entity::Link, link_id))?;
        let item = self.item(item_id)?;
        let ledger = item.lock().await;
        ledger
            .link(link_id)
            .cloned()
            .ok_or(EngineError::not_found(Entity::Link, link_id))
    }

    pub async fn loans_for_reservation(&self, reservation_id: Ulid) -> Result<Vec<LoanLink>, EngineError> {
        self.locate(reservation_id)?;
        let link_ids = self
            .loans_by_reservation
            .get(&reservation_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut links = Vec::with_capacity(link_ids.len());
        for link_id in link_ids {
            links.push(self.get_link(link_id).await?);
        }
        Ok(links)
    }

    // ── Notifications ────────────────────────────────────

    /// Newest first.
    pub fn list_notifications(&self, user_id: Ulid, unread_only: bool, limit: usize) -> Vec<Notification> {
        self.notifications
            .list(Recipient::User(user_id), unread_only, clamp_limit(limit))
    }

    pub fn list_staff_notifications(&self, unread_only: bool, limit: usize) -> Vec<Notification> {
        self.notifications.list(Recipient::Staff, unread_only, clamp_limit(limit))
    }

    pub fn unread_count(&self, recipient: Recipient) -> usize {
        self.notifications.unread_count(recipient)
    }

    /// Marking an already-read notification is a no-op.
    pub async fn mark_read(&self, recipient: Recipient, notification_id: Ulid) -> Result<(), EngineError> {
        let _shared = self.writers.read().await;
        match self.notifications.contains(recipient, notification_id) {
            None => Err(EngineError::not_found(Entity::Notification, notification_id)),
            Some(true) => Ok(()),
            Some(false) => {
                let event = Event::NotificationRead { id: notification_id, recipient, at: self.clock.now() };
                self.persist_and_index(&event).await
            }
        }
    }

    /// Returns how many notifications changed.
    pub async fn mark_all_read(&self, recipient: Recipient) -> Result<usize, EngineError> {
        let _shared = self.writers.read().await;
        let now = self.clock.now();
        let mut marked = 0;
        for id in self.notifications.unread_ids(recipient) {
            self.persist_and_index(&Event::NotificationRead { id, recipient, at: now })
                .await?;
            marked += 1;
        }
        Ok(marked)
    }

    // ── Audit ────────────────────────────────────────────

    pub async fn audit(&self) -> AuditReport {
        let mut report = AuditReport::default();

        let calendars: Vec<_> = self.calendars.iter().map(|e| e.value().clone()).collect();
        for calendar in calendars {
            let cal = calendar.read().await;
            report.spaces += 1;
            for bookings in cal.bookings.values() {
                report.reservations += bookings.len();
                // Sorted by start: track the active booking reaching furthest right.
                let mut reach: Option<&Reservation> = None;
                for r in bookings.iter().filter(|r| r.state.is_active()) {
                    if let Some(prev) = reach {
                        if prev.range.overlaps(&r.range) {
                            report.overlapping.push((prev.id, r.id));
                        }
                        if r.range.end > prev.range.end {
                            reach = Some(r);
                        }
                    } else {
                        reach = Some(r);
                    }
                }
                for r in bookings {
                    let actions: Vec<ApprovalAction> = self
                        .approvals
                        .get(&r.id)
                        .map(|e| e.value().iter().map(|a| a.action).collect())
                        .unwrap_or_default();
                    if !history_explains(r.state, &actions) {
                        report.unexplained_states.push(r.id);
                    }
                }
            }
        }

        let items: Vec<_> = self.items.iter().map(|e| e.value().clone()).collect();
        for item in items {
            let ledger = item.lock().await;
            report.items += 1;
            if ledger.item.available_qty + ledger.outstanding_qty() != ledger.item.total_qty {
                report.unbalanced_items.push(ledger.item.id);
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ApprovalAction as A;

    #[test]
    fn history_must_match_state() {
        assert!(history_explains(ReservationState::Pending, &[]));
        assert!(history_explains(ReservationState::Approved, &[A::Approved]));
        assert!(!history_explains(ReservationState::Approved, &[A::Approved, A::Approved]));
        assert!(history_explains(ReservationState::Cancelled, &[A::Approved, A::Cancelled]));
        assert!(history_explains(ReservationState::Cancelled, &[A::Cancelled]));
        assert!(!history_explains(ReservationState::Rejected, &[]));
    }

    #[test]
    fn list_limit_is_bounded() {
        assert_eq!(clamp_limit(0), 1);
        assert_eq!(clamp_limit(20), 20);
        assert_eq!(clamp_limit(usize::MAX), MAX_LIST_LIMIT);
    }
}
