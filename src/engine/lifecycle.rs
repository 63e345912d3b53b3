use std::time::Instant;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{Change, LifecycleEvent};
use crate::observability;

use super::validator::{self, Candidate, Context};
use super::{Engine, EngineError, Entity};

/// Input of `create_reservation`.
#[derive(Debug, Clone)]
pub struct NewReservation {
    pub space_id: Ulid,
    pub requester_id: Ulid,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub purpose: String,
    pub attendee_count: u32,
}

fn check_note(note: &Option<String>) -> Result<(), EngineError> {
    if let Some(n) = note
        && n.len() > MAX_REASON_LEN
    {
        return Err(EngineError::LimitExceeded("comment too long"));
    }
    Ok(())
}

fn rejected(op: &'static str, err: EngineError) -> EngineError {
    metrics::counter!(observability::VALIDATION_REJECTIONS_TOTAL, "kind" => err.metric_label()).increment(1);
    debug!(op, error = %err, "request rejected");
    err
}

impl Engine {
    /// Validate and admit a new Pending reservation.
    ///
    /// Holds the requester's day ledger and the space calendar across
    /// validate → journal → apply, so two racing requests cannot both pass.
    pub async fn create_reservation(&self, input: NewReservation) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let _shared = self.writers.read().await;

        let purpose = input.purpose.trim();
        if purpose.is_empty() {
            return Err(rejected("create", EngineError::Validation("purpose is required".into())));
        }
        if purpose.len() > MAX_PURPOSE_LEN {
            return Err(rejected("create", EngineError::LimitExceeded("purpose too long")));
        }
        if input.attendee_count == 0 {
            return Err(rejected(
                "create",
                EngineError::Validation("at least one attendee is required".into()),
            ));
        }

        let admitted = self.admit(&input, purpose).await;
        self.release_day_ledger(input.requester_id, input.date);
        let (reservation, space_name, now) = admitted?;

        metrics::counter!(observability::RESERVATIONS_CREATED_TOTAL).increment(1);
        info!(
            reservation = %reservation.id,
            space = %reservation.space_id,
            date = %reservation.date,
            range = %reservation.range,
            "reservation created"
        );
        self.dispatch(LifecycleEvent {
            reservation: reservation.clone(),
            space_name,
            actor_id: reservation.requester_id,
            at: now,
            change: Change::Created,
        })
        .await;
        observability::record_duration("create_reservation", started);
        Ok(reservation)
    }

    /// The locked part of `create_reservation`. Both locks are gone on return.
    async fn admit(
        &self,
        input: &NewReservation,
        purpose: &str,
    ) -> Result<(Reservation, String, NaiveDateTime), EngineError> {
        let calendar = self.calendar(input.space_id)?;
        let day = self.day_ledger(input.requester_id, input.date);
        let mut day = day.lock().await;
        let mut cal = calendar.write().await;

        let now = self.clock.now();
        let candidate = Candidate {
            requester_id: input.requester_id,
            date: input.date,
            start: input.start,
            end: input.end,
            attendee_count: input.attendee_count,
            exclude: None,
        };
        let ctx = Context { policy: &self.policy, now, requester_active: &day };
        let range = validator::validate(&cal, &candidate, &ctx).map_err(|e| rejected("create", e))?;

        let reservation = Reservation {
            id: Ulid::new(),
            space_id: input.space_id,
            requester_id: input.requester_id,
            date: input.date,
            range,
            purpose: purpose.to_string(),
            attendee_count: input.attendee_count,
            state: ReservationState::Pending,
            created_at: now,
            approver_id: None,
            admin_comment: None,
        };
        let event = Event::ReservationCreated { reservation: reservation.clone() };
        self.persist_to_calendar(&mut cal, &event).await?;
        day.push(reservation.id);
        Ok((reservation, cal.space.name.clone(), now))
    }

    pub async fn approve_reservation(
        &self,
        id: Ulid,
        actor_id: Ulid,
        comment: Option<String>,
    ) -> Result<Reservation, EngineError> {
        self.transition(id, actor_id, ApprovalAction::Approved, comment).await
    }

    pub async fn reject_reservation(
        &self,
        id: Ulid,
        actor_id: Ulid,
        reason: Option<String>,
    ) -> Result<Reservation, EngineError> {
        self.transition(id, actor_id, ApprovalAction::Rejected, reason).await
    }

    /// Cancel a Pending or Approved reservation. Outstanding equipment loans
    /// are returned in the same journal record, so either both happen or neither does.
    pub async fn cancel_reservation(
        &self,
        id: Ulid,
        actor_id: Ulid,
        reason: Option<String>,
    ) -> Result<Reservation, EngineError> {
        self.transition(id, actor_id, ApprovalAction::Cancelled, reason).await
    }

    async fn transition(
        &self,
        id: Ulid,
        actor_id: Ulid,
        action: ApprovalAction,
        reason: Option<String>,
    ) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let _shared = self.writers.read().await;
        check_note(&reason).map_err(|e| rejected("transition", e))?;
        let reason = reason.filter(|r| !r.trim().is_empty());

        let (space_id, _) = self.locate(id)?;
        let calendar = self.calendar(space_id)?;
        let mut cal = calendar.write().await;
        let (_, date) = self.locate(id)?;

        let current = cal
            .reservation(date, id)
            .ok_or(EngineError::not_found(Entity::Reservation, id))?;
        let next = action.resulting_state();
        if !current.state.can_become(next) {
            return Err(rejected(
                "transition",
                EngineError::state(Entity::Reservation, current.state, next),
            ));
        }
        let requester_id = current.requester_id;

        let now = self.clock.now();
        let (mut ledgers, returned) = if action == ApprovalAction::Cancelled {
            self.lock_outstanding_loans(id).await?
        } else {
            (Vec::new(), Vec::new())
        };

        let approval = ApprovalEvent {
            id: Ulid::new(),
            reservation_id: id,
            actor_id,
            action,
            at: now,
            reason: reason.clone(),
        };
        let event = Event::ReservationTransitioned { space_id, date, approval, returned: returned.clone() };
        self.persist_to_calendar_and_items(&mut cal, &mut ledgers, &event).await?;

        let mut loans_back = Vec::with_capacity(returned.len());
        for (ledger, r) in ledgers.iter().zip(&returned) {
            let qty = ledger.link(r.link_id).map(|l| l.qty).unwrap_or(0);
            metrics::counter!(observability::LOANS_TOTAL, "op" => "return").increment(1);
            info!(link = %r.link_id, item = %r.item_id, qty, reservation = %id, "loan returned on cancellation");
            loans_back.push((r.link_id, ledger.item.name.clone(), qty));
        }
        drop(ledgers);

        let reservation = cal
            .reservation(date, id)
            .cloned()
            .ok_or(EngineError::not_found(Entity::Reservation, id))?;
        let space_name = cal.space.name.clone();
        drop(cal);

        if next.is_terminal() {
            let day = self.day_ledger(requester_id, date);
            day.lock().await.retain(|r| *r != id);
            drop(day);
            self.release_day_ledger(requester_id, date);
        }

        let label = match action {
            ApprovalAction::Approved => "approve",
            ApprovalAction::Rejected => "reject",
            ApprovalAction::Cancelled => "cancel",
        };
        metrics::counter!(observability::TRANSITIONS_TOTAL, "action" => label).increment(1);
        info!(reservation = %id, actor = %actor_id, state = %next, "reservation transitioned");

        for (link_id, item_name, qty) in loans_back {
            self.dispatch(LifecycleEvent {
                reservation: reservation.clone(),
                space_name: space_name.clone(),
                actor_id,
                at: now,
                change: Change::EquipmentReturned { link_id, item_name, qty },
            })
            .await;
        }
        let change = match action {
            ApprovalAction::Approved => Change::Approved { comment: reason },
            ApprovalAction::Rejected => Change::Rejected { reason },
            ApprovalAction::Cancelled => Change::Cancelled { reason },
        };
        self.dispatch(LifecycleEvent {
            reservation: reservation.clone(),
            space_name,
            actor_id,
            at: now,
            change,
        })
        .await;
        observability::record_duration(label, started);
        Ok(reservation)
    }

    /// Move a Pending reservation to a new slot. Only its requester may do this;
    /// the full rule set runs again with the reservation itself excluded.
    pub async fn reschedule_reservation(
        &self,
        id: Ulid,
        actor_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let _shared = self.writers.read().await;

        let (space_id, _) = self.locate(id)?;
        let calendar = self.calendar(space_id)?;
        let requester_id = {
            let cal = calendar.read().await;
            let (_, date) = self.locate(id)?;
            cal.reservation(date, id)
                .map(|r| r.requester_id)
                .ok_or(EngineError::not_found(Entity::Reservation, id))?
        };
        if requester_id != actor_id {
            return Err(rejected(
                "reschedule",
                EngineError::Forbidden("only the requester can reschedule a reservation".into()),
            ));
        }

        let moved = self.move_pending(id, requester_id, date, start, end).await;
        self.release_day_ledger(requester_id, date);
        if let Ok((_, from_date, _, _)) = &moved {
            self.release_day_ledger(requester_id, *from_date);
        }
        let (reservation, from_date, previous_range, space_name) = moved?;
        let range = reservation.range;

        metrics::counter!(observability::TRANSITIONS_TOTAL, "action" => "reschedule").increment(1);
        info!(reservation = %id, from = %from_date, to = %date, range = %range, "reservation rescheduled");
        self.dispatch(LifecycleEvent {
            reservation: reservation.clone(),
            space_name,
            actor_id,
            at: self.clock.now(),
            change: Change::Rescheduled { previous_date: from_date, previous_range },
        })
        .await;
        observability::record_duration("reschedule", started);
        Ok(reservation)
    }

    /// The locked part of `reschedule_reservation`: new-date ledger, then calendar.
    /// Returns the moved reservation, where it was, and the space name.
    async fn move_pending(
        &self,
        id: Ulid,
        requester_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Result<(Reservation, NaiveDate, TimeRange, String), EngineError> {
        let (space_id, _) = self.locate(id)?;
        let calendar = self.calendar(space_id)?;
        let day = self.day_ledger(requester_id, date);
        let mut day = day.lock().await;
        let mut cal = calendar.write().await;
        let (_, from_date) = self.locate(id)?;

        let current = cal
            .reservation(from_date, id)
            .ok_or(EngineError::not_found(Entity::Reservation, id))?;
        if current.state != ReservationState::Pending {
            return Err(rejected(
                "reschedule",
                EngineError::state(Entity::Reservation, current.state, "rescheduled"),
            ));
        }
        let previous_range = current.range;
        let attendee_count = current.attendee_count;

        let candidate = Candidate {
            requester_id,
            date,
            start,
            end,
            attendee_count,
            exclude: Some(id),
        };
        let ctx = Context { policy: &self.policy, now: self.clock.now(), requester_active: &day };
        let range = validator::validate(&cal, &candidate, &ctx).map_err(|e| rejected("reschedule", e))?;

        let event = Event::ReservationRescheduled { id, space_id, from_date, date, range };
        self.persist_to_calendar(&mut cal, &event).await?;
        if !day.contains(&id) {
            day.push(id);
        }
        let reservation = cal
            .reservation(date, id)
            .cloned()
            .ok_or(EngineError::not_found(Entity::Reservation, id))?;
        let space_name = cal.space.name.clone();
        drop(cal);
        drop(day);

        if from_date != date {
            let previous = self.day_ledger(requester_id, from_date);
            previous.lock().await.retain(|r| *r != id);
        }
        Ok((reservation, from_date, previous_range, space_name))
    }
}
