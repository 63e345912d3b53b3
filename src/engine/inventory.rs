use std::time::Instant;

use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{Change, LifecycleEvent};
use crate::observability;

use super::{Engine, EngineError, Entity};

fn unlendable(item: &EquipmentItem) -> Option<EngineError> {
    let why = match item.state {
        ItemState::Available | ItemState::OnLoan => return None,
        ItemState::Maintenance => "is under maintenance",
        ItemState::Retired => "is retired",
    };
    Some(EngineError::Conflict(format!("{} {why}", item.name)))
}

impl Engine {
    /// Lend `qty` units of an item against an Approved reservation.
    ///
    /// The calendar read lock pins the reservation's state; the item lock makes
    /// check → journal → decrement one atomic step.
    pub async fn request_loan(&self, reservation_id: Ulid, item_id: Ulid, qty: u32) -> Result<LoanLink, EngineError> {
        let started = Instant::now();
        let _shared = self.writers.read().await;

        if qty == 0 {
            return Err(EngineError::Validation("quantity must be at least 1".into()));
        }
        if qty > MAX_ITEM_QTY {
            return Err(EngineError::LimitExceeded("quantity too large"));
        }

        let (space_id, _) = self.locate(reservation_id)?;
        let calendar = self.calendar(space_id)?;
        let cal = calendar.read().await;
        let (_, date) = self.locate(reservation_id)?;
        let reservation = cal
            .reservation(date, reservation_id)
            .cloned()
            .ok_or(EngineError::not_found(Entity::Reservation, reservation_id))?;
        if reservation.state != ReservationState::Approved {
            return Err(EngineError::Conflict(format!(
                "equipment can only be loaned for an approved reservation (currently {})",
                reservation.state
            )));
        }

        let item = self.item(item_id)?;
        let mut ledger = item.lock().await;
        if let Some(err) = unlendable(&ledger.item) {
            return Err(err);
        }
        if ledger.item.available_qty < qty {
            return Err(EngineError::Conflict(format!(
                "only {} of {} available",
                ledger.item.available_qty, ledger.item.name
            )));
        }

        let now = self.clock.now();
        let link = match ledger.link_for_reservation(reservation_id) {
            Some(existing) if existing.is_outstanding() => LoanLink {
                qty: existing.qty + qty,
                ..existing.clone()
            },
            Some(existing) => LoanLink {
                qty,
                loaned: true,
                returned: false,
                loaned_at: Some(now),
                returned_at: None,
                ..existing.clone()
            },
            None => {
                if ledger.links.len() >= MAX_LINKS_PER_ITEM {
                    return Err(EngineError::LimitExceeded("too many loans on item"));
                }
                LoanLink {
                    id: Ulid::new(),
                    reservation_id,
                    item_id,
                    qty,
                    loaned: true,
                    returned: false,
                    loaned_at: Some(now),
                    returned_at: None,
                }
            }
        };

        let event = Event::LoanRecorded { link: link.clone(), qty };
        self.persist_to_item(&mut ledger, &event).await?;
        let item_name = ledger.item.name.clone();
        let remaining = ledger.item.available_qty;
        drop(ledger);
        let space_name = cal.space.name.clone();
        drop(cal);

        metrics::counter!(observability::LOANS_TOTAL, "op" => "loan").increment(1);
        info!(link = %link.id, item = %item_id, qty, remaining, "equipment loaned");
        self.dispatch(LifecycleEvent {
            reservation: reservation.clone(),
            space_name,
            actor_id: reservation.approver_id.unwrap_or(reservation.requester_id),
            at: now,
            change: Change::EquipmentLoaned { link_id: link.id, item_name, qty },
        })
        .await;
        observability::record_duration("request_loan", started);
        Ok(link)
    }

    /// Return every unit still out on `link_id`.
    pub async fn return_loan(&self, link_id: Ulid) -> Result<LoanLink, EngineError> {
        let started = Instant::now();
        let _shared = self.writers.read().await;

        let item_id = self
            .link_index
            .get(&link_id)
            .map(|e| *e.value())
            .ok_or(EngineError::not_found(Entity::Link, link_id))?;
        let item = self.item(item_id)?;
        let mut ledger = item.lock().await;
        let link = ledger
            .link(link_id)
            .ok_or(EngineError::not_found(Entity::Link, link_id))?;
        if !link.is_outstanding() {
            let current = if link.returned { "returned" } else { "not loaned" };
            return Err(EngineError::state(Entity::Link, current, "returned"));
        }

        let now = self.clock.now();
        let event = Event::LoanReturned { link_id, item_id, at: now };
        self.persist_to_item(&mut ledger, &event).await?;
        let link = ledger
            .link(link_id)
            .cloned()
            .ok_or(EngineError::not_found(Entity::Link, link_id))?;
        let item_name = ledger.item.name.clone();
        let available = ledger.item.available_qty;
        drop(ledger);

        metrics::counter!(observability::LOANS_TOTAL, "op" => "return").increment(1);
        info!(link = %link_id, item = %item_id, qty = link.qty, available, "equipment returned");

        match self.reservation_with_space(link.reservation_id).await {
            Some((reservation, space_name)) => {
                self.dispatch(LifecycleEvent {
                    actor_id: reservation.approver_id.unwrap_or(reservation.requester_id),
                    reservation,
                    space_name,
                    at: now,
                    change: Change::EquipmentReturned { link_id, item_name, qty: link.qty },
                })
                .await;
            }
            None => warn!(link = %link_id, "returned loan has no reservation to notify"),
        }
        observability::record_duration("return_loan", started);
        Ok(link)
    }

    /// Lock the ledger of every item still out on a reservation, in item-id order.
    /// The caller holds the reservation's calendar write lock, so no new loan can slip in.
    /// Links are unique per (reservation, item), so each ledger is locked once.
    pub(super) async fn lock_outstanding_loans(
        &self,
        reservation_id: Ulid,
    ) -> Result<(Vec<OwnedMutexGuard<ItemLedger>>, Vec<LinkReturn>), EngineError> {
        let mut targets: Vec<LinkReturn> = self
            .loans_by_reservation
            .get(&reservation_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
            .into_iter()
            .filter_map(|link_id| {
                let item_id = *self.link_index.get(&link_id)?.value();
                Some(LinkReturn { link_id, item_id })
            })
            .collect();
        targets.sort_by_key(|t| t.item_id);

        let mut ledgers = Vec::new();
        let mut returned = Vec::new();
        for target in targets {
            let ledger = self.item(target.item_id)?.lock_owned().await;
            if ledger.link(target.link_id).is_some_and(LoanLink::is_outstanding) {
                ledgers.push(ledger);
                returned.push(target);
            }
        }
        Ok((ledgers, returned))
    }
}
