//! Capability gate in front of the engine. The engine itself never looks at roles.

use std::fmt;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use tracing::warn;
use ulid::Ulid;

use crate::engine::{Engine, EngineError, NewItem, NewMaintenance, NewReservation, NewSpace, NewWindow};
use crate::model::*;
use crate::observability;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Requester,
    Approver,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    RequestReservation,
    ReviewReservation,
    CancelAnyReservation,
    ManageEquipment,
    ManageCatalog,
    ReadStaffFeed,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Capability::RequestReservation => "request reservations",
            Capability::ReviewReservation => "review reservations",
            Capability::CancelAnyReservation => "cancel other people's reservations",
            Capability::ManageEquipment => "manage equipment",
            Capability::ManageCatalog => "manage spaces",
            Capability::ReadStaffFeed => "read the staff feed",
        };
        f.write_str(s)
    }
}

impl Role {
    pub fn grants(self, capability: Capability) -> bool {
        match self {
            Role::Admin => true,
            Role::Approver => capability != Capability::ManageCatalog,
            Role::Requester => capability == Capability::RequestReservation,
        }
    }
}

/// Authenticated caller, as vouched for by the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: Ulid,
    pub role: Role,
}

/// What a reservation operation hands back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Receipt {
    pub id: Ulid,
    pub state: ReservationState,
}

impl From<&Reservation> for Receipt {
    fn from(r: &Reservation) -> Self {
        Self { id: r.id, state: r.state }
    }
}

pub struct Gate {
    engine: Arc<Engine>,
}

impl Gate {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    fn require(&self, actor: Actor, capability: Capability) -> Result<(), EngineError> {
        if actor.role.grants(capability) {
            return Ok(());
        }
        metrics::counter!(observability::VALIDATION_REJECTIONS_TOTAL, "kind" => "forbidden").increment(1);
        warn!(actor = %actor.id, role = ?actor.role, %capability, "capability denied");
        Err(EngineError::Forbidden(format!("{:?} may not {capability}", actor.role)))
    }

    /// Owners pass; everyone else needs `capability`.
    async fn require_owner_or(&self, actor: Actor, reservation_id: Ulid, capability: Capability) -> Result<(), EngineError> {
        let reservation = self.engine.get_reservation(reservation_id).await?;
        if reservation.requester_id == actor.id {
            return Ok(());
        }
        self.require(actor, capability)
    }

    // ── Reservations ─────────────────────────────────────

    /// The actor books for themselves.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_reservation(
        &self,
        actor: Actor,
        space_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        purpose: String,
        attendee_count: u32,
    ) -> Result<Receipt, EngineError> {
        self.require(actor, Capability::RequestReservation)?;
        let r = self
            .engine
            .create_reservation(NewReservation {
                space_id,
                requester_id: actor.id,
                date,
                start,
                end,
                purpose,
                attendee_count,
            })
            .await?;
        Ok(Receipt::from(&r))
    }

    pub async fn approve_reservation(&self, actor: Actor, id: Ulid, comment: Option<String>) -> Result<Receipt, EngineError> {
        self.require(actor, Capability::ReviewReservation)?;
        let r = self.engine.approve_reservation(id, actor.id, comment).await?;
        Ok(Receipt::from(&r))
    }

    pub async fn reject_reservation(&self, actor: Actor, id: Ulid, reason: Option<String>) -> Result<Receipt, EngineError> {
        self.require(actor, Capability::ReviewReservation)?;
        let r = self.engine.reject_reservation(id, actor.id, reason).await?;
        Ok(Receipt::from(&r))
    }

    pub async fn cancel_reservation(&self, actor: Actor, id: Ulid, reason: Option<String>) -> Result<Receipt, EngineError> {
        self.require_owner_or(actor, id, Capability::CancelAnyReservation).await?;
        let r = self.engine.cancel_reservation(id, actor.id, reason).await?;
        Ok(Receipt::from(&r))
    }

    pub async fn reschedule_reservation(
        &self,
        actor: Actor,
        id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Result<Receipt, EngineError> {
        self.require(actor, Capability::RequestReservation)?;
        let r = self.engine.reschedule_reservation(id, actor.id, date, start, end).await?;
        Ok(Receipt::from(&r))
    }

    pub async fn get_reservation(&self, actor: Actor, id: Ulid) -> Result<Reservation, EngineError> {
        self.require_owner_or(actor, id, Capability::ReviewReservation).await?;
        self.engine.get_reservation(id).await
    }

    pub async fn my_reservations(&self, actor: Actor) -> Vec<Reservation> {
        self.engine.reservations_for_requester(actor.id).await
    }

    // ── Equipment ────────────────────────────────────────

    pub async fn request_equipment_loan(
        &self,
        actor: Actor,
        reservation_id: Ulid,
        item_id: Ulid,
        qty: u32,
    ) -> Result<LoanLink, EngineError> {
        self.require(actor, Capability::ManageEquipment)?;
        self.engine.request_loan(reservation_id, item_id, qty).await
    }

    pub async fn return_equipment_loan(&self, actor: Actor, link_id: Ulid) -> Result<LoanLink, EngineError> {
        self.require(actor, Capability::ManageEquipment)?;
        self.engine.return_loan(link_id).await
    }

    pub async fn add_equipment_item(&self, actor: Actor, input: NewItem) -> Result<EquipmentItem, EngineError> {
        self.require(actor, Capability::ManageEquipment)?;
        self.engine.add_equipment_item(input).await
    }

    pub async fn set_item_state(&self, actor: Actor, item_id: Ulid, state: ItemState) -> Result<EquipmentItem, EngineError> {
        self.require(actor, Capability::ManageEquipment)?;
        self.engine.set_item_state(item_id, state).await
    }

    // ── Catalog ──────────────────────────────────────────

    pub async fn create_space(&self, actor: Actor, input: NewSpace) -> Result<Space, EngineError> {
        self.require(actor, Capability::ManageCatalog)?;
        self.engine.create_space(input).await
    }

    pub async fn set_space_state(&self, actor: Actor, space_id: Ulid, state: SpaceState) -> Result<Space, EngineError> {
        self.require(actor, Capability::ManageCatalog)?;
        self.engine.set_space_state(space_id, state).await
    }

    pub async fn set_space_capacity(&self, actor: Actor, space_id: Ulid, capacity: u32) -> Result<Space, EngineError> {
        self.require(actor, Capability::ManageCatalog)?;
        self.engine.set_space_capacity(space_id, capacity).await
    }

    pub async fn add_operating_window(&self, actor: Actor, input: NewWindow) -> Result<OperatingWindow, EngineError> {
        self.require(actor, Capability::ManageCatalog)?;
        self.engine.add_operating_window(input).await
    }

    pub async fn remove_operating_window(&self, actor: Actor, window_id: Ulid) -> Result<(), EngineError> {
        self.require(actor, Capability::ManageCatalog)?;
        self.engine.remove_operating_window(window_id).await
    }

    pub async fn schedule_maintenance(&self, actor: Actor, input: NewMaintenance) -> Result<MaintenanceBlock, EngineError> {
        self.require(actor, Capability::ManageCatalog)?;
        self.engine.schedule_maintenance(input).await
    }

    pub async fn set_maintenance_state(
        &self,
        actor: Actor,
        block_id: Ulid,
        state: MaintenanceState,
    ) -> Result<MaintenanceBlock, EngineError> {
        self.require(actor, Capability::ManageCatalog)?;
        self.engine.set_maintenance_state(block_id, state).await
    }

    // ── Notifications ────────────────────────────────────

    pub fn list_notifications(&self, actor: Actor, unread_only: bool, limit: usize) -> Vec<Notification> {
        self.engine.list_notifications(actor.id, unread_only, limit)
    }

    pub fn list_staff_notifications(&self, actor: Actor, unread_only: bool, limit: usize) -> Result<Vec<Notification>, EngineError> {
        self.require(actor, Capability::ReadStaffFeed)?;
        Ok(self.engine.list_staff_notifications(unread_only, limit))
    }

    pub async fn mark_read(&self, actor: Actor, notification_id: Ulid) -> Result<(), EngineError> {
        self.engine.mark_read(Recipient::User(actor.id), notification_id).await
    }

    pub async fn mark_staff_read(&self, actor: Actor, notification_id: Ulid) -> Result<(), EngineError> {
        self.require(actor, Capability::ReadStaffFeed)?;
        self.engine.mark_read(Recipient::Staff, notification_id).await
    }

    pub async fn mark_all_read(&self, actor: Actor) -> Result<usize, EngineError> {
        self.engine.mark_all_read(Recipient::User(actor.id)).await
    }
}
