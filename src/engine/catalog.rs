//! Staff-side registration of spaces, opening hours, maintenance and equipment.

use chrono::{NaiveDate, NaiveTime, Weekday};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, Entity};

#[derive(Debug, Clone)]
pub struct NewSpace {
    pub name: String,
    pub kind: SpaceKind,
    pub building: Option<String>,
    pub floor: Option<String>,
    pub capacity: u32,
}

#[derive(Debug, Clone)]
pub struct NewWindow {
    pub space_id: Ulid,
    pub weekday: Weekday,
    pub open: NaiveTime,
    pub close: NaiveTime,
    pub effective_from: NaiveDate,
}

#[derive(Debug, Clone)]
pub struct NewMaintenance {
    pub space_id: Ulid,
    pub kind: MaintenanceKind,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewItem {
    pub name: String,
    pub category: ItemCategory,
    pub total_qty: u32,
}

fn check_name(name: &str, what: &'static str) -> Result<String, EngineError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(EngineError::Validation(format!("{what} name is required")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(name.to_string())
}

fn check_capacity(capacity: u32) -> Result<(), EngineError> {
    if capacity == 0 {
        return Err(EngineError::Validation("capacity must be at least 1".into()));
    }
    if capacity > MAX_CAPACITY {
        return Err(EngineError::LimitExceeded("capacity too large"));
    }
    Ok(())
}

fn short_text(text: Option<String>) -> Result<Option<String>, EngineError> {
    match text.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()) {
        Some(t) if t.len() > MAX_NAME_LEN => Err(EngineError::LimitExceeded("field too long")),
        other => Ok(other),
    }
}

impl Engine {
    pub async fn create_space(&self, input: NewSpace) -> Result<Space, EngineError> {
        let _shared = self.writers.read().await;
        if self.calendars.len() >= MAX_SPACES {
            return Err(EngineError::LimitExceeded("too many spaces"));
        }
        check_capacity(input.capacity)?;
        let space = Space {
            id: Ulid::new(),
            name: check_name(&input.name, "space")?,
            kind: input.kind,
            building: short_text(input.building)?,
            floor: short_text(input.floor)?,
            capacity: input.capacity,
            state: SpaceState::Available,
        };
        self.persist_and_index(&Event::SpaceCreated { space: space.clone() }).await?;
        info!(space = %space.id, name = %space.name, "space created");
        Ok(space)
    }

    pub async fn set_space_state(&self, space_id: Ulid, state: SpaceState) -> Result<Space, EngineError> {
        self.update_space(space_id, None, Some(state)).await
    }

    /// Existing bookings keep their attendee counts; only new requests see the new limit.
    pub async fn set_space_capacity(&self, space_id: Ulid, capacity: u32) -> Result<Space, EngineError> {
        check_capacity(capacity)?;
        self.update_space(space_id, Some(capacity), None).await
    }

    async fn update_space(
        &self,
        space_id: Ulid,
        capacity: Option<u32>,
        state: Option<SpaceState>,
    ) -> Result<Space, EngineError> {
        let _shared = self.writers.read().await;
        let calendar = self.calendar(space_id)?;
        let mut cal = calendar.write().await;
        let event = Event::SpaceUpdated {
            id: space_id,
            capacity: capacity.unwrap_or(cal.space.capacity),
            state: state.unwrap_or(cal.space.state),
        };
        self.persist_to_calendar(&mut cal, &event).await?;
        info!(space = %space_id, capacity = cal.space.capacity, state = %cal.space.state, "space updated");
        Ok(cal.space.clone())
    }

    pub async fn add_operating_window(&self, input: NewWindow) -> Result<OperatingWindow, EngineError> {
        let _shared = self.writers.read().await;
        if input.open >= input.close {
            return Err(EngineError::Validation("closing time must be after opening time".into()));
        }
        let calendar = self.calendar(input.space_id)?;
        let mut cal = calendar.write().await;
        if cal.windows.len() >= MAX_WINDOWS_PER_SPACE {
            return Err(EngineError::LimitExceeded("too many operating windows on space"));
        }
        let window = OperatingWindow {
            id: Ulid::new(),
            space_id: input.space_id,
            weekday: input.weekday,
            open: input.open,
            close: input.close,
            effective_from: input.effective_from,
        };
        self.persist_to_calendar(&mut cal, &Event::WindowAdded { window: window.clone() })
            .await?;
        info!(
            space = %window.space_id,
            weekday = %window.weekday,
            open = %window.open,
            close = %window.close,
            from = %window.effective_from,
            "operating window added"
        );
        Ok(window)
    }

    pub async fn remove_operating_window(&self, window_id: Ulid) -> Result<(), EngineError> {
        let _shared = self.writers.read().await;
        let space_id = self
            .catalog_index
            .get(&window_id)
            .map(|e| *e.value())
            .ok_or(EngineError::not_found(Entity::Window, window_id))?;
        let calendar = self.calendar(space_id)?;
        let mut cal = calendar.write().await;
        if !cal.windows.iter().any(|w| w.id == window_id) {
            return Err(EngineError::not_found(Entity::Window, window_id));
        }
        self.persist_to_calendar(&mut cal, &Event::WindowRemoved { id: window_id, space_id })
            .await?;
        info!(space = %space_id, window = %window_id, "operating window removed");
        Ok(())
    }

    /// Existing bookings inside the block are left alone; staff cancel them explicitly.
    pub async fn schedule_maintenance(&self, input: NewMaintenance) -> Result<MaintenanceBlock, EngineError> {
        let _shared = self.writers.read().await;
        if input.start_date > input.end_date {
            return Err(EngineError::Validation("maintenance must end on or after its start date".into()));
        }
        if let Some(d) = &input.description
            && d.len() > MAX_REASON_LEN
        {
            return Err(EngineError::LimitExceeded("description too long"));
        }
        let calendar = self.calendar(input.space_id)?;
        let mut cal = calendar.write().await;
        if cal.blocks.len() >= MAX_BLOCKS_PER_SPACE {
            return Err(EngineError::LimitExceeded("too many maintenance blocks on space"));
        }
        let block = MaintenanceBlock {
            id: Ulid::new(),
            space_id: input.space_id,
            kind: input.kind,
            start_date: input.start_date,
            end_date: input.end_date,
            state: MaintenanceState::Scheduled,
            description: input.description,
        };
        self.persist_to_calendar(&mut cal, &Event::MaintenanceScheduled { block: block.clone() })
            .await?;
        info!(
            space = %block.space_id,
            block = %block.id,
            from = %block.start_date,
            to = %block.end_date,
            "maintenance scheduled"
        );
        Ok(block)
    }

    /// Scheduled → InProgress → Completed, or Cancelled from either open state.
    pub async fn set_maintenance_state(
        &self,
        block_id: Ulid,
        state: MaintenanceState,
    ) -> Result<MaintenanceBlock, EngineError> {
        use MaintenanceState::*;
        let _shared = self.writers.read().await;
        let space_id = self
            .catalog_index
            .get(&block_id)
            .map(|e| *e.value())
            .ok_or(EngineError::not_found(Entity::Maintenance, block_id))?;
        let calendar = self.calendar(space_id)?;
        let mut cal = calendar.write().await;
        let current = cal
            .blocks
            .iter()
            .find(|b| b.id == block_id)
            .map(|b| b.state)
            .ok_or(EngineError::not_found(Entity::Maintenance, block_id))?;
        let allowed = matches!(
            (current, state),
            (Scheduled, InProgress) | (Scheduled, Completed) | (Scheduled, Cancelled) | (InProgress, Completed) | (InProgress, Cancelled)
        );
        if !allowed {
            return Err(EngineError::state(Entity::Maintenance, format!("{current:?}"), format!("{state:?}")));
        }
        let event = Event::MaintenanceStateChanged { id: block_id, space_id, state };
        self.persist_to_calendar(&mut cal, &event).await?;
        info!(block = %block_id, state = ?state, "maintenance state changed");
        cal.blocks
            .iter()
            .find(|b| b.id == block_id)
            .cloned()
            .ok_or(EngineError::not_found(Entity::Maintenance, block_id))
    }

    pub async fn add_equipment_item(&self, input: NewItem) -> Result<EquipmentItem, EngineError> {
        let _shared = self.writers.read().await;
        if self.items.len() >= MAX_ITEMS {
            return Err(EngineError::LimitExceeded("too many equipment items"));
        }
        if input.total_qty > MAX_ITEM_QTY {
            return Err(EngineError::LimitExceeded("quantity too large"));
        }
        let item = EquipmentItem {
            id: Ulid::new(),
            name: check_name(&input.name, "item")?,
            category: input.category,
            total_qty: input.total_qty,
            available_qty: input.total_qty,
            state: if input.total_qty == 0 { ItemState::Retired } else { ItemState::Available },
        };
        self.persist_and_index(&Event::ItemAdded { item: item.clone() }).await?;
        info!(item = %item.id, name = %item.name, qty = item.total_qty, "equipment item added");
        Ok(item)
    }

    /// Take an item out of circulation or put it back. `OnLoan` is derived from
    /// counts and cannot be set directly.
    pub async fn set_item_state(&self, item_id: Ulid, state: ItemState) -> Result<EquipmentItem, EngineError> {
        let _shared = self.writers.read().await;
        if state == ItemState::OnLoan {
            return Err(EngineError::Validation("on-loan state follows from loans and cannot be set".into()));
        }
        let item = self.item(item_id)?;
        let mut ledger = item.lock().await;
        let state = if state == ItemState::Available && ledger.item.available_qty == 0 {
            ItemState::OnLoan
        } else {
            state
        };
        self.persist_to_item(&mut ledger, &Event::ItemStateChanged { id: item_id, state })
            .await?;
        info!(item = %item_id, state = ?state, "equipment state changed");
        Ok(ledger.item.clone())
    }
}
