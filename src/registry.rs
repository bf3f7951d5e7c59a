//! Process-wide singletons.
//!
//! The device can run one screen recording, one system trace and one forced
//! battery discharge at a time. Each of them is modelled as a [`Slot`] that
//! the collaborator reserves while it is active; a second reservation fails
//! with a typed error instead of corrupting the first session. Reservations
//! are released when the [`Reservation`] is dropped, so every exit path
//! gives the slot back.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::CollaboratorError;

struct Slot {
    name: &'static str,
    busy: AtomicBool,
}

impl Slot {
    const fn new(name: &'static str) -> Self {
        Self {
            name,
            busy: AtomicBool::new(false),
        }
    }
}

static SCREEN_RECORDER: Slot = Slot::new("screen recorder");
static TRACE_SESSION: Slot = Slot::new("trace session");
static BATTERY_DISCHARGE: Slot = Slot::new("battery discharge");

/// Exclusive hold on one of the process-wide singletons.
#[derive(Debug)]
#[must_use = "the singleton is released as soon as the reservation is dropped"]
pub struct Reservation {
    slot: &'static Slot,
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.slot.busy.store(false, Ordering::Release);
        tracing::debug!(slot = self.slot.name, "released");
    }
}

fn acquire(slot: &'static Slot, taken: CollaboratorError) -> Result<Reservation, CollaboratorError> {
    slot.busy
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .map_err(|_| taken)?;
    tracing::debug!(slot = slot.name, "reserved");
    Ok(Reservation { slot })
}

pub fn reserve_screen_recorder() -> Result<Reservation, CollaboratorError> {
    acquire(&SCREEN_RECORDER, CollaboratorError::RecordingInProgress)
}

pub fn reserve_trace_session() -> Result<Reservation, CollaboratorError> {
    acquire(&TRACE_SESSION, CollaboratorError::AlreadyTracing)
}

pub fn reserve_battery_discharge() -> Result<Reservation, CollaboratorError> {
    acquire(&BATTERY_DISCHARGE, CollaboratorError::AlreadyDischarging)
}

pub fn is_screen_recording() -> bool {
    SCREEN_RECORDER.busy.load(Ordering::Acquire)
}

pub fn is_tracing() -> bool {
    TRACE_SESSION.busy.load(Ordering::Acquire)
}

pub fn is_discharging() -> bool {
    BATTERY_DISCHARGE.busy.load(Ordering::Acquire)
}
