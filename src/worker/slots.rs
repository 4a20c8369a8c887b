use crate::metrics;
use crate::registry_store::JobId;
use serde::Serialize;
use std::sync::{Arc, Mutex};

/// What a worker slot is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Idle,
    Claimed,
    Executing,
    Reporting,
}

impl SlotState {
    const ALL: [SlotState; 4] = [
        SlotState::Idle,
        SlotState::Claimed,
        SlotState::Executing,
        SlotState::Reporting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SlotState::Idle => "idle",
            SlotState::Claimed => "claimed",
            SlotState::Executing => "executing",
            SlotState::Reporting => "reporting",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotStatus {
    pub state: SlotState,
    pub job_id: Option<JobId>,
}

/// Shared view of every slot in a pool, mirrored into the `worker_slots` gauge.
#[derive(Clone)]
pub(super) struct SlotTable {
    slots: Arc<Mutex<Vec<SlotStatus>>>,
}

impl SlotTable {
    pub(super) fn new(size: usize) -> Self {
        let table = Self {
            slots: Arc::new(Mutex::new(vec![
                SlotStatus {
                    state: SlotState::Idle,
                    job_id: None,
                };
                size
            ])),
        };
        table.publish(&table.snapshot());
        table
    }

    pub(super) fn set(&self, slot: usize, state: SlotState, job_id: Option<JobId>) {
        let snapshot = {
            let mut slots = match self.slots.lock() {
                Ok(slots) => slots,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(entry) = slots.get_mut(slot) {
                *entry = SlotStatus { state, job_id };
            }
            slots.clone()
        };
        self.publish(&snapshot);
    }

    pub(super) fn snapshot(&self) -> Vec<SlotStatus> {
        match self.slots.lock() {
            Ok(slots) => slots.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn publish(&self, snapshot: &[SlotStatus]) {
        let counts: Vec<(&str, usize)> = SlotState::ALL
            .iter()
            .map(|state| {
                (
                    state.as_str(),
                    snapshot.iter().filter(|s| s.state == *state).count(),
                )
            })
            .collect();
        metrics::set_worker_slots(&counts);
    }
}
