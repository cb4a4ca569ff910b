use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::{DayStamp, DepartmentId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceError {
    ExhaustedRange {
        department: DepartmentId,
        day: DayStamp,
    },
}

/// Shape of the issued display codes.
#[derive(Debug, Clone)]
pub struct SequencerConfig {
    /// Zero-padded counter width; the per-day code space per department is
    /// `10^code_digits - 1`.
    pub code_digits: usize,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self { code_digits: 3 }
    }
}

/// Exported counter state, used for snapshot recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterEntry {
    pub department: DepartmentId,
    pub day: DayStamp,
    pub last_issued: u32,
}

/// Issues display sequence codes, monotonic and unique per (department, day).
///
/// The counter map sits behind a single mutex independent of all queue
/// locks; the increment is the only atomic section.
#[derive(Debug, Default)]
pub struct TicketSequencer {
    config: SequencerConfig,
    counters: Mutex<HashMap<(DepartmentId, DayStamp), u32>>,
}

impl TicketSequencer {
    pub fn new() -> Self {
        Self::with_config(SequencerConfig::default())
    }

    pub fn with_config(config: SequencerConfig) -> Self {
        Self {
            config,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Issues the next code for (department, day), e.g. "A012".
    ///
    /// The prefix is the department id rendered as bijective base-26
    /// letters (0 → "A", 25 → "Z", 26 → "AA"). Fails with
    /// [`SequenceError::ExhaustedRange`] once the day's counter space is
    /// used up; the failure is reported, never wrapped.
    pub fn issue(
        &self,
        department: DepartmentId,
        day: DayStamp,
    ) -> Result<String, SequenceError> {
        let next = {
            let mut counters = self.counters.lock();
            let counter = counters.entry((department, day)).or_insert(0);
            if *counter >= self.max_per_day() {
                return Err(SequenceError::ExhaustedRange { department, day });
            }
            *counter += 1;
            *counter
        };

        Ok(format!(
            "{}{:0width$}",
            department_prefix(department),
            next,
            width = self.config.code_digits
        ))
    }

    /// Highest counter issued so far for (department, day), 0 if none.
    pub fn last_issued(&self, department: DepartmentId, day: DayStamp) -> u32 {
        self.counters
            .lock()
            .get(&(department, day))
            .copied()
            .unwrap_or(0)
    }

    /// Largest counter value issuable per (department, day).
    pub fn max_per_day(&self) -> u32 {
        10u32.saturating_pow(self.config.code_digits as u32) - 1
    }

    /// Exports all counters for snapshotting.
    pub fn export_counters(&self) -> Vec<CounterEntry> {
        let mut out: Vec<CounterEntry> = self
            .counters
            .lock()
            .iter()
            .map(|(&(department, day), &last_issued)| CounterEntry {
                department,
                day,
                last_issued,
            })
            .collect();
        out.sort_by_key(|e| (e.department, e.day));
        out
    }

    /// Restores counters from a snapshot, keeping the larger value on overlap.
    pub fn restore_counters(&self, entries: &[CounterEntry]) {
        let mut counters = self.counters.lock();
        for entry in entries {
            let slot = counters.entry((entry.department, entry.day)).or_insert(0);
            *slot = (*slot).max(entry.last_issued);
        }
    }
}

fn department_prefix(department: DepartmentId) -> String {
    // Bijective base-26: 0 -> "A", 25 -> "Z", 26 -> "AA".
    let mut n = u64::from(department) + 1;
    let mut letters = Vec::new();
    while n > 0 {
        n -= 1;
        letters.push(b'A' + (n % 26) as u8);
        n /= 26;
    }
    letters.reverse();
    String::from_utf8(letters).unwrap_or_else(|_| "A".to_string())
}
