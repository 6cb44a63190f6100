// src/fleet/infinity.rs - Ordered spool fallback list ("0,1,none,5")
use std::fmt;
use std::str::FromStr;

use crate::error::FleetError;

/// Global slots to fall back through when the active spool runs out.
/// `None` entries are placeholders and are skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfinityOrder {
    entries: Vec<Option<usize>>,
}

impl InfinityOrder {
    /// Parse and check every entry against the fleet size.
    pub fn parse(order: &str, total_slots: usize) -> Result<Self, FleetError> {
        let order: InfinityOrder = order.parse()?;
        if order.entries.len() > total_slots {
            return Err(FleetError::InvalidParameter(format!(
                "order can contain at most {} items, got {}",
                total_slots,
                order.entries.len()
            )));
        }
        for (i, entry) in order.entries.iter().enumerate() {
            if let Some(slot) = entry {
                if *slot >= total_slots {
                    return Err(FleetError::InvalidParameter(format!(
                        "slot {} at position {} is out of range (0-{})",
                        slot,
                        i + 1,
                        total_slots - 1
                    )));
                }
            }
        }
        Ok(order)
    }

    pub fn entries(&self) -> &[Option<usize>] {
        &self.entries
    }

    /// Position of `current`, preferring the saved cursor when it still
    /// points at that slot.
    pub fn position_of(&self, current: usize, saved: Option<usize>) -> Option<usize> {
        if let Some(pos) = saved {
            if self.entries.get(pos) == Some(&Some(current)) {
                return Some(pos);
            }
        }
        self.entries.iter().position(|e| *e == Some(current))
    }

    /// `(position, slot)` pairs after `from`, wrapping once around the list.
    /// With no starting position the scan begins at the head.
    pub fn candidates_after(&self, from: Option<usize>) -> Vec<(usize, usize)> {
        let len = self.entries.len();
        let start = from.map_or(0, |p| p + 1);
        (0..len)
            .map(|i| (start + i) % len)
            .filter_map(|pos| self.entries[pos].map(|slot| (pos, slot)))
            .collect()
    }
}

impl FromStr for InfinityOrder {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(FleetError::InvalidParameter("infinity spool order is empty".into()));
        }
        let entries = s
            .split(',')
            .enumerate()
            .map(|(i, item)| {
                let item = item.trim().to_ascii_lowercase();
                if item == "none" {
                    return Ok(None);
                }
                item.parse::<usize>().map(Some).map_err(|_| {
                    FleetError::InvalidParameter(format!(
                        "invalid value '{}' at position {}, use a slot number or 'none'",
                        item,
                        i + 1
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { entries })
    }
}

impl fmt::Display for InfinityOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .entries
            .iter()
            .map(|e| match e {
                Some(slot) => slot.to_string(),
                None => "none".to_string(),
            })
            .collect();
        write!(f, "{}", parts.join(","))
    }
}
