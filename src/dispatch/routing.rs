//! Channel → output routing
//!
//! The table is immutable. Updates build a new table which the dispatcher
//! swaps in whole, so a reader never sees half an update.

use serde::{Deserialize, Serialize};

use crate::channel::ChannelId;
use crate::constants::{MAX_CHANNELS, PHYSICAL_CHANNELS};
use crate::error::DispatchError;

/// Stereo positions of the physical sensors, left to right
pub const DEFAULT_PANS: [f32; PHYSICAL_CHANNELS] = [-1.0, -0.33, 0.33, 1.0];

/// Where a channel's beats go
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RouteTarget {
    pub bank: u8,
    /// Stereo position in `[-1, 1]`
    pub pan: f32,
}

impl RouteTarget {
    pub fn new(bank: u8, pan: f32) -> Result<Self, DispatchError> {
        if !pan.is_finite() || !(-1.0..=1.0).contains(&pan) {
            return Err(DispatchError::InvalidRoute(format!("pan {pan} outside [-1, 1]")));
        }
        Ok(Self { bank, pan })
    }
}

/// Flattened table row, as exposed over the API
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RoutingEntry {
    pub channel: ChannelId,
    pub bank: u8,
    pub pan: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoutingTable {
    routes: [Option<RouteTarget>; MAX_CHANNELS],
}

impl RoutingTable {
    /// A table that routes nothing
    pub fn empty() -> Self {
        Self {
            routes: [None; MAX_CHANNELS],
        }
    }

    /// Every channel routed to the bank of its physical sensor with the
    /// default pan for that sensor
    pub fn with_default_pans() -> Self {
        let mut table = Self::empty();
        for ch in ChannelId::all() {
            let physical = ch.physical().index();
            table.routes[ch.index()] = Some(RouteTarget {
                bank: physical as u8,
                pan: DEFAULT_PANS[physical],
            });
        }
        table
    }

    pub fn get(&self, channel: ChannelId) -> Option<RouteTarget> {
        self.routes[channel.index()]
    }

    /// Copy of this table with one route replaced
    pub fn with_route(&self, channel: ChannelId, target: RouteTarget) -> Result<Self, DispatchError> {
        let target = RouteTarget::new(target.bank, target.pan)?;
        let mut next = self.clone();
        next.routes[channel.index()] = Some(target);
        Ok(next)
    }

    /// Copy of this table with the channel unrouted
    pub fn without_route(&self, channel: ChannelId) -> Self {
        let mut next = self.clone();
        next.routes[channel.index()] = None;
        next
    }

    pub fn entries(&self) -> Vec<RoutingEntry> {
        ChannelId::all()
            .filter_map(|ch| {
                self.get(ch).map(|t| RoutingEntry {
                    channel: ch,
                    bank: t.bank,
                    pan: t.pan,
                })
            })
            .collect()
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::with_default_pans()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ch(id: u8) -> ChannelId {
        ChannelId::new(id).unwrap()
    }

    #[test]
    fn test_default_routes_mirror_physical_sensors() {
        let table = RoutingTable::default();
        assert_eq!(table.entries().len(), MAX_CHANNELS);
        assert_eq!(table.get(ch(1)), Some(RouteTarget { bank: 1, pan: -0.33 }));
        assert_eq!(table.get(ch(7)), Some(RouteTarget { bank: 3, pan: 1.0 }));
        assert_eq!(table.get(ch(4)), table.get(ch(0)));
    }

    #[test]
    fn test_update_leaves_original_untouched() {
        let table = RoutingTable::default();
        let next = table.with_route(ch(2), RouteTarget { bank: 5, pan: 0.0 }).unwrap();
        assert_eq!(next.get(ch(2)).unwrap().bank, 5);
        assert_eq!(table.get(ch(2)).unwrap().bank, 2);
    }

    #[test]
    fn test_invalid_pan_rejected() {
        let table = RoutingTable::default();
        for pan in [1.5, -1.01, f32::NAN] {
            let err = table.with_route(ch(0), RouteTarget { bank: 0, pan }).unwrap_err();
            assert!(matches!(err, DispatchError::InvalidRoute(_)));
        }
    }

    #[test]
    fn test_unrouted_channel() {
        let table = RoutingTable::default().without_route(ch(6));
        assert!(table.get(ch(6)).is_none());
        assert_eq!(table.entries().len(), MAX_CHANNELS - 1);
        assert!(RoutingTable::empty().entries().is_empty());
    }
}
