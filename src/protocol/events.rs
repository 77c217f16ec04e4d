//! Engine events for state change notifications.
//!
//! Events are recorded for every accounting change so clients and the
//! simulator can follow accumulator movements without diffing state.
//! The log is bounded; the oldest events are pruned first.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::liquidation::sequencer::LiquidationKind;
use crate::utils::constants::MAX_EVENT_LOG;
use crate::utils::crypto::{Address, Hash, PositionId};
use crate::utils::math::{Decimal18, U256};

// ═══════════════════════════════════════════════════════════════════════════════
// EVENT TYPES
// ═══════════════════════════════════════════════════════════════════════════════

/// Operation that changed a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionOperation {
    /// Position opened
    Open,
    /// Collateral or debt adjusted
    Adjust,
    /// Closed by the owner
    Close,
    /// Debt redeemed against collateral
    Redeem,
    /// Pending rewards folded into stored balances
    ApplyPendingRewards,
    /// Stability pool collateral gain added as collateral
    CollateralGainToPosition,
}

/// All engine event types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineEvent {
    // Position events
    /// Position balances or stake changed
    PositionUpdated {
        /// Position
        position: PositionId,
        /// Debt after the change
        debt: Decimal18,
        /// Collateral after the change
        collateral: Decimal18,
        /// Stake after the change
        stake: Decimal18,
        /// Operation
        operation: PositionOperation,
    },
    /// Position liquidated
    PositionLiquidated {
        /// Position
        position: PositionId,
        /// How its debt was absorbed
        kind: LiquidationKind,
        /// Entire debt
        debt: Decimal18,
        /// Entire collateral
        collateral: Decimal18,
    },
    /// Liquidation call completed
    Liquidation {
        /// Caller receiving gas compensation
        liquidator: Address,
        /// Number of positions liquidated
        liquidated: usize,
        /// Debt absorbed by the stability pool
        debt_offset: Decimal18,
        /// Debt redistributed
        debt_redistributed: Decimal18,
        /// Collateral paid to the caller
        coll_gas_compensation: Decimal18,
        /// Debt-token reserve paid to the caller
        debt_gas_compensation: Decimal18,
    },
    /// Collateral redeemed from a position
    Redemption {
        /// Position
        position: PositionId,
        /// Redeemer
        redeemer: Address,
        /// Debt repaid
        debt: Decimal18,
        /// Collateral sent to the redeemer
        collateral: Decimal18,
    },
    /// Surplus collateral claimed
    CollSurplusClaimed {
        /// Owner
        owner: Address,
        /// Amount
        amount: Decimal18,
    },

    // Accumulator events
    /// Redistribution accumulators changed
    LTermsUpdated {
        /// Collateral per unit staked
        l_collateral: U256,
        /// Debt per unit staked
        l_debt: U256,
    },
    /// Stake baseline refreshed
    SystemSnapshotsUpdated {
        /// Total stakes snapshot
        total_stakes_snapshot: Decimal18,
        /// Total collateral snapshot
        total_collateral_snapshot: Decimal18,
    },
    /// Stability pool product, scale or epoch changed
    ProductUpdated {
        /// Product `P`
        p: U256,
        /// Scale
        scale: u64,
        /// Epoch
        epoch: u64,
    },
    /// Collateral sum `S` changed
    SumUpdated {
        /// Epoch
        epoch: u64,
        /// Scale
        scale: u64,
        /// New value
        s: U256,
    },
    /// Secondary sum `G` changed
    SecondarySumUpdated {
        /// Epoch
        epoch: u64,
        /// Scale
        scale: u64,
        /// New value
        g: U256,
    },

    // Stability pool events
    /// Deposit changed
    DepositUpdated {
        /// Depositor
        depositor: Address,
        /// Front end tag
        front_end: Option<Address>,
        /// Deposit after the change
        deposit: Decimal18,
    },
    /// Front end registered
    FrontEndRegistered {
        /// Front end
        front_end: Address,
        /// Kickback rate
        kickback_rate: Decimal18,
    },
    /// Collateral gain paid to a depositor or moved into their position
    CollateralGainWithdrawn {
        /// Depositor
        depositor: Address,
        /// Amount
        amount: Decimal18,
    },
    /// Secondary tokens paid
    SecondaryGainPaid {
        /// Recipient (depositor or front end)
        recipient: Address,
        /// Amount
        amount: Decimal18,
    },
}

impl EngineEvent {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::PositionUpdated { .. } => "PositionUpdated",
            Self::PositionLiquidated { .. } => "PositionLiquidated",
            Self::Liquidation { .. } => "Liquidation",
            Self::Redemption { .. } => "Redemption",
            Self::CollSurplusClaimed { .. } => "CollSurplusClaimed",
            Self::LTermsUpdated { .. } => "LTermsUpdated",
            Self::SystemSnapshotsUpdated { .. } => "SystemSnapshotsUpdated",
            Self::ProductUpdated { .. } => "ProductUpdated",
            Self::SumUpdated { .. } => "SumUpdated",
            Self::SecondarySumUpdated { .. } => "SecondarySumUpdated",
            Self::DepositUpdated { .. } => "DepositUpdated",
            Self::FrontEndRegistered { .. } => "FrontEndRegistered",
            Self::CollateralGainWithdrawn { .. } => "CollateralGainWithdrawn",
            Self::SecondaryGainPaid { .. } => "SecondaryGainPaid",
        }
    }
}

/// An event with its position in the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// Monotonic sequence number, never reused after pruning
    pub sequence: u64,
    /// Engine time when recorded
    pub timestamp: u64,
    /// The event
    pub event: EngineEvent,
}

impl RecordedEvent {
    /// Compute event hash
    pub fn hash(&self) -> Hash {
        let data = bincode::serialize(self).unwrap_or_default();
        Hash::sha256(&data)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EVENT LOG
// ═══════════════════════════════════════════════════════════════════════════════

/// Bounded event log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLog {
    events: VecDeque<RecordedEvent>,
    max_events: usize,
    next_sequence: u64,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(MAX_EVENT_LOG)
    }
}

impl EventLog {
    /// Create an empty log keeping at most `max_events`
    pub fn new(max_events: usize) -> Self {
        Self {
            events: VecDeque::new(),
            max_events,
            next_sequence: 0,
        }
    }

    /// Record an event, pruning the oldest when full
    pub fn push(&mut self, timestamp: u64, event: EngineEvent) {
        self.events.push_back(RecordedEvent {
            sequence: self.next_sequence,
            timestamp,
            event,
        });
        self.next_sequence += 1;
        while self.events.len() > self.max_events {
            self.events.pop_front();
        }
    }

    /// Iterate events, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &RecordedEvent> {
        self.events.iter()
    }

    /// Most recent event
    pub fn last(&self) -> Option<&RecordedEvent> {
        self.events.back()
    }

    /// Get events of a specific type
    pub fn filter_by_type(&self, event_type: &str) -> Vec<&RecordedEvent> {
        self.events
            .iter()
            .filter(|e| e.event.event_type() == event_type)
            .collect()
    }

    /// Get the number of retained events
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Total number of events ever recorded
    pub fn total_recorded(&self) -> u64 {
        self.next_sequence
    }

    /// Clear all events
    pub fn clear(&mut self) {
        self.events.clear();
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn claimed(n: u64) -> EngineEvent {
        EngineEvent::CollSurplusClaimed {
            owner: Address::from_index(n),
            amount: Decimal18::from_integer(n),
        }
    }

    #[test]
    fn test_event_types() {
        let event = EngineEvent::ProductUpdated {
            p: U256::exp10(18),
            scale: 0,
            epoch: 1,
        };
        assert_eq!(event.event_type(), "ProductUpdated");
        assert_eq!(claimed(1).event_type(), "CollSurplusClaimed");
    }

    #[test]
    fn test_event_log() {
        let mut log = EventLog::new(10);
        assert!(log.is_empty());

        log.push(5, claimed(1));
        log.push(
            6,
            EngineEvent::LTermsUpdated {
                l_collateral: U256::one(),
                l_debt: U256::one(),
            },
        );

        assert_eq!(log.len(), 2);
        assert_eq!(log.filter_by_type("CollSurplusClaimed").len(), 1);
        assert_eq!(log.last().unwrap().timestamp, 6);
        assert_eq!(log.last().unwrap().sequence, 1);
    }

    #[test]
    fn test_event_log_prunes_oldest() {
        let mut log = EventLog::new(3);
        for n in 0..5 {
            log.push(n, claimed(n));
        }

        assert_eq!(log.len(), 3);
        assert_eq!(log.total_recorded(), 5);
        let sequences: Vec<u64> = log.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![2, 3, 4]);
    }

    #[test]
    fn test_event_hash() {
        let mut log = EventLog::new(2);
        log.push(1, claimed(1));
        log.push(1, claimed(2));

        let events: Vec<&RecordedEvent> = log.iter().collect();
        assert_eq!(events[0].hash(), events[0].hash());
        assert_ne!(events[0].hash(), events[1].hash());
        assert_ne!(events[0].hash(), Hash::zero());
    }
}
