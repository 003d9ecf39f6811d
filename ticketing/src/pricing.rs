//! Dynamic pricing.
//!
//! [`PricingEngine`] turns an event, its rules and the current time into the
//! unit price a buyer is charged. It is a pure function: no I/O, no clock
//! reads, and it never takes a price as input.
//!
//! # Evaluation
//!
//! ```text
//! start  = early_bird.price if now < early_bird.deadline else base_price
//! for rule in rules (insertion order, active only):
//!     TIME_BEFORE_EVENT fires when 0 < hours_remaining <= threshold
//!     DEMAND_PERCENT    fires when percent_sold >= threshold
//!     PERCENTAGE        adds floor(base_price * magnitude / 100)
//!     FIXED_MINOR_UNITS adds magnitude
//! total  = max(start + Σ adjustments, 0)
//! ```
//!
//! All arithmetic is exact integer math in minor units; percentages are
//! floored toward negative infinity.

use crate::types::{AdjustmentKind, Event, Money, PricingRule, RuleId, TriggerKind};
use chrono::{DateTime, Utc};
use serde::Serialize;

const MILLIS_PER_HOUR: i64 = 3_600_000;

/// One fired rule and what it added
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct AppliedAdjustment {
    /// Rule that fired
    pub rule_id: RuleId,
    /// Signed amount added, in minor units
    pub amount: i128,
}

/// Itemized price computation
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PriceQuote {
    /// Base price, or the early-bird price while that window is open
    pub starting_price: Money,
    /// Whether the early-bird price was used
    pub early_bird_applied: bool,
    /// Fired rules in evaluation order
    pub adjustments: Vec<AppliedAdjustment>,
    /// Final unit price, floored at zero
    pub total: Money,
}

/// Stateless pricing evaluator
#[derive(Debug, Clone, Copy, Default)]
pub struct PricingEngine;

impl PricingEngine {
    /// Effective unit price for `event` at `now`
    #[must_use]
    pub fn compute_price(event: &Event, rules: &[PricingRule], now: DateTime<Utc>) -> Money {
        Self::quote(event, rules, now).total
    }

    /// Itemized version of [`PricingEngine::compute_price`]
    #[must_use]
    pub fn quote(event: &Event, rules: &[PricingRule], now: DateTime<Utc>) -> PriceQuote {
        let (starting_price, early_bird_applied) = match event.early_bird {
            Some(early_bird) if now < early_bird.deadline => (early_bird.price, true),
            _ => (event.base_price, false),
        };

        let millis_remaining = (event.starts_at - now).num_milliseconds();
        let base = i128::from(event.base_price.minor_units());

        let adjustments: Vec<AppliedAdjustment> = rules
            .iter()
            .filter(|rule| rule.active)
            .filter(|rule| Self::fires(rule, event, millis_remaining))
            .map(|rule| AppliedAdjustment {
                rule_id: rule.id,
                amount: Self::adjustment(rule, base),
            })
            .collect();

        let total = adjustments
            .iter()
            .fold(i128::from(starting_price.minor_units()), |total, adjustment| {
                total.saturating_add(adjustment.amount)
            });

        PriceQuote {
            starting_price,
            early_bird_applied,
            adjustments,
            total: Money::from_minor_units(clamp_to_minor_units(total)),
        }
    }

    fn fires(rule: &PricingRule, event: &Event, millis_remaining: i64) -> bool {
        match rule.trigger_kind {
            TriggerKind::TimeBeforeEvent => {
                let window = i64::from(rule.threshold) * MILLIS_PER_HOUR;
                millis_remaining > 0 && millis_remaining <= window
            },
            TriggerKind::DemandPercent => {
                if event.capacity == 0 {
                    return rule.threshold == 0;
                }
                // percent_sold >= threshold, cross-multiplied to stay in integers
                u64::from(event.confirmed_sold) * 100
                    >= u64::from(rule.threshold) * u64::from(event.capacity)
            },
        }
    }

    fn adjustment(rule: &PricingRule, base: i128) -> i128 {
        let magnitude = i128::from(rule.magnitude);
        match rule.adjustment_kind {
            AdjustmentKind::Percentage => base.saturating_mul(magnitude).div_euclid(100),
            AdjustmentKind::FixedMinorUnits => magnitude,
        }
    }
}

fn clamp_to_minor_units(total: i128) -> u64 {
    u64::try_from(total.max(0)).unwrap_or(u64::MAX)
}
