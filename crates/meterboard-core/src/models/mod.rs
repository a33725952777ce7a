//! Data models for meterboard

pub mod catalog;
pub mod traffic;
pub mod usage;

pub use catalog::{
    LabelId, Node, NodeId, NodeStatus, Plan, PlanId, ResetCadence, Subscriber, SubscriberId,
    NEUTRAL_MULTIPLIER,
};
pub use traffic::{OnlineDeviceRecord, TrafficReport};
pub use usage::{AccountingPeriod, NodeUsage, PeriodBounds, PeriodId, UsageCounters};
