//! Authorized-subscriber list per node
//!
//! A subscriber may use a node when its plan shares a label with the node, it
//! is not banned, it has a credential, and its current period's billable usage
//! is strictly below the plan quota. Quota exhaustion simply removes the
//! subscriber from the list; there is no degraded state.

use crate::directory::Directory;
use crate::error::Result;
use crate::models::{AccountingPeriod, NodeId, Plan, PlanId};
use crate::store::SqliteStore;
use chrono::{DateTime, Utc};
use meterboard_types::NodeUser;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Where a subscriber stands against its plan quota
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaState {
    Available { remaining: u64 },
    Exhausted { used: u64, quota: u64 },
    /// Zero quota means no traffic at all, not unlimited
    ZeroQuota,
}

impl QuotaState {
    pub fn is_available(&self) -> bool {
        matches!(self, QuotaState::Available { .. })
    }
}

/// Quota state of a subscriber on `plan` given its current period
pub fn quota_state(plan: &Plan, period: Option<&AccountingPeriod>, now: DateTime<Utc>) -> QuotaState {
    if plan.quota_bytes == 0 {
        return QuotaState::ZeroQuota;
    }

    let used = match period {
        // No period yet: nothing used
        None => 0,
        // Will be rolled over on next access
        Some(period) if period.is_expired(now) || period.plan_id != plan.id => 0,
        Some(period) => period.counters.billable_total(),
    };

    if used < plan.quota_bytes {
        QuotaState::Available {
            remaining: plan.quota_bytes - used,
        }
    } else {
        QuotaState::Exhausted {
            used,
            quota: plan.quota_bytes,
        }
    }
}

/// Computes the authorized-subscriber list for a node
pub struct EligibilityFilter {
    directory: Arc<dyn Directory>,
    store: Arc<SqliteStore>,
}

impl EligibilityFilter {
    pub fn new(directory: Arc<dyn Directory>, store: Arc<SqliteStore>) -> Self {
        Self { directory, store }
    }

    /// Subscribers `node_id` may serve, ordered by id
    pub fn authorized_subscribers(&self, node_id: NodeId, now: DateTime<Utc>) -> Result<Vec<NodeUser>> {
        let node = self.directory.node(node_id)?;
        let plans: HashMap<PlanId, Plan> = self
            .directory
            .plans_with_any_label(&node.labels)?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();
        if plans.is_empty() {
            return Ok(Vec::new());
        }

        let plan_ids: Vec<PlanId> = plans.keys().copied().collect();
        let subscribers = self.directory.subscribers_on_plans(&plan_ids)?;
        let periods = self.store.read(|ledger| ledger.current_periods())?;

        let mut users = Vec::new();
        let (mut banned, mut exhausted, mut no_uuid) = (0usize, 0usize, 0usize);

        for subscriber in subscribers {
            if subscriber.banned {
                banned += 1;
                continue;
            }
            let uuid = match subscriber.uuid.as_deref() {
                Some(uuid) if !uuid.is_empty() => uuid,
                _ => {
                    no_uuid += 1;
                    continue;
                }
            };
            let Some(plan) = subscriber.plan_id.and_then(|id| plans.get(&id)) else {
                continue;
            };

            if !quota_state(plan, periods.get(&subscriber.id), now).is_available() {
                exhausted += 1;
                continue;
            }

            users.push(NodeUser {
                id: subscriber.id,
                uuid: uuid.to_string(),
                speed_limit: plan.speed_limit.unwrap_or(0),
                device_limit: plan.device_limit.unwrap_or(0),
            });
        }

        users.sort_by_key(|u| u.id);
        debug!(
            node_id,
            authorized = users.len(),
            banned,
            exhausted,
            no_uuid,
            "Computed authorized subscribers"
        );
        Ok(users)
    }
}
