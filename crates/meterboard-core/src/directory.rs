//! Read access to plans, nodes and subscribers
//!
//! The catalog is owned elsewhere (admin panel, billing). The metering core
//! only needs lookups by id and the label join used for eligibility, so it
//! depends on this trait rather than on a concrete store.

use crate::error::{CoreError, Result};
use crate::models::{LabelId, Node, NodeId, Plan, PlanId, Subscriber, SubscriberId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// Catalog lookups used by the metering core
pub trait Directory: Send + Sync {
    fn subscriber(&self, subscriber_id: SubscriberId) -> Result<Subscriber>;

    fn plan(&self, plan_id: PlanId) -> Result<Plan>;

    fn node(&self, node_id: NodeId) -> Result<Node>;

    /// Plans granting at least one of `labels`
    fn plans_with_any_label(&self, labels: &[LabelId]) -> Result<Vec<Plan>>;

    /// Subscribers assigned to any of `plan_ids`, banned ones included
    fn subscribers_on_plans(&self, plan_ids: &[PlanId]) -> Result<Vec<Subscriber>>;

    /// Record that a node reported in
    fn touch_node(&self, node_id: NodeId, at: DateTime<Utc>) -> Result<()>;
}

/// In-process catalog, used by tests and embedders that keep the catalog elsewhere
#[derive(Default)]
pub struct MemoryDirectory {
    subscribers: DashMap<SubscriberId, Subscriber>,
    plans: DashMap<PlanId, Plan>,
    nodes: DashMap<NodeId, Node>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_plan(&self, plan: Plan) {
        self.plans.insert(plan.id, plan);
    }

    pub fn insert_node(&self, node: Node) {
        self.nodes.insert(node.id, node);
    }

    pub fn insert_subscriber(&self, subscriber: Subscriber) {
        self.subscribers.insert(subscriber.id, subscriber);
    }

    pub fn set_banned(&self, subscriber_id: SubscriberId, banned: bool) -> Result<()> {
        let mut entry = self
            .subscribers
            .get_mut(&subscriber_id)
            .ok_or(CoreError::SubscriberNotFound { subscriber_id })?;
        entry.banned = banned;
        Ok(())
    }

    pub fn assign_plan(&self, subscriber_id: SubscriberId, plan_id: Option<PlanId>) -> Result<()> {
        let mut entry = self
            .subscribers
            .get_mut(&subscriber_id)
            .ok_or(CoreError::SubscriberNotFound { subscriber_id })?;
        entry.plan_id = plan_id;
        Ok(())
    }
}

impl Directory for MemoryDirectory {
    fn subscriber(&self, subscriber_id: SubscriberId) -> Result<Subscriber> {
        self.subscribers
            .get(&subscriber_id)
            .map(|s| s.clone())
            .ok_or(CoreError::SubscriberNotFound { subscriber_id })
    }

    fn plan(&self, plan_id: PlanId) -> Result<Plan> {
        self.plans
            .get(&plan_id)
            .map(|p| p.clone())
            .ok_or(CoreError::PlanNotFound { plan_id })
    }

    fn node(&self, node_id: NodeId) -> Result<Node> {
        self.nodes
            .get(&node_id)
            .map(|n| n.clone())
            .ok_or(CoreError::NodeNotFound { node_id })
    }

    fn plans_with_any_label(&self, labels: &[LabelId]) -> Result<Vec<Plan>> {
        let mut plans: Vec<Plan> = self
            .plans
            .iter()
            .filter(|p| p.shares_label(labels))
            .map(|p| p.clone())
            .collect();
        plans.sort_by_key(|p| p.id);
        Ok(plans)
    }

    fn subscribers_on_plans(&self, plan_ids: &[PlanId]) -> Result<Vec<Subscriber>> {
        let mut subscribers: Vec<Subscriber> = self
            .subscribers
            .iter()
            .filter(|s| s.plan_id.is_some_and(|p| plan_ids.contains(&p)))
            .map(|s| s.clone())
            .collect();
        subscribers.sort_by_key(|s| s.id);
        Ok(subscribers)
    }

    fn touch_node(&self, node_id: NodeId, at: DateTime<Utc>) -> Result<()> {
        let mut node = self
            .nodes
            .get_mut(&node_id)
            .ok_or(CoreError::NodeNotFound { node_id })?;
        node.last_seen_at = Some(at);
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_lookups_report_not_found() {
        let dir = MemoryDirectory::new();
        assert!(matches!(
            dir.subscriber(1),
            Err(CoreError::SubscriberNotFound { subscriber_id: 1 })
        ));
        assert!(matches!(dir.node(2), Err(CoreError::NodeNotFound { node_id: 2 })));
        assert!(matches!(dir.plan(3), Err(CoreError::PlanNotFound { plan_id: 3 })));
    }

    #[test]
    fn test_label_join() {
        let dir = MemoryDirectory::new();
        dir.insert_plan(plan(1, 100, vec![10]));
        dir.insert_plan(plan(2, 100, vec![20, 30]));
        dir.insert_plan(plan(3, 100, vec![]));
        dir.insert_subscriber(subscriber(1, Some(1)));
        dir.insert_subscriber(subscriber(2, Some(2)));
        dir.insert_subscriber(subscriber(3, None));

        let plans = dir.plans_with_any_label(&[30, 40]).unwrap();
        assert_eq!(plans.iter().map(|p| p.id).collect::<Vec<_>>(), vec![2]);

        let subs = dir.subscribers_on_plans(&[1, 2]).unwrap();
        assert_eq!(subs.iter().map(|s| s.id).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_touch_and_ban() {
        let dir = MemoryDirectory::new();
        dir.insert_node(node(5, 1.0, vec![]));
        dir.insert_subscriber(subscriber(1, None));

        let at = Utc::now();
        dir.touch_node(5, at).unwrap();
        assert_eq!(dir.node(5).unwrap().last_seen_at, Some(at));

        dir.set_banned(1, true).unwrap();
        assert!(dir.subscriber(1).unwrap().banned);
        assert!(dir.set_banned(9, true).is_err());
    }
}
