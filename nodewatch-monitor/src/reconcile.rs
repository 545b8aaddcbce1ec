/**
 * RECONCILER - Converges the local registry toward the authoritative node list
 *
 * PASS:
 * FetchA (+ report token harvest) -> FetchB -> Diff -> Apply -> settle -> FetchC
 *
 * - either fetch failing aborts the pass before any write
 * - Apply runs creates, then updates, then deletes; a failed operation is logged and
 *   the pass continues with the next one
 * - the settle wait gives the local service time to bring changes up and is the only
 *   point where a shutdown interrupts the pass
 * - FetchC (the local list after apply) is what gets probed and reported
 */

use crate::api::{ApiError, AuthoritativeSource, LocalRegistry};
use crate::config::ConfigStore;
use crate::cycle::Shutdown;
use crate::models::{NodeId, NodeRecord};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("authoritative node list unavailable: {0}")]
    AuthoritativeUnavailable(#[source] ApiError),
    #[error("local node list unavailable: {0}")]
    LocalUnavailable(#[source] ApiError),
    #[error("pass interrupted by shutdown")]
    Interrupted,
}

/// Disjoint id sets covering A ∪ B.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationPlan {
    /// A \ B
    pub to_create: BTreeSet<NodeId>,
    /// A ∩ B
    pub to_update: BTreeSet<NodeId>,
    /// B \ A
    pub to_delete: BTreeSet<NodeId>,
    /// A ∩ B with equal content, only filled by [`ReconciliationPlan::skip_unchanged`]
    pub unchanged: BTreeSet<NodeId>,
}

impl ReconciliationPlan {
    pub fn compute_ids(authoritative: &BTreeSet<NodeId>, local: &BTreeSet<NodeId>) -> Self {
        Self {
            to_create: authoritative.difference(local).copied().collect(),
            to_update: authoritative.intersection(local).copied().collect(),
            to_delete: local.difference(authoritative).copied().collect(),
            unchanged: BTreeSet::new(),
        }
    }

    pub fn compute(authoritative: &[NodeRecord], local: &[NodeRecord]) -> Self {
        let a: BTreeSet<_> = authoritative.iter().map(|n| n.id).collect();
        let b: BTreeSet<_> = local.iter().map(|n| n.id).collect();
        Self::compute_ids(&a, &b)
    }

    /// Moves ids whose mirrored content already matches out of `to_update`.
    pub fn skip_unchanged(mut self, authoritative: &[NodeRecord], local: &[NodeRecord]) -> Self {
        let local_by_id: HashMap<_, _> = local.iter().map(|n| (n.id, n)).collect();
        let same: Vec<NodeId> = authoritative
            .iter()
            .filter(|a| self.to_update.contains(&a.id))
            .filter(|a| local_by_id.get(&a.id).is_some_and(|b| a.same_content(b)))
            .map(|a| a.id)
            .collect();
        for id in same {
            self.to_update.remove(&id);
            self.unchanged.insert(id);
        }
        self
    }

    /// Nothing to add or remove; updates alone do not count.
    pub fn is_converged(&self) -> bool {
        self.to_create.is_empty() && self.to_delete.is_empty()
    }

    pub fn writes(&self) -> usize {
        self.to_create.len() + self.to_update.len() + self.to_delete.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub failed: usize,
}

#[derive(Debug)]
pub struct PassOutcome {
    pub plan: ReconciliationPlan,
    pub summary: ApplySummary,
    /// Source C
    pub nodes: Vec<NodeRecord>,
}

#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub settle_delay: Duration,
    pub skip_unchanged_updates: bool,
}

pub struct Reconciler<A, L> {
    authority: A,
    local: L,
    tokens: ConfigStore,
    settings: ReconcileSettings,
}

impl<A: AuthoritativeSource, L: LocalRegistry> Reconciler<A, L> {
    pub fn new(authority: A, local: L, tokens: ConfigStore, settings: ReconcileSettings) -> Self {
        Self {
            authority,
            local,
            tokens,
            settings,
        }
    }

    pub fn local(&self) -> &L {
        &self.local
    }

    pub async fn run_pass(&self, shutdown: &Shutdown) -> Result<PassOutcome, ReconcileError> {
        let authoritative = self
            .authority
            .fetch_nodes()
            .await
            .map_err(ReconcileError::AuthoritativeUnavailable)?;
        self.harvest_tokens(&authoritative).await;

        let local = self
            .local
            .fetch_nodes()
            .await
            .map_err(ReconcileError::LocalUnavailable)?;

        let mut plan = ReconciliationPlan::compute(&authoritative, &local);
        if self.settings.skip_unchanged_updates {
            plan = plan.skip_unchanged(&authoritative, &local);
        }
        info!(
            authoritative = authoritative.len(),
            local = local.len(),
            create = plan.to_create.len(),
            update = plan.to_update.len(),
            delete = plan.to_delete.len(),
            unchanged = plan.unchanged.len(),
            "reconciliation plan"
        );

        let summary = self.apply(&plan, &authoritative).await;

        debug!(delay = ?self.settings.settle_delay, "waiting for local registry to settle");
        if !shutdown.sleep(self.settings.settle_delay).await {
            return Err(ReconcileError::Interrupted);
        }

        let nodes = self
            .local
            .fetch_nodes()
            .await
            .map_err(ReconcileError::LocalUnavailable)?;
        info!(
            created = summary.created,
            updated = summary.updated,
            deleted = summary.deleted,
            failed = summary.failed,
            local_after = nodes.len(),
            "reconciliation pass done"
        );

        Ok(PassOutcome { plan, summary, nodes })
    }

    /// Persists report tokens for authoritative nodes. The list endpoint usually omits
    /// them, so each missing one is read from the node detail endpoint.
    async fn harvest_tokens(&self, nodes: &[NodeRecord]) {
        for node in nodes {
            let token = match &node.report_token {
                Some(token) => Some(token.clone()),
                None => match self.authority.fetch_node(node.id).await {
                    Ok(detail) => detail.report_token,
                    Err(e) => {
                        warn!(node_id = node.id, node = %node.name, error = %e, "cannot read node detail");
                        continue;
                    }
                },
            };
            match token.filter(|t| !t.is_empty()) {
                Some(token) => match self.tokens.set_report_token(&node.name, &token).await {
                    Ok(true) => info!(node = %node.name, "report token stored"),
                    Ok(false) => {}
                    Err(e) => error!(node = %node.name, error = %e, "failed to persist report token"),
                },
                None if self.tokens.report_token(&node.name).is_none() => {
                    warn!(node = %node.name, "no report token, generate one on the management site");
                }
                None => {}
            }
        }
    }

    async fn apply(&self, plan: &ReconciliationPlan, authoritative: &[NodeRecord]) -> ApplySummary {
        let by_id: HashMap<_, _> = authoritative.iter().map(|n| (n.id, n)).collect();
        let mut summary = ApplySummary::default();

        for id in &plan.to_create {
            let Some(node) = by_id.get(id) else { continue };
            match self.local.create_node(node).await {
                Ok(()) => {
                    summary.created += 1;
                    debug!(node_id = id, node = %node.name, "created");
                }
                Err(e) => {
                    summary.failed += 1;
                    error!(node_id = id, node = %node.name, error = %e, "create failed");
                }
            }
        }

        for id in &plan.to_update {
            let Some(node) = by_id.get(id) else { continue };
            match self.local.update_node(node).await {
                Ok(()) => {
                    summary.updated += 1;
                    debug!(node_id = id, node = %node.name, "updated");
                }
                Err(e) => {
                    summary.failed += 1;
                    error!(node_id = id, node = %node.name, error = %e, "update failed");
                }
            }
        }

        for id in &plan.to_delete {
            match self.local.delete_node(*id).await {
                Ok(()) => {
                    summary.deleted += 1;
                    debug!(node_id = id, "deleted");
                }
                Err(e) => {
                    summary.failed += 1;
                    error!(node_id = id, error = %e, "delete failed");
                }
            }
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::cycle::shutdown_channel;
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, HashSet};

    fn boom() -> ApiError {
        ApiError::Status {
            url: "fake://".into(),
            status: 500,
            body: "boom".into(),
        }
    }

    #[derive(Default)]
    struct FakeAuthority {
        nodes: Vec<NodeRecord>,
        details: HashMap<NodeId, NodeRecord>,
        down: bool,
    }

    impl AuthoritativeSource for FakeAuthority {
        async fn fetch_nodes(&self) -> Result<Vec<NodeRecord>, ApiError> {
            if self.down {
                return Err(boom());
            }
            Ok(self.nodes.clone())
        }

        async fn fetch_node(&self, id: NodeId) -> Result<NodeRecord, ApiError> {
            self.details.get(&id).cloned().ok_or_else(boom)
        }
    }

    #[derive(Default)]
    struct FakeLocal {
        nodes: Mutex<BTreeMap<NodeId, NodeRecord>>,
        ops: Mutex<Vec<String>>,
        failing: HashSet<NodeId>,
    }

    impl FakeLocal {
        fn with(ids: &[NodeId]) -> Self {
            let fake = Self::default();
            for id in ids {
                fake.nodes.lock().insert(*id, NodeRecord::new(*id, format!("local-{id}")));
            }
            fake
        }

        fn record(&self, op: &str, id: NodeId) -> Result<(), ApiError> {
            self.ops.lock().push(format!("{op} {id}"));
            if self.failing.contains(&id) {
                return Err(boom());
            }
            Ok(())
        }
    }

    impl LocalRegistry for FakeLocal {
        async fn fetch_nodes(&self) -> Result<Vec<NodeRecord>, ApiError> {
            Ok(self.nodes.lock().values().cloned().collect())
        }

        async fn create_node(&self, node: &NodeRecord) -> Result<(), ApiError> {
            self.record("create", node.id)?;
            self.nodes.lock().insert(node.id, node.without_credentials());
            Ok(())
        }

        async fn update_node(&self, node: &NodeRecord) -> Result<(), ApiError> {
            self.record("update", node.id)?;
            self.nodes.lock().insert(node.id, node.without_credentials());
            Ok(())
        }

        async fn delete_node(&self, id: NodeId) -> Result<(), ApiError> {
            self.record("delete", id)?;
            self.nodes.lock().remove(&id);
            Ok(())
        }
    }

    fn authority(ids: &[NodeId]) -> FakeAuthority {
        FakeAuthority {
            nodes: ids.iter().map(|id| NodeRecord::new(*id, format!("node-{id}"))).collect(),
            ..FakeAuthority::default()
        }
    }

    fn reconciler(a: FakeAuthority, b: FakeLocal, skip: bool) -> (Reconciler<FakeAuthority, FakeLocal>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("cfg.json"), MonitorConfig::default());
        let settings = ReconcileSettings {
            settle_delay: Duration::from_millis(1),
            skip_unchanged_updates: skip,
        };
        (Reconciler::new(a, b, store, settings), dir)
    }

    fn ids(list: &[NodeId]) -> BTreeSet<NodeId> {
        list.iter().copied().collect()
    }

    #[test]
    fn test_plan_for_overlapping_sources() {
        let plan = ReconciliationPlan::compute_ids(&ids(&[1, 2]), &ids(&[2, 3]));
        assert_eq!(plan.to_create, ids(&[1]));
        assert_eq!(plan.to_update, ids(&[2]));
        assert_eq!(plan.to_delete, ids(&[3]));
        assert!(!plan.is_converged());
    }

    #[test]
    fn test_plan_partitions_union_for_all_subsets() {
        let universe: Vec<NodeId> = (1..=6).collect();
        let subset = |mask: u32| -> BTreeSet<NodeId> {
            universe.iter().enumerate().filter(|(i, _)| mask & (1 << i) != 0).map(|(_, id)| *id).collect()
        };
        for a_mask in 0..64u32 {
            for b_mask in 0..64u32 {
                let (a, b) = (subset(a_mask), subset(b_mask));
                let plan = ReconciliationPlan::compute_ids(&a, &b);

                let union: BTreeSet<_> = a.union(&b).copied().collect();
                let mut covered = BTreeSet::new();
                let mut total = 0;
                for part in [&plan.to_create, &plan.to_update, &plan.to_delete] {
                    total += part.len();
                    covered.extend(part.iter().copied());
                }
                assert_eq!(covered, union);
                assert_eq!(total, union.len(), "sets overlap");
                assert!(plan.to_create.is_disjoint(&b));
                assert!(plan.to_delete.is_disjoint(&a));
            }
        }
    }

    #[test]
    fn test_skip_unchanged_moves_equal_nodes() {
        let a = vec![NodeRecord::new(1, "same"), NodeRecord::new(2, "renamed")];
        let b = vec![NodeRecord::new(1, "same"), NodeRecord::new(2, "old-name")];
        let plan = ReconciliationPlan::compute(&a, &b).skip_unchanged(&a, &b);
        assert_eq!(plan.unchanged, ids(&[1]));
        assert_eq!(plan.to_update, ids(&[2]));
        assert_eq!(plan.writes(), 1);
    }

    #[tokio::test]
    async fn test_pass_applies_in_order_and_converges() {
        let (rec, _dir) = reconciler(authority(&[1, 2]), FakeLocal::with(&[2, 3]), false);
        let (_trigger, shutdown) = shutdown_channel();

        let outcome = rec.run_pass(&shutdown).await.unwrap();
        assert_eq!(*rec.local().ops.lock(), vec!["create 1", "update 2", "delete 3"]);
        assert_eq!(outcome.summary, ApplySummary { created: 1, updated: 1, deleted: 1, failed: 0 });
        let after: Vec<_> = outcome.nodes.iter().map(|n| n.id).collect();
        assert_eq!(after, vec![1, 2]);

        let second = rec.run_pass(&shutdown).await.unwrap();
        assert!(second.plan.is_converged());
        assert_eq!(second.plan.to_update, ids(&[1, 2]));
    }

    #[tokio::test]
    async fn test_failed_operations_do_not_stop_the_pass() {
        let mut local = FakeLocal::with(&[2, 3]);
        local.failing.insert(1);
        let (rec, _dir) = reconciler(authority(&[1, 2]), local, false);
        let (_trigger, shutdown) = shutdown_channel();

        let outcome = rec.run_pass(&shutdown).await.unwrap();
        assert_eq!(outcome.summary.failed, 1);
        assert_eq!(outcome.summary.updated, 1);
        assert_eq!(outcome.summary.deleted, 1);
        let after: Vec<_> = outcome.nodes.iter().map(|n| n.id).collect();
        assert_eq!(after, vec![2]);
    }

    #[tokio::test]
    async fn test_authoritative_failure_aborts_before_writes() {
        let a = FakeAuthority {
            down: true,
            ..authority(&[1])
        };
        let (rec, _dir) = reconciler(a, FakeLocal::with(&[3]), false);
        let (_trigger, shutdown) = shutdown_channel();

        let err = rec.run_pass(&shutdown).await.unwrap_err();
        assert!(matches!(err, ReconcileError::AuthoritativeUnavailable(_)));
        assert!(rec.local().ops.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unchanged_nodes_are_not_rewritten() {
        let a = authority(&[1, 2]);
        let local = FakeLocal::default();
        for node in &a.nodes {
            local.nodes.lock().insert(node.id, node.clone());
        }
        let (rec, _dir) = reconciler(a, local, true);
        let (_trigger, shutdown) = shutdown_channel();

        let outcome = rec.run_pass(&shutdown).await.unwrap();
        assert_eq!(outcome.plan.unchanged, ids(&[1, 2]));
        assert!(rec.local().ops.lock().is_empty());
    }

    #[tokio::test]
    async fn test_tokens_harvested_from_detail() {
        let mut a = authority(&[1, 2]);
        a.nodes[1].report_token = Some("inline".into());
        let mut detailed = NodeRecord::new(1, "node-1");
        detailed.report_token = Some("from-detail".into());
        a.details.insert(1, detailed);

        let (rec, dir) = reconciler(a, FakeLocal::default(), false);
        let (_trigger, shutdown) = shutdown_channel();
        rec.run_pass(&shutdown).await.unwrap();

        assert_eq!(rec.tokens.report_token("node-1").as_deref(), Some("from-detail"));
        assert_eq!(rec.tokens.report_token("node-2").as_deref(), Some("inline"));
        let on_disk = crate::config::load_config(&dir.path().join("cfg.json")).await;
        assert_eq!(on_disk.report_tokens.len(), 2);
        // local copies never carry the credential
        assert!(rec.local().nodes.lock().values().all(|n| n.report_token.is_none()));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_settle() {
        let (mut rec, _dir) = reconciler(authority(&[1]), FakeLocal::default(), false);
        rec.settings.settle_delay = Duration::from_secs(60);
        let (trigger, shutdown) = shutdown_channel();
        trigger.trigger();

        let err = rec.run_pass(&shutdown).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Interrupted));
        // the apply stage still ran to completion
        assert_eq!(*rec.local().ops.lock(), vec!["create 1"]);
    }
}
