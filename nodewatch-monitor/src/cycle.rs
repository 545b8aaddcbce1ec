/**
 * CYCLE ORCHESTRATOR - Supervisor -> Reconciler -> Probe -> Reporter, forever
 *
 * ONE CYCLE:
 * 1. make sure the local management service is up (restart it if it exited)
 * 2. reconciliation pass (includes the settle wait), yields Source C
 * 3. launch one probe agent per reportable node, batch-probe them, stop them
 * 4. report every Source C node, paced by `node_delay`
 *
 * Between cycles the orchestrator sleeps `cycle_interval`; a termination signal cuts
 * that sleep short. A signal arriving mid-cycle lets the current stage finish, then all
 * supervised processes are stopped before `run` returns.
 */

use crate::api::{LocalApi, RemoteApi};
use crate::backoff;
use crate::config::{AgentConfig, ConfigStore, MonitorConfig};
use crate::models::{HealthCheckResult, NodeId, NodeRecord};
use crate::probe::{HealthChecker, ProbeTarget};
use crate::reconcile::{ReconcileError, ReconcileSettings, Reconciler};
use crate::report::{ReportTally, StatusReporter};
use crate::supervisor::{
    resolve_binary, AgentLaunch, AgentSupervisor, SupervisorError, SupervisorSettings, MANAGEMENT_SERVICE,
};
use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Sending half of the shutdown signal.
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

/// Cloneable shutdown observer.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested. Never resolves if the trigger is dropped unused.
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        let closed = rx.wait_for(|stop| *stop).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }

    /// Sleeps for `duration`. Returns false when cut short by shutdown.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.triggered() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

/// Per-node probe decision for one cycle.
#[derive(Debug, Clone)]
pub enum ProbeSlot {
    Probe {
        launch: Option<AgentLaunch>,
        target: ProbeTarget,
    },
    Skip {
        node_id: NodeId,
        reason: String,
    },
}

/// Assigns control ports `rpc_base_port + n` to the nodes that can be probed, in order.
/// Agents are supervised under the node name, so a repeated name is probed once.
/// With `probe_agents` off the agents are expected to be running already on those ports.
pub fn plan_probe_slots(nodes: &[NodeRecord], agent: &AgentConfig, program: &Path, extra_args: &[String]) -> Vec<ProbeSlot> {
    let mut next_port = Some(agent.rpc_base_port);
    let mut names = HashSet::new();
    nodes
        .iter()
        .map(|node| {
            let skip = |reason: &str| ProbeSlot::Skip {
                node_id: node.id,
                reason: reason.to_string(),
            };
            let (Some(network_name), Some(network_secret)) = (&node.network_name, &node.network_secret) else {
                return skip("no network credentials");
            };
            let Some(peer) = node.first_peer() else {
                return skip("no connections configured");
            };
            if node.name == MANAGEMENT_SERVICE {
                return skip("node name collides with the management service");
            }
            if !names.insert(node.name.as_str()) {
                return skip("duplicate node name");
            }
            let Some(port) = next_port else {
                return skip("no control port left");
            };
            next_port = port.checked_add(1);

            let launch = agent.probe_agents.then(|| {
                AgentLaunch::overlay_peer(
                    &node.name,
                    program.to_path_buf(),
                    (network_name.as_str(), network_secret.as_str()),
                    &peer,
                    &agent.rpc_host,
                    port,
                    extra_args,
                )
            });
            ProbeSlot::Probe {
                launch,
                target: ProbeTarget {
                    node_id: node.id,
                    host: agent.rpc_host.clone(),
                    port,
                },
            }
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub reconciled: bool,
    pub nodes: usize,
    pub online: usize,
    pub reported: ReportTally,
}

pub struct CycleOrchestrator {
    config: MonitorConfig,
    supervisor: AgentSupervisor,
    local: LocalApi,
    reconciler: Reconciler<RemoteApi, LocalApi>,
    checker: HealthChecker,
    reporter: StatusReporter,
}

impl CycleOrchestrator {
    /// `config` is the effective configuration (file + command line); `tokens` is the
    /// persisted store the reconciler writes report tokens into.
    pub fn new(api_url: &str, jwt_token: &str, config: MonitorConfig, tokens: ConfigStore) -> Result<Self> {
        let timeout = config.connection_timeout();
        let backoff_unit = Duration::from_secs(1);

        let remote = RemoteApi::new(api_url, jwt_token, timeout)
            .context("invalid remote API settings")?
            .with_retries(config.max_retries, backoff_unit);
        let local = LocalApi::new(&config.local_api, timeout).context("invalid local API settings")?;
        let reconciler = Reconciler::new(
            remote,
            local.clone(),
            tokens.clone(),
            ReconcileSettings {
                settle_delay: config.settle_delay(),
                skip_unchanged_updates: config.skip_unchanged_updates,
            },
        );
        let checker = HealthChecker::new(timeout)
            .with_framing(config.rpc_framing)
            .with_concurrency(config.probe_concurrency);
        let reporter = StatusReporter::new(api_url, tokens, timeout)
            .context("invalid report endpoint")?
            .with_retries(config.max_retries, backoff_unit)
            .with_node_delay(config.node_delay());
        let supervisor = AgentSupervisor::new(SupervisorSettings {
            startup_timeout: config.agent.startup_timeout(),
            poll_interval: Duration::from_secs(1),
            grace_period: config.agent.grace_period(),
        });

        info!(
            retries = ?backoff::schedule(config.max_retries, backoff_unit),
            framing = ?config.rpc_framing,
            "orchestrator ready"
        );
        Ok(Self {
            config,
            supervisor,
            local,
            reconciler,
            checker,
            reporter,
        })
    }

    /// Runs cycles until shutdown (or once). Fails only when the management service
    /// cannot be brought up at startup.
    pub async fn run(&self, shutdown: Shutdown, once: bool) -> Result<()> {
        if self.config.agent.launch_service {
            self.ensure_service()
                .await
                .context("cannot start the local management service")?;
        }

        let mut cycle: u64 = 0;
        loop {
            cycle += 1;
            info!(cycle, "cycle start");
            let summary = self.run_cycle(&shutdown).await;
            info!(
                cycle,
                reconciled = summary.reconciled,
                nodes = summary.nodes,
                online = summary.online,
                reported = summary.reported.succeeded,
                report_failures = summary.reported.failed,
                "cycle done"
            );

            if once || shutdown.is_triggered() {
                break;
            }
            let interval = self.config.cycle_interval();
            info!(next_in = ?interval, "sleeping until next cycle");
            if !shutdown.sleep(interval).await {
                break;
            }
        }

        for agent in self.supervisor.list().await {
            debug!(agent = %agent.name, pid = ?agent.pid, rpc_port = ?agent.rpc_port, started_at = %agent.started_at, "stopping");
        }
        self.supervisor.stop_all().await;
        Ok(())
    }

    async fn ensure_service(&self) -> Result<(), SupervisorError> {
        if self.supervisor.is_running(MANAGEMENT_SERVICE).await || self.local.health().await {
            return Ok(());
        }
        let program = resolve_binary(&self.config.agent.bin_dir, &self.config.agent.service_binary);
        info!(program = %program.display(), "starting local management service");
        self.supervisor
            .start(AgentLaunch::management_service(program, self.local.health_url()))
            .await
            .map(|_| ())
    }

    pub async fn run_cycle(&self, shutdown: &Shutdown) -> CycleSummary {
        let mut summary = CycleSummary::default();

        if self.config.agent.launch_service {
            if let Err(e) = self.ensure_service().await {
                error!(error = %e, "management service is down and could not be restarted");
            }
        }

        let outcome = match self.reconciler.run_pass(shutdown).await {
            Ok(outcome) => outcome,
            Err(ReconcileError::Interrupted) => {
                info!("reconciliation interrupted by shutdown");
                return summary;
            }
            Err(e) => {
                error!(error = %e, "reconciliation aborted, skipping this cycle");
                return summary;
            }
        };
        summary.reconciled = true;
        summary.nodes = outcome.nodes.len();

        let results = self.probe_nodes(&outcome.nodes).await;
        summary.online = results.iter().filter(|r| r.is_online).count();

        let items: Vec<(NodeRecord, HealthCheckResult)> = outcome.nodes.into_iter().zip(results).collect();
        summary.reported = self.reporter.report_all(&items, shutdown).await;
        summary
    }

    /// One result per node, in node order.
    async fn probe_nodes(&self, nodes: &[NodeRecord]) -> Vec<HealthCheckResult> {
        let agent = &self.config.agent;
        let extra_args = agent.extra_args().unwrap_or_else(|e| {
            warn!(error = %e, "ignoring agent extra_args");
            Vec::new()
        });
        let program = resolve_binary(&agent.bin_dir, &agent.core_binary);
        let slots = plan_probe_slots(nodes, agent, &program, &extra_args);

        let launches: Vec<AgentLaunch> = slots
            .iter()
            .filter_map(|slot| match slot {
                ProbeSlot::Probe { launch: Some(launch), .. } => Some(launch.clone()),
                _ => None,
            })
            .collect();
        let started: HashMap<String, Result<(), String>> = stream::iter(launches)
            .map(|launch| async move {
                let name = launch.name.clone();
                let outcome = self.supervisor.start(launch).await.map(|_| ()).map_err(|e| e.to_string());
                (name, outcome)
            })
            .buffer_unordered(self.config.probe_concurrency.max(1))
            .collect()
            .await;

        let mut results: Vec<Option<HealthCheckResult>> = vec![None; slots.len()];
        let mut targets = Vec::new();
        let mut positions = Vec::new();
        for (i, slot) in slots.iter().enumerate() {
            match slot {
                ProbeSlot::Skip { node_id, reason } => {
                    warn!(node_id, reason = %reason, "node not probed");
                    results[i] = Some(HealthCheckResult::offline(*node_id, 0, reason.clone()));
                }
                ProbeSlot::Probe { launch, target } => {
                    let failed = launch
                        .as_ref()
                        .and_then(|l| started.get(&l.name))
                        .and_then(|outcome| outcome.as_ref().err());
                    match failed {
                        Some(e) => {
                            results[i] = Some(HealthCheckResult::offline(
                                target.node_id,
                                0,
                                format!("probe agent failed to start: {e}"),
                            ));
                        }
                        None => {
                            targets.push(target.clone());
                            positions.push(i);
                        }
                    }
                }
            }
        }

        let probed = self.checker.check_many(targets).await;
        for (i, result) in positions.into_iter().zip(probed) {
            results[i] = Some(result);
        }

        futures::future::join_all(started.keys().map(|name| self.supervisor.stop(name))).await;

        results
            .into_iter()
            .zip(nodes)
            .map(|(result, node)| result.unwrap_or_else(|| HealthCheckResult::offline(node.id, 0, "not probed")))
            .collect()
    }
}
