//! Shared fixtures: an in-process control plane and temp databases.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tempfile::TempDir;

use meshtest::controlplane::{
    ControlPlane, ControlPlaneError, Link, LinkType, Node, Topology, TrafficRequest,
};
use meshtest::scheduler::Scheduler;
use meshtest::storage::{self, Pool};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Topology(String),
    Start { network: String, src: String, dst: String },
    Stop { network: String, session_id: String },
    ListActive(String),
}

/// Control plane double. Started sessions stay active until stopped or
/// `finish_all` is called, unless `expire_sessions` makes them end
/// `timeSec` after they start.
#[derive(Default)]
pub struct MockControlPlane {
    networks: Vec<String>,
    topologies: Mutex<HashMap<String, Topology>>,
    active: Mutex<HashMap<String, BTreeSet<String>>>,
    expiry: Mutex<HashMap<String, Instant>>,
    expire_sessions: AtomicBool,
    start_latency: Mutex<Duration>,
    calls: Mutex<Vec<Call>>,
    output: Mutex<Option<String>>,
    next_session: AtomicU64,
    fail_starts: AtomicBool,
    fail_stops: AtomicBool,
    fail_list: AtomicBool,
}

impl MockControlPlane {
    pub fn new(networks: &[&str]) -> Self {
        Self {
            networks: networks.iter().map(|n| n.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn with_topology(self, topology: Topology) -> Self {
        self.topologies
            .lock()
            .unwrap()
            .insert(topology.name.clone(), topology);
        self
    }

    pub fn fail_starts(&self, fail: bool) {
        self.fail_starts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_stops(&self, fail: bool) {
        self.fail_stops.store(fail, Ordering::SeqCst);
    }

    pub fn fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    /// End each session on its own once its `timeSec` has elapsed.
    pub fn expire_sessions(&self, expire: bool) {
        self.expire_sessions.store(expire, Ordering::SeqCst);
    }

    /// Delay every `start_traffic` response.
    pub fn set_start_latency(&self, latency: Duration) {
        *self.start_latency.lock().unwrap() = latency;
    }

    pub fn set_output(&self, output: &str) {
        *self.output.lock().unwrap() = Some(output.to_string());
    }

    /// Pretend a session was left running by a previous process.
    pub fn add_active(&self, network: &str, session_id: &str) {
        self.active
            .lock()
            .unwrap()
            .entry(network.to_string())
            .or_default()
            .insert(session_id.to_string());
    }

    /// Mark every live session as completed on its own.
    pub fn finish_all(&self) {
        self.active.lock().unwrap().clear();
    }

    pub fn active_count(&self, network: &str) -> usize {
        self.active
            .lock()
            .unwrap()
            .get(network)
            .map_or(0, |ids| ids.len())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn start_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Start { .. }))
            .count()
    }

    pub fn stop_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Stop { .. }))
            .count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ControlPlane for MockControlPlane {
    fn networks(&self) -> Vec<String> {
        self.networks.clone()
    }

    async fn get_topology(&self, network_name: &str) -> Result<Topology, ControlPlaneError> {
        self.record(Call::Topology(network_name.to_string()));
        self.topologies
            .lock()
            .unwrap()
            .get(network_name)
            .cloned()
            .ok_or_else(|| ControlPlaneError::UnknownNetwork(network_name.to_string()))
    }

    async fn start_traffic(
        &self,
        network_name: &str,
        request: &TrafficRequest,
    ) -> Result<String, ControlPlaneError> {
        self.record(Call::Start {
            network: network_name.to_string(),
            src: request.src_node_id.clone(),
            dst: request.dst_node_id.clone(),
        });
        if self.fail_starts.load(Ordering::SeqCst) {
            return Err(ControlPlaneError::Rejected {
                method: "startTraffic".to_string(),
                message: "generator unavailable".to_string(),
            });
        }

        let latency = *self.start_latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let id = format!("session-{}", self.next_session.fetch_add(1, Ordering::SeqCst) + 1);
        self.add_active(network_name, &id);
        if self.expire_sessions.load(Ordering::SeqCst) {
            let lifetime = Duration::from_secs(request.options.time_sec.unwrap_or(0));
            self.expiry
                .lock()
                .unwrap()
                .insert(id.clone(), Instant::now() + lifetime);
        }
        Ok(id)
    }

    async fn stop_traffic(
        &self,
        network_name: &str,
        session_id: &str,
    ) -> Result<(), ControlPlaneError> {
        self.record(Call::Stop {
            network: network_name.to_string(),
            session_id: session_id.to_string(),
        });
        if self.fail_stops.load(Ordering::SeqCst) {
            return Err(ControlPlaneError::Rejected {
                method: "stopTraffic".to_string(),
                message: "refused".to_string(),
            });
        }

        if let Some(ids) = self.active.lock().unwrap().get_mut(network_name) {
            ids.remove(session_id);
        }
        Ok(())
    }

    async fn list_active_sessions(
        &self,
        network_name: &str,
    ) -> Result<Vec<String>, ControlPlaneError> {
        self.record(Call::ListActive(network_name.to_string()));
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(ControlPlaneError::Rejected {
                method: "statusTraffic".to_string(),
                message: "unavailable".to_string(),
            });
        }

        let now = Instant::now();
        let expiry = self.expiry.lock().unwrap();
        let mut active = self.active.lock().unwrap();
        let Some(ids) = active.get_mut(network_name) else {
            return Ok(Vec::new());
        };
        ids.retain(|id| expiry.get(id).map_or(true, |at| *at > now));
        Ok(ids.iter().cloned().collect())
    }

    async fn traffic_output(
        &self,
        _network_name: &str,
        _session_id: &str,
    ) -> Result<Option<String>, ControlPlaneError> {
        Ok(self.output.lock().unwrap().clone())
    }
}

pub fn node(name: &str, pop_node: bool) -> Node {
    Node {
        name: name.to_string(),
        mac_addr: format!("00:00:00:00:00:{}", name),
        pop_node,
    }
}

pub fn wireless(a: &str, z: &str) -> Link {
    Link {
        name: format!("link-{}-{}", a, z),
        a_node_name: a.to_string(),
        z_node_name: z.to_string(),
        a_node_mac: format!("00:00:00:00:00:{}", a),
        z_node_mac: format!("00:00:00:00:00:{}", z),
        link_type: LinkType::Wireless,
    }
}

/// `pop - n1 - n2 - n3`: three wireless links, three non-POP nodes.
pub fn chain_topology(name: &str) -> Topology {
    Topology {
        name: name.to_string(),
        nodes: vec![
            node("pop", true),
            node("n1", false),
            node("n2", false),
            node("n3", false),
        ],
        links: vec![wireless("pop", "n1"), wireless("n1", "n2"), wireless("n2", "n3")],
    }
}

pub fn temp_pool() -> (TempDir, Pool) {
    let dir = tempfile::tempdir().unwrap();
    let pool = storage::open_pool(dir.path().join("meshtest.db")).unwrap();
    (dir, pool)
}

pub fn scheduler_with(control_plane: Arc<MockControlPlane>) -> (TempDir, Scheduler) {
    let (dir, pool) = temp_pool();
    (dir, Scheduler::new(pool, control_plane))
}

pub const IPERF_UDP_OUTPUT: &str = r#"{
    "intervals": [
        {"sum": {"bits_per_second": 90000000.0}},
        {"sum": {"bits_per_second": 110000000.0}}
    ],
    "end": {
        "sum": {"bits_per_second": 100000000.0, "jitter_ms": 0.5, "lost_percent": 1.5}
    }
}"#;
