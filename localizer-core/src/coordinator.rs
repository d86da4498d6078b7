//! Owns lifecycle, threads, per-tag state, and the latest-position slot that external
//! consumers read.
//!
//! Threading model: one ingest thread pulling off the message bus, one tick thread
//! driving the solve loop — `std::thread::spawn`, not `tokio::spawn`, so the CPU-bound
//! solver never shares a runtime with anything else. The binner buffer and each tag's
//! latest-position slot are independently `std::sync::Mutex`-guarded; anchor geometry is
//! immutable and needs no lock at all.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use uwb_types::{Node, PositionBroadcast, TagId, Timestamp, Vec3};

use crate::anchor_geometry::AnchorGeometry;
use crate::binner::Binner;
use crate::bus::MessageBus;
use crate::config::{AppConfig, BinnerConfig};
use crate::edge_builder::{self, build_edges};
use crate::error::SolveError;
use crate::ingest::{self, IngestCounters};
use crate::pgo_solver::{self, gauge_fix};

const RECONNECT_BACKOFF_INITIAL_MS: u64 = 50;
const RECONNECT_BACKOFF_MAX_MS: u64 = 5_000;

/// The most recent successful solve for one tag, plus enough context to judge its
/// quality and staleness.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TagPosition {
    pub position: Vec3,
    pub timestamp: Timestamp,
    pub residual: f64,
    pub converged: bool,
    pub n_anchor_edges_used: usize,
    pub bin_start: Timestamp,
    pub bin_end: Timestamp,
}

pub struct Coordinator {
    geometry: Arc<AnchorGeometry>,
    binner_config: BinnerConfig,
    iteration_cap: usize,
    tick_seconds: f64,
    default_tag: TagId,
    bus: Arc<dyn MessageBus>,
    binners: Mutex<HashMap<TagId, Arc<Binner>>>,
    latest: Mutex<HashMap<TagId, Arc<Mutex<Option<TagPosition>>>>>,
    pub ingest_counters: Arc<IngestCounters>,
    shutdown: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(geometry: Arc<AnchorGeometry>, config: &AppConfig, bus: Arc<dyn MessageBus>) -> Arc<Self> {
        Arc::new(Self {
            geometry,
            binner_config: config.binner,
            iteration_cap: config.solver.iteration_cap,
            tick_seconds: config.coordinator.tick_seconds,
            default_tag: TagId(0),
            bus,
            binners: Mutex::new(HashMap::new()),
            latest: Mutex::new(HashMap::new()),
            ingest_counters: Arc::new(IngestCounters::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Bring up the ingest and solver-tick loops as dedicated OS threads.
    pub fn start(self: &Arc<Self>) {
        let ingest_handle = {
            let this = Arc::clone(self);
            std::thread::spawn(move || this.run_ingest_loop())
        };
        let tick_handle = {
            let this = Arc::clone(self);
            std::thread::spawn(move || this.run_tick_loop())
        };
        let mut threads = self.threads.lock().expect("threads mutex poisoned");
        threads.push(ingest_handle);
        threads.push(tick_handle);
    }

    /// Signal both loops to quiesce and join them. In-flight solves run to completion —
    /// the iteration cap already bounds how long that can take.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let mut threads = self.threads.lock().expect("threads mutex poisoned");
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }

    pub fn latest_position(&self, tag: TagId) -> Option<TagPosition> {
        let latest = self.latest.lock().expect("latest-position map mutex poisoned");
        let slot = latest.get(&tag)?;
        *slot.lock().expect("latest-position slot mutex poisoned")
    }

    fn binner_for(&self, tag: TagId) -> Arc<Binner> {
        let mut binners = self.binners.lock().expect("binner map mutex poisoned");
        Arc::clone(
            binners
                .entry(tag)
                .or_insert_with(|| Arc::new(Binner::new(tag, self.binner_config))),
        )
    }

    fn latest_slot_for(&self, tag: TagId) -> Arc<Mutex<Option<TagPosition>>> {
        let mut latest = self.latest.lock().expect("latest-position map mutex poisoned");
        Arc::clone(latest.entry(tag).or_insert_with(|| Arc::new(Mutex::new(None))))
    }

    fn run_ingest_loop(&self) {
        let mut backoff_ms = RECONNECT_BACKOFF_INITIAL_MS;
        while !self.shutdown.load(Ordering::SeqCst) {
            match self.bus.recv_anchor_payload() {
                Ok(report) => {
                    backoff_ms = RECONNECT_BACKOFF_INITIAL_MS;
                    let tag = self.default_tag;
                    match ingest::validate_and_build(report.anchor_id, tag, report.payload, &self.geometry) {
                        Ok(measurement) => {
                            let binner = self.binner_for(tag);
                            if let Err(rejection) = binner.insert(measurement) {
                                tracing::debug!(tag = %tag, anchor = report.anchor_id, ?rejection, "measurement rejected by binner");
                            }
                        }
                        Err(err) => {
                            self.ingest_counters.record(&err);
                            tracing::debug!(anchor = report.anchor_id, %err, "measurement rejected at ingest");
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, backoff_ms, "bus transport error, reconnecting with backoff");
                    std::thread::sleep(Duration::from_millis(backoff_ms));
                    backoff_ms = (backoff_ms * 2).min(RECONNECT_BACKOFF_MAX_MS);
                }
            }
        }
    }

    fn run_tick_loop(&self) {
        let period = Duration::from_secs_f64(self.tick_seconds.max(0.001));
        while !self.shutdown.load(Ordering::SeqCst) {
            std::thread::sleep(period);
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let tags: Vec<TagId> = {
                let binners = self.binners.lock().expect("binner map mutex poisoned");
                binners.keys().copied().collect()
            };
            for tag in tags {
                self.run_one_tick(tag);
            }
        }
    }

    fn run_one_tick(&self, tag: TagId) {
        let start = std::time::Instant::now();
        let binner = self.binner_for(tag);
        let Some(bin) = binner.emit_bin() else { return };

        let bin_size_per_anchor: HashMap<u8, usize> =
            bin.per_anchor.iter().map(|(id, v)| (id.0, v.len())).collect();

        let edges = build_edges(&bin, &self.geometry);
        let n_anchor_edges_used = edge_builder::anchor_tag_edge_count(&edges);

        let slot = self.latest_slot_for(tag);
        let current = *slot.lock().expect("latest-position slot mutex poisoned");
        let warm_start = current.map(|p| p.position);

        let wall_time_ms = || start.elapsed().as_secs_f64() * 1000.0;

        match pgo_solver::solve(&edges, &self.geometry, tag, warm_start, self.iteration_cap) {
            Ok(out) if out.converged => {
                let fixed = gauge_fix(&out, &self.geometry);
                let Some(tag_pos) = fixed.node_positions.get(&Node::Tag(tag)).copied() else { return };

                let new_state = TagPosition {
                    position: tag_pos,
                    timestamp: bin.end_ts,
                    residual: fixed.residual_norm,
                    converged: true,
                    n_anchor_edges_used,
                    bin_start: bin.start_ts,
                    bin_end: bin.end_ts,
                };
                *slot.lock().expect("latest-position slot mutex poisoned") = Some(new_state);

                tracing::info!(
                    tag = %tag,
                    ?bin_size_per_anchor,
                    rejections = ?binner.counters.snapshot(),
                    solve_iterations = fixed.iterations,
                    residual = fixed.residual_norm,
                    n_anchor_edges_used,
                    wall_time_ms = wall_time_ms(),
                    "solve tick"
                );

                self.bus.publish_position(
                    tag,
                    &PositionBroadcast {
                        t_unix_ns: (new_state.timestamp.seconds() * 1e9) as u64,
                        position_global: tag_pos,
                        residual: fixed.residual_norm,
                        converged: true,
                        n_anchor_edges_used: n_anchor_edges_used as u32,
                    },
                );
            }
            Ok(out) => {
                tracing::warn!(
                    tag = %tag,
                    solve_iterations = out.iterations,
                    residual = out.residual_norm,
                    wall_time_ms = wall_time_ms(),
                    "solver did not converge, keeping previous position"
                );
            }
            Err(SolveError::Underconstrained) => {
                tracing::debug!(tag = %tag, "skipping tick: no anchor-tag edges and no warm start");
            }
            Err(SolveError::NumericFailure) => {
                tracing::warn!(tag = %tag, "numeric failure during solve, skipping tick");
            }
            Err(SolveError::NonConvergence) => {
                tracing::warn!(tag = %tag, "solver failed to take a valid step, keeping previous position");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AnchorEntry, AnchorsConfig, AppConfig, BusConfig, CoordinatorConfig, SolverConfig};
    use crate::error::IngestError;
    use std::sync::Mutex as StdMutex;
    use uwb_types::AnchorVectorPayload;

    struct ScriptedBus {
        reports: StdMutex<Vec<crate::bus::RawAnchorReport>>,
        published: StdMutex<Vec<PositionBroadcast>>,
    }

    impl MessageBus for ScriptedBus {
        fn recv_anchor_payload(&self) -> Result<crate::bus::RawAnchorReport, IngestError> {
            let mut reports = self.reports.lock().unwrap();
            if reports.is_empty() {
                std::thread::sleep(Duration::from_millis(20));
                return Err(IngestError::TransportError("no more scripted reports".into()));
            }
            Ok(reports.remove(0))
        }

        fn publish_position(&self, _tag_id: TagId, broadcast: &PositionBroadcast) {
            self.published.lock().unwrap().push(broadcast.clone());
        }
    }

    fn test_config() -> AppConfig {
        AppConfig {
            bus: BusConfig::default(),
            anchors: AnchorsConfig {
                entries: vec![
                    AnchorEntry { id: 0, position: [0.0, 0.0, 0.0], yaw_deg: 0.0, tilt_deg: 0.0 },
                    AnchorEntry { id: 1, position: [480.0, 0.0, 0.0], yaw_deg: 0.0, tilt_deg: 0.0 },
                    AnchorEntry { id: 2, position: [480.0, 600.0, 0.0], yaw_deg: 0.0, tilt_deg: 0.0 },
                    AnchorEntry { id: 3, position: [0.0, 600.0, 0.0], yaw_deg: 0.0, tilt_deg: 0.0 },
                ],
            },
            binner: BinnerConfig {
                window_seconds: 5.0,
                outlier_sigma: 2.0,
                min_samples_for_outlier_check: 5,
                max_anchor_variance: 10_000.0,
            },
            solver: SolverConfig { iteration_cap: 200 },
            coordinator: CoordinatorConfig { tick_seconds: 0.05 },
        }
    }

    #[test]
    fn full_pipeline_converges_to_known_tag_position() {
        let cfg = test_config();
        let geometry = Arc::new(AnchorGeometry::from_config(&cfg.anchors).unwrap());
        let tag_true = Vec3::new(240.0, 300.0, 100.0);

        let mut reports = Vec::new();
        for entry in &cfg.anchors.entries {
            let anchor_pos = Vec3::new(entry.position[0], entry.position[1], entry.position[2]);
            reports.push(crate::bus::RawAnchorReport {
                anchor_id: entry.id,
                payload: AnchorVectorPayload { t_unix_ns: 1_000_000_000, vector_local: tag_true - anchor_pos },
            });
        }

        let bus = Arc::new(ScriptedBus { reports: StdMutex::new(reports), published: StdMutex::new(Vec::new()) });
        let coordinator = Coordinator::new(geometry, &cfg, bus);
        coordinator.start();

        std::thread::sleep(Duration::from_millis(300));
        coordinator.stop();

        let position = coordinator.latest_position(TagId(0)).expect("expected a solved position");
        assert!((position.position - tag_true).norm() < 1e-3);
        assert!(position.converged);
    }
}
