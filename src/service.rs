use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use rustc_hash::FxHashMap;

use crate::control::{MetricUse, MetricUseAggregator, ServiceControl};
use crate::error::{Result, ServiceError};
use crate::intro::MetricId;
use crate::present::FrameData;
use crate::telemetry::{DataStores, StaticMetricValue};
use crate::timebase::TimeBase;

/// Cadence of the output pass when no event wakeup arrives.
const OUTPUT_PASS_PERIOD_MS: u64 = 100;
/// Grace period after an event wakeup before the batch is ordered.
const EVENT_SETTLE_MS: u64 = 10;

pub const DEFAULT_FRAME_RING_CAPACITY: usize = 8192;
pub const DEFAULT_TELEMETRY_PERIOD_MS: u32 = 16;

/// Raw events handed from the trace consumer thread to the output thread.
#[derive(Debug, Clone)]
pub enum TraceEvent {
    Present(Box<FrameData>),
    ProcessStart {
        pid: u32,
        timestamp: u64,
        name: String,
    },
    ProcessStop {
        pid: u32,
        timestamp: u64,
    },
}

impl TraceEvent {
    fn timestamp(&self) -> u64 {
        match self {
            TraceEvent::Present(p) => p.present_start_time,
            TraceEvent::ProcessStart { timestamp, .. } => *timestamp,
            TraceEvent::ProcessStop { timestamp, .. } => *timestamp,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub frequency: u64,
    pub session_start_qpc: u64,
    pub frame_ring_capacity: usize,
    pub store_prefix: String,
    pub store_salt: u32,
    pub is_playback: bool,
}

impl ServiceConfig {
    pub fn new(frequency: u64, session_start_qpc: u64) -> Self {
        Self {
            frequency,
            session_start_qpc,
            frame_ring_capacity: DEFAULT_FRAME_RING_CAPACITY,
            store_prefix: "framemon".to_string(),
            store_salt: 0,
            is_playback: false,
        }
    }
}

#[derive(Debug)]
struct TrackedProcess {
    ref_count: usize,
    terminated: bool,
}

#[derive(Debug, Default)]
struct EtlLogging {
    next_handle: u32,
    active: FxHashMap<u32, String>,
}

/// Warn throttle for per-event anomalies in the hot loop.
struct EveryN {
    period: u64,
    count: u64,
}

impl EveryN {
    fn new(period: u64) -> Self {
        Self { period, count: 0 }
    }

    fn hit(&mut self) -> bool {
        let fire = self.count % self.period == 0;
        self.count += 1;
        fire
    }
}

struct ServiceShared {
    config: ServiceConfig,
    time_base: TimeBase,
    stores: Arc<RwLock<DataStores>>,
    quit: AtomicBool,
    playback_stopped: AtomicBool,
    telemetry_period_ms: AtomicU32,
    etw_flush_period_ms: Mutex<Option<u32>>,
    tracked: Mutex<FxHashMap<u32, TrackedProcess>>,
    metric_use: Mutex<MetricUseAggregator>,
    etl: Mutex<EtlLogging>,
}

/// The service host: receives raw trace events from the consumer thread,
/// normalizes them into per-process frame rings on the output thread, and
/// carries the tracking/telemetry bookkeeping the control channel operates
/// on.
pub struct Service {
    shared: Arc<ServiceShared>,
    event_tx: Sender<TraceEvent>,
    output_thread: Option<JoinHandle<()>>,
}

impl Service {
    pub fn start(config: ServiceConfig) -> Self {
        let time_base = TimeBase::with_session_start(config.frequency, config.session_start_qpc);
        let shared = Arc::new(ServiceShared {
            time_base,
            stores: Arc::new(RwLock::new(DataStores::new())),
            quit: AtomicBool::new(false),
            playback_stopped: AtomicBool::new(false),
            telemetry_period_ms: AtomicU32::new(DEFAULT_TELEMETRY_PERIOD_MS),
            etw_flush_period_ms: Mutex::new(None),
            tracked: Mutex::new(FxHashMap::default()),
            metric_use: Mutex::new(MetricUseAggregator::default()),
            etl: Mutex::new(EtlLogging::default()),
            config,
        });

        // The consumer thread is the producer end of this channel; it stays
        // lock-free from the output thread's point of view.
        let (event_tx, event_rx) = crossbeam_channel::unbounded();

        let thread_shared = shared.clone();
        let output_thread = std::thread::Builder::new()
            .name("framemon-output".to_string())
            .spawn(move || run_output_thread(thread_shared, event_rx))
            .expect("failed to spawn output thread");

        Self {
            shared,
            event_tx,
            output_thread: Some(output_thread),
        }
    }

    /// Producer handle for the trace consumer thread.
    pub fn event_sender(&self) -> Sender<TraceEvent> {
        self.event_tx.clone()
    }

    pub fn stores(&self) -> Arc<RwLock<DataStores>> {
        self.shared.stores.clone()
    }

    pub fn time_base(&self) -> TimeBase {
        self.shared.time_base
    }

    pub fn telemetry_period_ms(&self) -> u32 {
        self.shared.telemetry_period_ms.load(Ordering::Relaxed)
    }

    pub fn etw_flush_period_ms(&self) -> Option<u32> {
        *self
            .shared
            .etw_flush_period_ms
            .lock()
            .expect("flush period lock poisoned")
    }

    pub fn playback_stopped(&self) -> bool {
        self.shared.playback_stopped.load(Ordering::Relaxed)
    }

    /// Whether any client declared use of a metric on the device; telemetry
    /// producers skip collection otherwise.
    pub fn telemetry_wanted(&self, device_id: u32) -> bool {
        self.shared
            .metric_use
            .lock()
            .expect("metric use lock poisoned")
            .device_has_uses(device_id)
    }

    pub fn is_use_declared(&self, metric: MetricId, device_id: u32, array_index: u32) -> bool {
        self.shared
            .metric_use
            .lock()
            .expect("metric use lock poisoned")
            .is_used(&MetricUse {
                metric,
                device_id,
                array_index,
            })
    }

    /// Flags the output thread to finish its pass and exit, then joins it.
    pub fn shutdown(&mut self) {
        self.shared.quit.store(true, Ordering::Relaxed);
        if let Some(handle) = self.output_thread.take() {
            // Wake the output thread if it is parked in recv_timeout.
            let _ = self.event_tx.send(TraceEvent::ProcessStop {
                pid: 0,
                timestamp: u64::MAX,
            });
            if handle.join().is_err() {
                log::error!("output thread panicked during shutdown");
            }
        }
    }

    fn do_start_tracking(&self, pid: u32, backpressured: bool) -> Result<()> {
        if pid == 0 {
            return Err(ServiceError::InvalidPid(pid));
        }
        let mut tracked = self.shared.tracked.lock().expect("tracked lock poisoned");
        if let Some(entry) = tracked.get_mut(&pid) {
            entry.ref_count += 1;
            return Ok(());
        }
        self.shared
            .stores
            .write()
            .map_err(|_| ServiceError::Service("store lock poisoned".to_string()))?
            .open_process_store(
                pid,
                self.shared.config.frame_ring_capacity,
                self.shared.config.session_start_qpc,
                backpressured,
            );
        tracked.insert(
            pid,
            TrackedProcess {
                ref_count: 1,
                terminated: false,
            },
        );
        log::info!("started tracking pid {pid}");
        Ok(())
    }

    fn do_stop_tracking(&self, pid: u32) -> Result<()> {
        let mut tracked = self.shared.tracked.lock().expect("tracked lock poisoned");
        let Some(entry) = tracked.get_mut(&pid) else {
            return Err(ServiceError::InvalidPid(pid));
        };
        entry.ref_count -= 1;
        if entry.ref_count == 0 {
            tracked.remove(&pid);
            self.shared
                .stores
                .write()
                .map_err(|_| ServiceError::Service("store lock poisoned".to_string()))?
                .close_process_store(pid);
            log::info!("stopped tracking pid {pid}");
        }
        Ok(())
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ServiceControl for Arc<Service> {
    fn is_playback(&self) -> bool {
        self.shared.config.is_playback
    }

    fn store_identity(&self) -> (String, u32) {
        (
            self.shared.config.store_prefix.clone(),
            self.shared.config.store_salt,
        )
    }

    fn start_tracking(&self, pid: u32, _is_playback: bool, is_backpressured: bool) -> Result<()> {
        self.do_start_tracking(pid, is_backpressured)
    }

    fn stop_tracking(&self, pid: u32) -> Result<()> {
        self.do_stop_tracking(pid)
    }

    fn set_telemetry_period(&self, period_ms: u32) {
        self.shared
            .telemetry_period_ms
            .store(period_ms, Ordering::Relaxed);
    }

    fn set_etw_flush_period(&self, period_ms: Option<u32>) {
        *self
            .shared
            .etw_flush_period_ms
            .lock()
            .expect("flush period lock poisoned") = period_ms;
    }

    fn publish_metric_use(&self, uses: &[MetricUse]) {
        self.shared
            .metric_use
            .lock()
            .expect("metric use lock poisoned")
            .publish(uses);
    }

    fn retract_metric_use(&self, uses: &[MetricUse]) {
        self.shared
            .metric_use
            .lock()
            .expect("metric use lock poisoned")
            .retract(uses);
    }

    fn start_etl_logging(&self) -> Result<u32> {
        let mut etl = self.shared.etl.lock().expect("etl lock poisoned");
        etl.next_handle += 1;
        let handle = etl.next_handle;
        let path = format!(
            "{}-{:08x}-{handle}.etl",
            self.shared.config.store_prefix, self.shared.config.store_salt
        );
        etl.active.insert(handle, path);
        Ok(handle)
    }

    fn finish_etl_logging(&self, handle: u32) -> Result<String> {
        let mut etl = self.shared.etl.lock().expect("etl lock poisoned");
        etl.active
            .remove(&handle)
            .ok_or_else(|| ServiceError::InvalidEtlFile(format!("no active log {handle}")))
    }

    fn stop_playback(&self) -> Result<()> {
        if !self.shared.config.is_playback {
            return Err(ServiceError::ModeMismatch);
        }
        self.shared.playback_stopped.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// The output pass: drain queued events in timestamp order, publish presents
/// into per-process rings, and resolve deferred process terminations.
fn run_output_thread(shared: Arc<ServiceShared>, event_rx: Receiver<TraceEvent>) {
    let mut batch: Vec<TraceEvent> = Vec::new();
    let mut pending_terminations: Vec<(u32, u64)> = Vec::new();
    let mut drop_warn = EveryN::new(64);

    loop {
        if shared.quit.load(Ordering::Relaxed) {
            break;
        }

        // Park until events are ready or the pass timer fires, whichever
        // comes first.
        match event_rx.recv_timeout(Duration::from_millis(OUTPUT_PASS_PERIOD_MS)) {
            Ok(event) => {
                batch.push(event);
                // Let the consumer finish its burst so the pass sees a
                // contiguous batch to order.
                std::thread::sleep(Duration::from_millis(EVENT_SETTLE_MS));
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        while let Ok(event) = event_rx.try_recv() {
            batch.push(event);
        }

        process_batch(
            &shared,
            &mut batch,
            &mut pending_terminations,
            &mut drop_warn,
        );
    }

    // Final flush so presents queued before shutdown still land.
    while let Ok(event) = event_rx.try_recv() {
        batch.push(event);
    }
    process_batch(
        &shared,
        &mut batch,
        &mut pending_terminations,
        &mut drop_warn,
    );
}

fn process_batch(
    shared: &ServiceShared,
    batch: &mut Vec<TraceEvent>,
    pending_terminations: &mut Vec<(u32, u64)>,
    drop_warn: &mut EveryN,
) {
    if batch.is_empty() {
        return;
    }
    // Events from different providers arrive interleaved; a stable sort puts
    // them back on the global timeline.
    batch.sort_by_key(TraceEvent::timestamp);

    for event in batch.drain(..) {
        match event {
            TraceEvent::Present(present) => {
                // A termination is final only once a present newer than it
                // proves the terminated process's outstanding work drained.
                if !pending_terminations.is_empty() {
                    let now = present.present_start_time;
                    let (ready, keep): (Vec<_>, Vec<_>) = pending_terminations
                        .drain(..)
                        .partition(|&(_, term_ts)| term_ts < now);
                    *pending_terminations = keep;
                    for (pid, _) in ready {
                        finalize_termination(shared, pid);
                    }
                }

                let pid = present.process_id;
                {
                    let tracked = shared.tracked.lock().expect("tracked lock poisoned");
                    match tracked.get(&pid) {
                        Some(entry) if !entry.terminated => {}
                        _ => continue,
                    }
                }
                let mut stores = match shared.stores.write() {
                    Ok(guard) => guard,
                    Err(_) => {
                        log::error!("store lock poisoned; dropping present");
                        continue;
                    }
                };
                if let Ok(store) = stores.process_store_mut(pid) {
                    if !store.frames.push(*present) && drop_warn.hit() {
                        log::warn!(
                            "frame ring full for pid {pid} (backpressured reader lagging)"
                        );
                    }
                }
            }
            TraceEvent::ProcessStart { pid, name, .. } => {
                let tracked = shared.tracked.lock().expect("tracked lock poisoned");
                if tracked.contains_key(&pid) {
                    if let Ok(mut stores) = shared.stores.write() {
                        if let Ok(store) = stores.process_store_mut(pid) {
                            store
                                .statics
                                .insert(MetricId::Application, StaticMetricValue::String(name));
                        }
                    }
                }
            }
            TraceEvent::ProcessStop { pid, timestamp } => {
                if pid == 0 {
                    // Shutdown wakeup marker.
                    continue;
                }
                let tracked = shared.tracked.lock().expect("tracked lock poisoned");
                if tracked.contains_key(&pid) {
                    pending_terminations.push((pid, timestamp));
                }
            }
        }
    }
}

fn finalize_termination(shared: &ServiceShared, pid: u32) {
    let mut tracked = shared.tracked.lock().expect("tracked lock poisoned");
    if let Some(entry) = tracked.get_mut(&pid) {
        entry.terminated = true;
        log::info!("process {pid} terminated; no further presents expected");
    }
}
