use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;

use crate::error::{Result, ServiceError};
use crate::metrics::{FrameMetrics, MetricsVersion, UnifiedSwapChain};
use crate::present::FrameData;
use crate::telemetry::DataStores;
use crate::timebase::TimeBase;

pub const DEFAULT_PER_SWAP_CHAIN_CAPACITY: usize = 4096;

/// Swap-chain state is discarded after this much present inactivity.
const SWAP_CHAIN_PRUNE_MS: f64 = 4000.0;

/// Sequenced metric records of one swap chain.
///
/// Records stay retained after consumption so windowed queries can traverse
/// recent history; the consume cursor guarantees each record is handed out
/// at most once.
#[derive(Debug)]
struct SwapChainFrames {
    chain: UnifiedSwapChain,
    metrics: VecDeque<FrameMetrics>,
    capacity: usize,
    cursor: usize,
}

impl SwapChainFrames {
    fn new(capacity: usize) -> Self {
        Self {
            chain: UnifiedSwapChain::new(),
            metrics: VecDeque::with_capacity(capacity),
            capacity,
            cursor: 0,
        }
    }

    fn has_pending(&self) -> bool {
        self.cursor < self.metrics.len()
    }

    fn peek(&self) -> Option<&FrameMetrics> {
        self.metrics.get(self.cursor)
    }

    fn consume_next(&mut self) {
        if self.cursor < self.metrics.len() {
            self.cursor += 1;
        }
    }

    fn process_frame(&mut self, tb: &TimeBase, frame: FrameData, version: MetricsVersion) {
        for computed in self.chain.enqueue(tb, frame, version) {
            self.push_metrics(computed.metrics);
        }
    }

    fn push_metrics(&mut self, metrics: FrameMetrics) {
        if self.metrics.len() == self.capacity {
            // Consumers that fall behind lose the oldest record.
            self.metrics.pop_front();
            if self.cursor > 0 {
                self.cursor -= 1;
            }
        }
        self.metrics.push_back(metrics);
    }

    fn newest_qpc(&self) -> u64 {
        self.metrics.back().map(|m| m.present_start_qpc).unwrap_or(0)
    }
}

/// Per-process aggregator over the shared frame ring.
///
/// Maintains one sequencer per observed swap-chain address, drains newly
/// published presents on demand, and serves the merged ordered stream of
/// metric records.
pub struct FrameMetricsSource {
    stores: Arc<RwLock<DataStores>>,
    process_id: u32,
    per_chain_capacity: usize,
    version: MetricsVersion,
    time_base: TimeBase,
    next_frame_serial: u64,
    latest_present_qpc: u64,
    swap_chains: FxHashMap<u64, SwapChainFrames>,
}

impl FrameMetricsSource {
    pub fn new(
        stores: Arc<RwLock<DataStores>>,
        frequency: u64,
        process_id: u32,
        per_chain_capacity: usize,
    ) -> Result<Self> {
        let (session_start, first_serial) = {
            let guard = stores
                .read()
                .map_err(|_| ServiceError::Service("store lock poisoned".to_string()))?;
            let store = guard.process_store(process_id)?;
            (store.session_start_qpc, store.frames.serial_range().0)
        };
        Ok(Self {
            stores,
            process_id,
            per_chain_capacity: per_chain_capacity.max(1),
            version: MetricsVersion::V2,
            time_base: TimeBase::with_session_start(frequency, session_start),
            next_frame_serial: first_serial,
            latest_present_qpc: 0,
            swap_chains: FxHashMap::default(),
        })
    }

    pub fn time_base(&self) -> &TimeBase {
        &self.time_base
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    /// Drains presents published since the last pass through the sequencers.
    pub fn update(&mut self) -> Result<()> {
        let new_frames = {
            let mut guard = self
                .stores
                .write()
                .map_err(|_| ServiceError::Service("store lock poisoned".to_string()))?;
            let store = guard.process_store_mut(self.process_id)?;
            let (first, last) = store.frames.serial_range();

            // Anything before the cursor was already consumed; anything
            // before `first` was lost to ring overwrite.
            if first > self.next_frame_serial {
                log::warn!(
                    "frame ring overwrote {} unconsumed presents for pid {}",
                    first - self.next_frame_serial,
                    self.process_id
                );
                self.next_frame_serial = first;
            }
            if self.next_frame_serial >= last {
                return Ok(());
            }

            let mut frames = Vec::with_capacity((last - self.next_frame_serial) as usize);
            for serial in self.next_frame_serial..last {
                if let Some(frame) = store.frames.at(serial) {
                    frames.push(frame.clone());
                }
            }
            self.next_frame_serial = last;
            store.frames.mark_next_read(last);
            frames
        };

        for frame in new_frames {
            self.latest_present_qpc = self.latest_present_qpc.max(frame.present_start_time);
            let state = self
                .swap_chains
                .entry(frame.swap_chain_address)
                .or_insert_with(|| SwapChainFrames::new(self.per_chain_capacity));
            state.process_frame(&self.time_base, frame, self.version);
        }
        self.prune_idle_swap_chains();
        Ok(())
    }

    /// Drops state for swap chains that have gone quiet, keeping any with
    /// unconsumed records.
    fn prune_idle_swap_chains(&mut self) {
        let threshold = self.time_base.ms_to_ticks(SWAP_CHAIN_PRUNE_MS);
        if threshold == 0 || self.latest_present_qpc <= threshold {
            return;
        }
        let min_timestamp = self.latest_present_qpc - threshold;
        self.swap_chains
            .retain(|_, s| s.has_pending() || !s.chain.is_prunable_before(min_timestamp));
    }

    /// Returns up to `max_frames` records, merged across swap chains by
    /// `time_in_seconds` with the swap-chain address as tiebreak. Each record
    /// is returned exactly once.
    pub fn consume(&mut self, max_frames: usize) -> Result<Vec<FrameMetrics>> {
        self.update()?;

        let mut output = Vec::new();
        if max_frames == 0 {
            return Ok(output);
        }
        output.reserve(max_frames.min(64));

        for _ in 0..max_frames {
            let mut selected: Option<(u64, f64)> = None;
            for (&address, state) in &self.swap_chains {
                let Some(head) = state.peek() else { continue };
                let better = match selected {
                    None => true,
                    Some((sel_addr, sel_time)) => {
                        head.time_in_seconds < sel_time
                            || (head.time_in_seconds == sel_time && address < sel_addr)
                    }
                };
                if better {
                    selected = Some((address, head.time_in_seconds));
                }
            }

            let Some((address, _)) = selected else { break };
            let state = self
                .swap_chains
                .get_mut(&address)
                .ok_or_else(|| ServiceError::Service("swap chain vanished".to_string()))?;
            if let Some(head) = state.peek() {
                output.push(head.clone());
            }
            state.consume_next();
        }

        Ok(output)
    }

    /// The swap chain most recently active, by newest retained record.
    fn active_chain(&self) -> Option<&SwapChainFrames> {
        self.swap_chains
            .values()
            .filter(|s| !s.metrics.is_empty())
            .max_by_key(|s| s.newest_qpc())
    }

    /// True when the active swap chain retains any record inside the window.
    pub fn has_active_samples(&self, lo: u64, hi: u64) -> bool {
        let mut any = false;
        self.for_each_in_active_timestamp_range(lo, hi, |_| any = true);
        any
    }

    /// Visits retained records of the active swap chain whose present start
    /// lies in `[lo, hi]`, oldest first.
    pub fn for_each_in_active_timestamp_range(
        &self,
        lo: u64,
        hi: u64,
        mut f: impl FnMut(&FrameMetrics),
    ) {
        let Some(state) = self.active_chain() else { return };
        let start = state
            .metrics
            .partition_point(|m| m.present_start_qpc < lo);
        for m in state.metrics.iter().skip(start) {
            if m.present_start_qpc > hi {
                break;
            }
            f(m);
        }
    }

    /// The retained record of the active swap chain closest to `point`.
    pub fn find_nearest_active(&self, point: u64) -> Option<&FrameMetrics> {
        let state = self.active_chain()?;
        if state.metrics.is_empty() {
            return None;
        }
        let idx = state
            .metrics
            .partition_point(|m| m.present_start_qpc < point);
        if idx == 0 {
            return state.metrics.front();
        }
        if idx == state.metrics.len() {
            return state.metrics.back();
        }
        let before = &state.metrics[idx - 1];
        let after = &state.metrics[idx];
        if point - before.present_start_qpc <= after.present_start_qpc - point {
            Some(before)
        } else {
            Some(after)
        }
    }
}
