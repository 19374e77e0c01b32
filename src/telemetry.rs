use rustc_hash::FxHashMap;

use crate::error::{Result, ServiceError};
use crate::intro::{DataType, MetricId, SYSTEM_DEVICE_ID};
use crate::present::FrameData;
use crate::ring::{HistoryRing, Timestamped};

impl Timestamped for FrameData {
    fn timestamp(&self) -> u64 {
        self.present_start_time
    }
}

/// One timestamped scalar pushed by a telemetry producer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetrySample<T> {
    pub timestamp: u64,
    pub value: T,
}

impl<T> Timestamped for TelemetrySample<T> {
    fn timestamp(&self) -> u64 {
        self.timestamp
    }
}

/// A telemetry scalar with its runtime type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TelemetryValue {
    Double(f64),
    Uint64(u64),
    Int32(i32),
    Bool(bool),
}

impl TelemetryValue {
    pub fn as_f64(self) -> f64 {
        match self {
            TelemetryValue::Double(v) => v,
            TelemetryValue::Uint64(v) => v as f64,
            TelemetryValue::Int32(v) => v as f64,
            TelemetryValue::Bool(v) => v as u8 as f64,
        }
    }
}

/// Type-bound sample ring for one `(metric, array index)` slot.
#[derive(Debug)]
pub enum TelemetryRing {
    Double(HistoryRing<TelemetrySample<f64>>),
    Uint64(HistoryRing<TelemetrySample<u64>>),
    Int32(HistoryRing<TelemetrySample<i32>>),
    Bool(HistoryRing<TelemetrySample<bool>>),
}

impl TelemetryRing {
    fn new(data_type: DataType, capacity: usize) -> Result<Self> {
        match data_type {
            DataType::Double => Ok(TelemetryRing::Double(HistoryRing::new(capacity))),
            DataType::Uint64 => Ok(TelemetryRing::Uint64(HistoryRing::new(capacity))),
            DataType::Int32 | DataType::Enum => Ok(TelemetryRing::Int32(HistoryRing::new(capacity))),
            DataType::Bool => Ok(TelemetryRing::Bool(HistoryRing::new(capacity))),
            _ => Err(ServiceError::QueryMalformed(format!(
                "data type {data_type:?} cannot back a telemetry ring"
            ))),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            TelemetryRing::Double(r) => r.is_empty(),
            TelemetryRing::Uint64(r) => r.is_empty(),
            TelemetryRing::Int32(r) => r.is_empty(),
            TelemetryRing::Bool(r) => r.is_empty(),
        }
    }

    pub fn push(&mut self, timestamp: u64, value: TelemetryValue) -> Result<()> {
        match (self, value) {
            (TelemetryRing::Double(r), TelemetryValue::Double(v)) => {
                r.push(TelemetrySample { timestamp, value: v });
            }
            (TelemetryRing::Uint64(r), TelemetryValue::Uint64(v)) => {
                r.push(TelemetrySample { timestamp, value: v });
            }
            (TelemetryRing::Int32(r), TelemetryValue::Int32(v)) => {
                r.push(TelemetrySample { timestamp, value: v });
            }
            (TelemetryRing::Bool(r), TelemetryValue::Bool(v)) => {
                r.push(TelemetrySample { timestamp, value: v });
            }
            _ => {
                return Err(ServiceError::QueryMalformed(
                    "telemetry sample type does not match its ring".to_string(),
                ))
            }
        }
        Ok(())
    }

    /// Sample closest to `timestamp`, if any samples exist.
    pub fn nearest(&self, timestamp: u64) -> Option<TelemetryValue> {
        match self {
            TelemetryRing::Double(r) => r.nearest(timestamp).map(|s| TelemetryValue::Double(s.value)),
            TelemetryRing::Uint64(r) => r.nearest(timestamp).map(|s| TelemetryValue::Uint64(s.value)),
            TelemetryRing::Int32(r) => r.nearest(timestamp).map(|s| TelemetryValue::Int32(s.value)),
            TelemetryRing::Bool(r) => r.nearest(timestamp).map(|s| TelemetryValue::Bool(s.value)),
        }
    }

    pub fn for_each_in_timestamp_range(
        &self,
        lo: u64,
        hi: u64,
        mut f: impl FnMut(u64, TelemetryValue),
    ) {
        match self {
            TelemetryRing::Double(r) => r.for_each_in_timestamp_range(lo, hi, |s| {
                f(s.timestamp, TelemetryValue::Double(s.value))
            }),
            TelemetryRing::Uint64(r) => r.for_each_in_timestamp_range(lo, hi, |s| {
                f(s.timestamp, TelemetryValue::Uint64(s.value))
            }),
            TelemetryRing::Int32(r) => r.for_each_in_timestamp_range(lo, hi, |s| {
                f(s.timestamp, TelemetryValue::Int32(s.value))
            }),
            TelemetryRing::Bool(r) => r.for_each_in_timestamp_range(lo, hi, |s| {
                f(s.timestamp, TelemetryValue::Bool(s.value))
            }),
        }
    }
}

const TELEMETRY_RING_CAPACITY: usize = 1024;

/// Telemetry rings of one device, keyed by metric with one ring per array
/// index.
#[derive(Debug, Default)]
pub struct TelemetryMap {
    rings: FxHashMap<MetricId, Vec<TelemetryRing>>,
}

impl TelemetryMap {
    /// Declares that this device produces `metric` with `array_size` slots.
    pub fn register(&mut self, metric: MetricId, data_type: DataType, array_size: usize) -> Result<()> {
        let mut rings = Vec::with_capacity(array_size);
        for _ in 0..array_size {
            rings.push(TelemetryRing::new(data_type, TELEMETRY_RING_CAPACITY)?);
        }
        self.rings.insert(metric, rings);
        Ok(())
    }

    /// Zero when the device does not produce the metric.
    pub fn array_size(&self, metric: MetricId) -> usize {
        self.rings.get(&metric).map(|r| r.len()).unwrap_or(0)
    }

    pub fn ring(&self, metric: MetricId, array_index: u32) -> Option<&TelemetryRing> {
        self.rings.get(&metric)?.get(array_index as usize)
    }

    pub fn push_sample(
        &mut self,
        metric: MetricId,
        array_index: u32,
        timestamp: u64,
        value: TelemetryValue,
    ) -> Result<()> {
        let ring = self
            .rings
            .get_mut(&metric)
            .and_then(|r| r.get_mut(array_index as usize))
            .ok_or_else(|| {
                ServiceError::QueryMalformed(format!(
                    "no telemetry ring registered for {metric:?}[{array_index}]"
                ))
            })?;
        ring.push(timestamp, value)
    }
}

/// A metric resolved once at store-open time.
#[derive(Debug, Clone, PartialEq)]
pub enum StaticMetricValue {
    String(String),
    Enum(i32),
    Double(f64),
    Uint64(u64),
}

pub type StaticMetricTable = FxHashMap<MetricId, StaticMetricValue>;

/// Frame store for one tracked process.
#[derive(Debug)]
pub struct ProcessStore {
    pub frames: HistoryRing<FrameData>,
    pub session_start_qpc: u64,
    pub statics: StaticMetricTable,
}

impl ProcessStore {
    pub fn new(capacity: usize, session_start_qpc: u64, backpressured: bool) -> Self {
        Self {
            frames: HistoryRing::with_backpressure(capacity, backpressured),
            session_start_qpc,
            statics: StaticMetricTable::default(),
        }
    }
}

/// Telemetry and static metadata for one device (a GPU adapter or the
/// system pseudo-device).
#[derive(Debug, Default)]
pub struct DeviceStore {
    pub telemetry: TelemetryMap,
    pub statics: StaticMetricTable,
}

/// Every store the service publishes: per-process frame rings, per-GPU
/// telemetry, and system telemetry.
#[derive(Debug, Default)]
pub struct DataStores {
    processes: FxHashMap<u32, ProcessStore>,
    gpus: FxHashMap<u32, DeviceStore>,
    system: DeviceStore,
}

impl DataStores {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_process_store(
        &mut self,
        pid: u32,
        capacity: usize,
        session_start_qpc: u64,
        backpressured: bool,
    ) {
        self.processes
            .entry(pid)
            .or_insert_with(|| ProcessStore::new(capacity, session_start_qpc, backpressured));
    }

    pub fn close_process_store(&mut self, pid: u32) {
        self.processes.remove(&pid);
    }

    pub fn process_store(&self, pid: u32) -> Result<&ProcessStore> {
        self.processes
            .get(&pid)
            .ok_or(ServiceError::InvalidPid(pid))
    }

    pub fn process_store_mut(&mut self, pid: u32) -> Result<&mut ProcessStore> {
        self.processes
            .get_mut(&pid)
            .ok_or(ServiceError::InvalidPid(pid))
    }

    pub fn register_gpu(&mut self, device_id: u32) -> &mut DeviceStore {
        self.gpus.entry(device_id).or_default()
    }

    pub fn system_store(&self) -> &DeviceStore {
        &self.system
    }

    pub fn system_store_mut(&mut self) -> &mut DeviceStore {
        &mut self.system
    }

    /// Resolves the device store for a telemetry-capable device id.
    pub fn device_store(&self, device_id: u32) -> Result<&DeviceStore> {
        if device_id == SYSTEM_DEVICE_ID {
            Ok(&self.system)
        } else {
            self.gpus.get(&device_id).ok_or_else(|| {
                ServiceError::QueryMalformed(format!("no store for device id {device_id}"))
            })
        }
    }

    pub fn device_store_mut(&mut self, device_id: u32) -> Result<&mut DeviceStore> {
        if device_id == SYSTEM_DEVICE_ID {
            Ok(&mut self.system)
        } else {
            self.gpus.get_mut(&device_id).ok_or_else(|| {
                ServiceError::QueryMalformed(format!("no store for device id {device_id}"))
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telemetry_map_registers_arrays_per_metric() {
        let mut map = TelemetryMap::default();
        map.register(MetricId::GpuFanSpeed, DataType::Double, 2).unwrap();
        assert_eq!(map.array_size(MetricId::GpuFanSpeed), 2);
        assert_eq!(map.array_size(MetricId::GpuPower), 0);

        map.push_sample(MetricId::GpuFanSpeed, 1, 100, TelemetryValue::Double(1200.0))
            .unwrap();
        let ring = map.ring(MetricId::GpuFanSpeed, 1).unwrap();
        assert_eq!(ring.nearest(90), Some(TelemetryValue::Double(1200.0)));
        assert!(map.ring(MetricId::GpuFanSpeed, 2).is_none());
    }

    #[test]
    fn mismatched_sample_type_is_rejected() {
        let mut map = TelemetryMap::default();
        map.register(MetricId::GpuMemUsed, DataType::Uint64, 1).unwrap();
        let err = map
            .push_sample(MetricId::GpuMemUsed, 0, 100, TelemetryValue::Double(1.0))
            .unwrap_err();
        assert!(matches!(err, ServiceError::QueryMalformed(_)));
    }

    #[test]
    fn frame_snapshot_round_trips_through_the_ring() {
        use crate::present::{FrameType, PresentResult};

        let mut store = ProcessStore::new(8, 0, false);
        let frame = FrameData {
            process_id: 7,
            swap_chain_address: 0xabc,
            present_start_time: 1000,
            time_in_present: 50,
            input_time: 900,
            displayed: vec![(FrameType::Application, 1200), (FrameType::Repeated, 1300)],
            final_state: PresentResult::Presented,
            ..Default::default()
        };
        store.frames.push(frame.clone());
        assert_eq!(store.frames.at(0), Some(&frame));
    }

    #[test]
    fn process_stores_open_and_close() {
        let mut stores = DataStores::new();
        stores.open_process_store(42, 16, 1000, false);
        assert!(stores.process_store(42).is_ok());
        stores.close_process_store(42);
        assert!(matches!(
            stores.process_store(42),
            Err(ServiceError::InvalidPid(42))
        ));
    }
}
