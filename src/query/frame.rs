use std::ops::Deref;
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashSet;

use crate::error::{Result, ServiceError};
use crate::intro::{DataType, Introspection, MetricId, MetricKind, StatId};
use crate::metrics::FrameMetrics;
use crate::query::dynamic::resolve_static;
use crate::query::{
    frame_metric_value, round_up_to_alignment, write_string, write_value, MetricValue,
    QueryElement,
};
use crate::source::FrameMetricsSource;
use crate::telemetry::{DataStores, StaticMetricValue};

const BLOB_ALIGNMENT: usize = 16;

#[derive(Debug, Clone, Copy)]
enum GatherKind {
    FrameMetric,
    Telemetry,
    Static,
}

#[derive(Debug, Clone, Copy)]
struct GatherCommand {
    metric: MetricId,
    data_type: DataType,
    blob_offset: usize,
    device_id: u32,
    array_index: u32,
    kind: GatherKind,
}

/// Display metrics that decay to NaN when the frame never reached the
/// screen.
fn requires_valid_display(metric: MetricId) -> bool {
    matches!(
        metric,
        MetricId::DisplayedTime
            | MetricId::DisplayLatency
            | MetricId::UntilDisplayed
            | MetricId::BetweenDisplayChange
    )
}

/// A registered per-frame blob query.
///
/// No aggregation: every consumed metrics record is serialized into one blob
/// with the layout fixed at registration. Telemetry elements resolve against
/// the sample nearest to the frame's CPU start; static elements resolve from
/// the static tables.
#[derive(Debug)]
pub struct FrameEventQuery {
    commands: Vec<GatherCommand>,
    blob_size: usize,
}

impl FrameEventQuery {
    pub fn new(
        elements: &mut [QueryElement],
        intro: &Introspection,
        stores: &DataStores,
    ) -> Result<Self> {
        if elements.is_empty() {
            return Err(ServiceError::QueryMalformed(
                "frame query requires at least one element".to_string(),
            ));
        }

        let mut commands = Vec::with_capacity(elements.len());
        let mut cursor = 0usize;

        for element in elements.iter_mut() {
            let info = *intro.find_metric(element.metric)?;
            intro.validate_binding(&info, element.device_id)?;

            if element.stat != StatId::None {
                log::warn!(
                    "frame query element for {:?} carries stat {:?}; frame queries ignore stats",
                    element.metric,
                    element.stat
                );
            }

            let kind = match info.kind {
                MetricKind::Static => GatherKind::Static,
                MetricKind::DynamicFrame => GatherKind::FrameMetric,
                MetricKind::Dynamic => {
                    let store = stores.device_store(element.device_id)?;
                    if element.array_index as usize >= store.telemetry.array_size(element.metric) {
                        return Err(ServiceError::QueryMalformed(format!(
                            "array index {} out of bounds for {:?} on device {}",
                            element.array_index, element.metric, element.device_id
                        )));
                    }
                    GatherKind::Telemetry
                }
            };

            cursor = round_up_to_alignment(cursor, info.frame_type.alignment());
            element.data_offset = cursor;
            element.data_size = info.frame_type.size();

            commands.push(GatherCommand {
                metric: element.metric,
                data_type: info.frame_type,
                blob_offset: cursor,
                device_id: element.device_id,
                array_index: element.array_index,
                kind,
            });
            cursor += element.data_size;
        }

        Ok(Self {
            commands,
            blob_size: round_up_to_alignment(cursor, BLOB_ALIGNMENT),
        })
    }

    pub fn blob_size(&self) -> usize {
        self.blob_size
    }

    /// Serializes one metrics record.
    pub fn gather_to_blob(
        &self,
        blob: &mut [u8],
        record: &FrameMetrics,
        stores: &DataStores,
        source: &FrameMetricsSource,
    ) -> Result<()> {
        if blob.len() < self.blob_size {
            return Err(ServiceError::OutOfRange(format!(
                "blob of {} bytes is smaller than the declared layout ({})",
                blob.len(),
                self.blob_size
            )));
        }

        for cmd in &self.commands {
            match cmd.kind {
                GatherKind::FrameMetric => {
                    if record.is_dropped_frame && requires_valid_display(cmd.metric) {
                        write_value(blob, cmd.blob_offset, DataType::Double, None);
                        continue;
                    }
                    let value = frame_metric_value(record, cmd.metric);
                    write_value(blob, cmd.blob_offset, cmd.data_type, value);
                }
                GatherKind::Telemetry => {
                    let value = stores
                        .device_store(cmd.device_id)?
                        .telemetry
                        .ring(cmd.metric, cmd.array_index)
                        .and_then(|ring| ring.nearest(record.cpu_start_qpc))
                        .map(MetricValue::from);
                    write_value(blob, cmd.blob_offset, cmd.data_type, value);
                }
                GatherKind::Static => {
                    match resolve_static(stores, Some(source), cmd.metric, cmd.device_id) {
                        Some(StaticMetricValue::String(s)) => {
                            write_string(blob, cmd.blob_offset, &s)
                        }
                        Some(StaticMetricValue::Enum(v)) => write_value(
                            blob,
                            cmd.blob_offset,
                            cmd.data_type,
                            Some(MetricValue::Enum(v)),
                        ),
                        Some(StaticMetricValue::Double(v)) => write_value(
                            blob,
                            cmd.blob_offset,
                            cmd.data_type,
                            Some(MetricValue::Double(v)),
                        ),
                        Some(StaticMetricValue::Uint64(v)) => write_value(
                            blob,
                            cmd.blob_offset,
                            cmd.data_type,
                            Some(MetricValue::Uint64(v)),
                        ),
                        None => write_value(blob, cmd.blob_offset, cmd.data_type, None),
                    }
                }
            }
        }
        Ok(())
    }

    /// Drains up to `max_frames` records from the source into `out`, one
    /// blob per record back to back. Returns the number of records written;
    /// zero new presents is a normal outcome, not an error.
    ///
    /// The store lock is only taken after the source finished its own
    /// refresh, which writes to the same stores.
    pub fn consume(
        &self,
        source: &mut FrameMetricsSource,
        stores: &std::sync::RwLock<DataStores>,
        max_frames: usize,
        out: &mut [u8],
    ) -> Result<usize> {
        let capacity = out.len() / self.blob_size;
        let records = source.consume(max_frames.min(capacity))?;
        let guard = stores
            .read()
            .map_err(|_| ServiceError::Service("store lock poisoned".to_string()))?;
        for (i, record) in records.iter().enumerate() {
            let blob = &mut out[i * self.blob_size..(i + 1) * self.blob_size];
            self.gather_to_blob(blob, record, &guard, source)?;
        }
        Ok(records.len())
    }
}

/// Enforces the one-active-frame-query-per-process rule.
#[derive(Debug, Default)]
pub struct FrameQueryRegistry {
    active_pids: Mutex<FxHashSet<u32>>,
}

impl FrameQueryRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a frame query for `pid`. A second registration for the same
    /// process fails until the first handle is dropped.
    pub fn register(
        self: &Arc<Self>,
        pid: u32,
        elements: &mut [QueryElement],
        intro: &Introspection,
        stores: &DataStores,
    ) -> Result<RegisteredFrameQuery> {
        {
            let mut active = self.active_pids.lock().expect("registry lock poisoned");
            if !active.insert(pid) {
                return Err(ServiceError::Service(format!(
                    "a frame event query is already registered for process {pid}"
                )));
            }
        }
        match FrameEventQuery::new(elements, intro, stores) {
            Ok(query) => Ok(RegisteredFrameQuery {
                query,
                pid,
                registry: self.clone(),
            }),
            Err(err) => {
                self.release(pid);
                Err(err)
            }
        }
    }

    fn release(&self, pid: u32) {
        self.active_pids
            .lock()
            .expect("registry lock poisoned")
            .remove(&pid);
    }
}

/// RAII handle for a registered frame query; dropping it frees the process
/// slot.
#[derive(Debug)]
pub struct RegisteredFrameQuery {
    query: FrameEventQuery,
    pid: u32,
    registry: Arc<FrameQueryRegistry>,
}

impl Deref for RegisteredFrameQuery {
    type Target = FrameEventQuery;

    fn deref(&self) -> &FrameEventQuery {
        &self.query
    }
}

impl Drop for RegisteredFrameQuery {
    fn drop(&mut self) {
        self.registry.release(self.pid);
    }
}
