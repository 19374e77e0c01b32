use rustc_hash::FxHashMap;

use crate::error::{Result, ServiceError};
use crate::intro::{DataType, Introspection, MetricId, MetricKind};
use crate::query::stat::MetricStats;
use crate::query::window::QueryWindow;
use crate::query::{
    frame_metric_value, round_up_to_alignment, write_string, write_value, MetricValue,
    QueryElement,
};
use crate::source::FrameMetricsSource;
use crate::telemetry::{DataStores, StaticMetricValue};
use crate::timebase::TimeBase;

const BLOB_ALIGNMENT: usize = 16;

#[derive(Debug)]
enum Binding {
    /// All per-frame metrics of the query share one traversal over the
    /// active swap chain's recent records.
    Frame { stats: Vec<MetricStats> },
    /// One telemetry ring, one metric, any number of stats.
    Telemetry {
        device_id: u32,
        array_index: u32,
        stats: MetricStats,
    },
    /// Resolved every poll from the static tables; no window involvement.
    Static {
        metric: MetricId,
        device_id: u32,
        data_type: DataType,
        offset: usize,
    },
}

/// A registered time-windowed statistics query.
///
/// Element offsets into the output blob are fixed at registration; polls
/// evaluate every element over the window `[now - offset - size,
/// now - offset]` and write one blob.
#[derive(Debug)]
pub struct DynamicQuery {
    bindings: Vec<Binding>,
    blob_size: usize,
    window_size_ticks: u64,
    metric_offset_ticks: u64,
}

impl DynamicQuery {
    /// Validates `elements` against introspection and the published stores,
    /// assigns blob offsets in place, and compiles the shared bindings.
    pub fn new(
        elements: &mut [QueryElement],
        window_size_ms: f64,
        metric_offset_ms: f64,
        time_base: &TimeBase,
        intro: &Introspection,
        stores: &DataStores,
    ) -> Result<Self> {
        if elements.is_empty() {
            return Err(ServiceError::QueryMalformed(
                "dynamic query requires at least one element".to_string(),
            ));
        }

        let mut bindings: Vec<Binding> = Vec::new();
        let mut frame_binding: Option<usize> = None;
        let mut telemetry_bindings: FxHashMap<(u32, MetricId, u32), usize> = FxHashMap::default();
        let mut cursor = 0usize;

        for element in elements.iter_mut() {
            let info = *intro.find_metric(element.metric)?;
            intro.validate_binding(&info, element.device_id)?;
            if !info.supports_stat(element.stat) {
                return Err(ServiceError::QueryMalformed(format!(
                    "metric {:?} does not support stat {:?}",
                    element.metric, element.stat
                )));
            }

            match info.kind {
                MetricKind::Static => {
                    element.data_offset = cursor;
                    element.data_size = info.frame_type.size();
                    bindings.push(Binding::Static {
                        metric: element.metric,
                        device_id: element.device_id,
                        data_type: info.frame_type,
                        offset: cursor,
                    });
                }
                MetricKind::DynamicFrame => {
                    let binding_index = *frame_binding.get_or_insert_with(|| {
                        bindings.push(Binding::Frame { stats: Vec::new() });
                        bindings.len() - 1
                    });
                    let Binding::Frame { stats } = &mut bindings[binding_index] else {
                        unreachable!()
                    };
                    let metric_stats = match stats.iter_mut().find(|s| s.metric() == element.metric)
                    {
                        Some(existing) => existing,
                        None => {
                            stats.push(MetricStats::new(element.metric, info.polled_type));
                            stats.last_mut().expect("just pushed")
                        }
                    };
                    element.data_offset = cursor;
                    element.data_size = metric_stats.output_size(element.stat);
                    metric_stats.add_stat(element.stat, cursor)?;
                }
                MetricKind::Dynamic => {
                    let store = stores.device_store(element.device_id)?;
                    if element.array_index as usize
                        >= store.telemetry.array_size(element.metric)
                    {
                        return Err(ServiceError::QueryMalformed(format!(
                            "array index {} out of bounds for {:?} on device {}",
                            element.array_index, element.metric, element.device_id
                        )));
                    }
                    let key = (element.device_id, element.metric, element.array_index);
                    let binding_index = match telemetry_bindings.get(&key) {
                        Some(&i) => i,
                        None => {
                            bindings.push(Binding::Telemetry {
                                device_id: element.device_id,
                                array_index: element.array_index,
                                stats: MetricStats::new(element.metric, info.polled_type),
                            });
                            telemetry_bindings.insert(key, bindings.len() - 1);
                            bindings.len() - 1
                        }
                    };
                    let Binding::Telemetry { stats, .. } = &mut bindings[binding_index] else {
                        unreachable!()
                    };
                    element.data_offset = cursor;
                    element.data_size = stats.output_size(element.stat);
                    stats.add_stat(element.stat, cursor)?;
                }
            }

            cursor = element.data_offset + element.data_size;
        }

        Ok(Self {
            bindings,
            blob_size: round_up_to_alignment(cursor, BLOB_ALIGNMENT),
            window_size_ticks: time_base.ms_to_ticks(window_size_ms),
            metric_offset_ticks: time_base.ms_to_ticks(metric_offset_ms),
        })
    }

    pub fn blob_size(&self) -> usize {
        self.blob_size
    }

    /// Evaluates every element at `now` and writes one output blob.
    ///
    /// `frame_source` is required when the query contains per-frame metrics
    /// or a per-process static. The store lock is taken per binding so the
    /// frame source can refresh itself (which writes to the stores) without
    /// deadlocking against this poll.
    pub fn poll(
        &mut self,
        stores: &std::sync::RwLock<DataStores>,
        mut frame_source: Option<&mut FrameMetricsSource>,
        now: u64,
        blob: &mut [u8],
    ) -> Result<()> {
        if blob.len() < self.blob_size {
            return Err(ServiceError::OutOfRange(format!(
                "blob of {} bytes is smaller than the declared layout ({})",
                blob.len(),
                self.blob_size
            )));
        }

        let window =
            QueryWindow::ending_at(now, self.metric_offset_ticks, self.window_size_ticks);

        for binding in &mut self.bindings {
            match binding {
                Binding::Frame { stats } => {
                    let source = frame_source.as_deref_mut().ok_or_else(|| {
                        ServiceError::QueryMalformed(
                            "per-frame metrics require a tracked process".to_string(),
                        )
                    })?;
                    source.update()?;

                    for s in stats.iter_mut() {
                        s.begin_poll();
                    }
                    source.for_each_in_active_timestamp_range(
                        window.oldest,
                        window.newest,
                        |record| {
                            for s in stats.iter_mut() {
                                if !s.needs_full_traversal() {
                                    continue;
                                }
                                if let Some(value) = frame_metric_value(record, s.metric()) {
                                    s.add_sample(value.as_f64());
                                }
                            }
                        },
                    );
                    for s in stats.iter_mut() {
                        for (slot, target) in s.point_targets(&window) {
                            if let Some(record) = source.find_nearest_active(target) {
                                if let Some(value) = frame_metric_value(record, s.metric()) {
                                    s.set_point_sample(slot, value.as_f64());
                                }
                            }
                        }
                        s.write_to_blob(blob);
                    }
                }
                Binding::Telemetry {
                    device_id,
                    array_index,
                    stats,
                } => {
                    let guard = stores
                        .read()
                        .map_err(|_| ServiceError::Service("store lock poisoned".to_string()))?;
                    let ring = guard
                        .device_store(*device_id)?
                        .telemetry
                        .ring(stats.metric(), *array_index)
                        .ok_or_else(|| {
                            ServiceError::QueryMalformed(format!(
                                "telemetry ring missing for {:?} on device {}",
                                stats.metric(),
                                device_id
                            ))
                        })?;

                    stats.begin_poll();
                    if stats.needs_full_traversal() {
                        ring.for_each_in_timestamp_range(window.oldest, window.newest, |_, v| {
                            stats.add_sample(v.as_f64());
                        });
                    }
                    if !ring.is_empty() {
                        for (slot, target) in stats.point_targets(&window) {
                            if let Some(v) = ring.nearest(target) {
                                stats.set_point_sample(slot, v.as_f64());
                            }
                        }
                    }
                    stats.write_to_blob(blob);
                }
                Binding::Static {
                    metric,
                    device_id,
                    data_type,
                    offset,
                } => {
                    let guard = stores
                        .read()
                        .map_err(|_| ServiceError::Service("store lock poisoned".to_string()))?;
                    let value =
                        resolve_static(&guard, frame_source.as_deref(), *metric, *device_id);
                    match value {
                        Some(StaticMetricValue::String(s)) => write_string(blob, *offset, &s),
                        Some(StaticMetricValue::Enum(v)) => {
                            write_value(blob, *offset, *data_type, Some(MetricValue::Enum(v)))
                        }
                        Some(StaticMetricValue::Double(v)) => {
                            write_value(blob, *offset, *data_type, Some(MetricValue::Double(v)))
                        }
                        Some(StaticMetricValue::Uint64(v)) => {
                            write_value(blob, *offset, *data_type, Some(MetricValue::Uint64(v)))
                        }
                        None => write_value(blob, *offset, *data_type, None),
                    }
                }
            }
        }

        Ok(())
    }
}

/// Looks up a static metric: per-process statics come from the tracked
/// process's store, device statics from the device's.
pub(crate) fn resolve_static(
    stores: &DataStores,
    frame_source: Option<&FrameMetricsSource>,
    metric: MetricId,
    device_id: u32,
) -> Option<StaticMetricValue> {
    if device_id == crate::intro::UNIVERSAL_DEVICE_ID {
        let pid = frame_source?.process_id();
        let store = stores.process_store(pid).ok()?;
        store.statics.get(&metric).cloned()
    } else {
        let store = stores.device_store(device_id).ok()?;
        store.statics.get(&metric).cloned()
    }
}
