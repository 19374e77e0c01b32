use crate::error::{Result, ServiceError};
use crate::intro::{DataType, MetricId, StatId};
use crate::query::window::QueryWindow;
use crate::query::{write_value, MetricValue};

/// Nearest-rank percentile over sorted samples.
pub fn percentile_nearest_rank(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let clamped = p.clamp(0.0, 1.0);
    let position = clamped * (sorted.len() - 1) as f64;
    let index = (position + 0.5) as usize;
    Some(sorted[index])
}

#[derive(Debug, Clone, Copy)]
struct StatSlot {
    stat: StatId,
    offset: usize,
    /// Filled by a point lookup between traversal and blob write.
    point_value: Option<f64>,
}

/// Every statistic requested for one metric of one binding.
///
/// A poll runs in three phases: `begin_poll`, one `add_sample` per in-window
/// sample plus point lookups, then `write_to_blob`. The binding traverses its
/// source ring once regardless of how many stats are registered here.
#[derive(Debug)]
pub struct MetricStats {
    metric: MetricId,
    output_type: DataType,
    slots: Vec<StatSlot>,
    samples: Vec<f64>,
}

impl MetricStats {
    pub fn new(metric: MetricId, output_type: DataType) -> Self {
        Self {
            metric,
            output_type,
            slots: Vec::new(),
            samples: Vec::new(),
        }
    }

    pub fn metric(&self) -> MetricId {
        self.metric
    }

    pub fn add_stat(&mut self, stat: StatId, offset: usize) -> Result<()> {
        if stat == StatId::None {
            return Err(ServiceError::QueryMalformed(
                "dynamic query element requires a statistic".to_string(),
            ));
        }
        self.slots.push(StatSlot {
            stat,
            offset,
            point_value: None,
        });
        Ok(())
    }

    /// The blob size one stat output occupies. Averages widen to 64-bit
    /// float; everything else keeps the metric's polled type.
    pub fn output_size(&self, stat: StatId) -> usize {
        match stat {
            StatId::Avg | StatId::NonZeroAvg => DataType::Double.size(),
            _ => self.output_type.size(),
        }
    }

    /// True when any registered stat needs the full window traversed.
    pub fn needs_full_traversal(&self) -> bool {
        self.slots.iter().any(|s| !s.stat.is_point())
    }

    pub fn begin_poll(&mut self) {
        self.samples.clear();
        for slot in &mut self.slots {
            slot.point_value = None;
        }
    }

    pub fn add_sample(&mut self, value: f64) {
        self.samples.push(value);
    }

    /// Timestamps the binding should resolve via nearest-sample lookup, one
    /// per point stat.
    pub fn point_targets(&self, window: &QueryWindow) -> Vec<(usize, u64)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                let target = match slot.stat {
                    StatId::OldestPoint => window.oldest,
                    StatId::NewestPoint => window.newest,
                    StatId::MidPoint => window.mid(),
                    _ => return None,
                };
                Some((i, target))
            })
            .collect()
    }

    pub fn set_point_sample(&mut self, slot_index: usize, value: f64) {
        if let Some(slot) = self.slots.get_mut(slot_index) {
            slot.point_value = Some(value);
        }
    }

    /// Computes every registered stat over the collected window and writes
    /// the outputs. An empty window writes zeroes of the declared type;
    /// point stats fall back to zero only when no sample could be resolved.
    pub fn write_to_blob(&mut self, blob: &mut [u8]) {
        self.samples.sort_unstable_by(f64::total_cmp);

        for slot in &self.slots {
            match slot.stat {
                StatId::Avg => {
                    let avg = if self.samples.is_empty() {
                        0.0
                    } else {
                        self.samples.iter().sum::<f64>() / self.samples.len() as f64
                    };
                    write_value(
                        blob,
                        slot.offset,
                        DataType::Double,
                        Some(MetricValue::Double(avg)),
                    );
                }
                StatId::NonZeroAvg => {
                    let mut sum = 0.0;
                    let mut count = 0usize;
                    for &v in &self.samples {
                        if v != 0.0 {
                            sum += v;
                            count += 1;
                        }
                    }
                    let avg = if count == 0 { 0.0 } else { sum / count as f64 };
                    write_value(
                        blob,
                        slot.offset,
                        DataType::Double,
                        Some(MetricValue::Double(avg)),
                    );
                }
                StatId::Min => {
                    self.write_typed(blob, slot.offset, self.samples.first().copied());
                }
                StatId::Max => {
                    self.write_typed(blob, slot.offset, self.samples.last().copied());
                }
                StatId::OldestPoint | StatId::MidPoint | StatId::NewestPoint => {
                    self.write_typed(blob, slot.offset, slot.point_value);
                }
                stat => {
                    let p = stat
                        .percentile()
                        .expect("non-percentile stats are handled above");
                    self.write_typed(blob, slot.offset, percentile_nearest_rank(&self.samples, p));
                }
            }
        }
    }

    fn write_typed(&self, blob: &mut [u8], offset: usize, value: Option<f64>) {
        let typed = value.map(|v| match self.output_type {
            DataType::Double => MetricValue::Double(v),
            DataType::Uint64 => MetricValue::Uint64(v as u64),
            DataType::Uint32 => MetricValue::Uint32(v as u32),
            DataType::Int32 => MetricValue::Int32(v as i32),
            DataType::Enum => MetricValue::Enum(v as i32),
            DataType::Bool => MetricValue::Bool(v != 0.0),
            DataType::String => MetricValue::Double(v),
        });
        // Missing stat outputs are zero of the declared type, not NaN.
        let fallback = match self.output_type {
            DataType::Double => MetricValue::Double(0.0),
            DataType::Uint64 => MetricValue::Uint64(0),
            DataType::Uint32 => MetricValue::Uint32(0),
            DataType::Int32 => MetricValue::Int32(0),
            DataType::Enum => MetricValue::Enum(0),
            DataType::Bool => MetricValue::Bool(false),
            DataType::String => MetricValue::Double(0.0),
        };
        write_value(
            blob,
            offset,
            self.output_type,
            Some(typed.unwrap_or(fallback)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{ByteOrder, LittleEndian};

    #[test]
    fn percentile_matches_nearest_rank_definition() {
        let samples = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile_nearest_rank(&samples, 0.0), Some(1.0));
        assert_eq!(percentile_nearest_rank(&samples, 0.5), Some(3.0));
        assert_eq!(percentile_nearest_rank(&samples, 0.9), Some(5.0));
        assert_eq!(percentile_nearest_rank(&samples, 0.99), Some(5.0));
        assert_eq!(percentile_nearest_rank(&samples, 0.01), Some(1.0));
        assert_eq!(percentile_nearest_rank(&[], 0.5), None);
        // Out-of-range percentiles clamp.
        assert_eq!(percentile_nearest_rank(&samples, 1.5), Some(5.0));
    }

    #[test]
    fn single_traversal_feeds_every_stat() {
        let mut stats = MetricStats::new(MetricId::CpuBusy, DataType::Double);
        stats.add_stat(StatId::Avg, 0).unwrap();
        stats.add_stat(StatId::Min, 8).unwrap();
        stats.add_stat(StatId::Max, 16).unwrap();
        stats.add_stat(StatId::Percentile90, 24).unwrap();

        stats.begin_poll();
        for v in [4.0, 1.0, 3.0, 2.0] {
            stats.add_sample(v);
        }
        let mut blob = vec![0u8; 32];
        stats.write_to_blob(&mut blob);

        assert_eq!(LittleEndian::read_f64(&blob[0..8]), 2.5);
        assert_eq!(LittleEndian::read_f64(&blob[8..16]), 1.0);
        assert_eq!(LittleEndian::read_f64(&blob[16..24]), 4.0);
        assert_eq!(LittleEndian::read_f64(&blob[24..32]), 4.0);
    }

    #[test]
    fn empty_window_writes_zeroes() {
        let mut stats = MetricStats::new(MetricId::CpuBusy, DataType::Double);
        stats.add_stat(StatId::Avg, 0).unwrap();
        stats.add_stat(StatId::Percentile99, 8).unwrap();
        stats.begin_poll();
        let mut blob = vec![0xffu8; 16];
        stats.write_to_blob(&mut blob);
        assert_eq!(LittleEndian::read_f64(&blob[0..8]), 0.0);
        assert_eq!(LittleEndian::read_f64(&blob[8..16]), 0.0);
    }

    #[test]
    fn non_zero_average_filters_zero_samples() {
        let mut stats = MetricStats::new(MetricId::CpuBusy, DataType::Double);
        stats.add_stat(StatId::NonZeroAvg, 0).unwrap();
        stats.begin_poll();
        for v in [0.0, 2.0, 0.0, 4.0] {
            stats.add_sample(v);
        }
        let mut blob = vec![0u8; 8];
        stats.write_to_blob(&mut blob);
        assert_eq!(LittleEndian::read_f64(&blob[0..8]), 3.0);
    }

    #[test]
    fn point_stats_report_their_targets() {
        let mut stats = MetricStats::new(MetricId::GpuPower, DataType::Double);
        stats.add_stat(StatId::OldestPoint, 0).unwrap();
        stats.add_stat(StatId::NewestPoint, 8).unwrap();
        stats.add_stat(StatId::MidPoint, 16).unwrap();
        assert!(!stats.needs_full_traversal());

        let window = QueryWindow {
            oldest: 1_000,
            newest: 3_000,
        };
        let targets = stats.point_targets(&window);
        assert_eq!(targets, vec![(0, 1_000), (1, 3_000), (2, 2_000)]);

        stats.begin_poll();
        stats.set_point_sample(0, 7.0);
        stats.set_point_sample(1, 9.0);
        let mut blob = vec![0u8; 24];
        stats.write_to_blob(&mut blob);
        assert_eq!(LittleEndian::read_f64(&blob[0..8]), 7.0);
        assert_eq!(LittleEndian::read_f64(&blob[8..16]), 9.0);
        // Unresolved point falls back to zero.
        assert_eq!(LittleEndian::read_f64(&blob[16..24]), 0.0);
    }

    #[test]
    fn integer_metric_preserves_type_for_non_average_stats() {
        let mut stats = MetricStats::new(MetricId::SyncInterval, DataType::Int32);
        stats.add_stat(StatId::Max, 0).unwrap();
        stats.begin_poll();
        stats.add_sample(1.0);
        stats.add_sample(2.0);
        let mut blob = vec![0u8; 4];
        stats.write_to_blob(&mut blob);
        assert_eq!(LittleEndian::read_i32(&blob[0..4]), 2);
    }
}
