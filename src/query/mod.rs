pub mod dynamic;
pub mod frame;
mod stat;
mod window;

pub use dynamic::DynamicQuery;
pub use frame::{FrameEventQuery, FrameQueryRegistry, RegisteredFrameQuery};
pub use window::QueryWindow;

use byteorder::{ByteOrder, LittleEndian};

use crate::intro::{
    frame_type_value, present_mode_value, runtime_value, DataType, MetricId, StatId,
};
use crate::metrics::FrameMetrics;
use crate::telemetry::TelemetryValue;

/// One requested output of a query: which metric, which statistic, and which
/// device/array slot it is sourced from. `data_offset`/`data_size` are
/// assigned at registration and tell the client where the value lands in
/// each output blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryElement {
    pub metric: MetricId,
    pub stat: StatId,
    pub device_id: u32,
    pub array_index: u32,
    pub data_offset: usize,
    pub data_size: usize,
}

impl QueryElement {
    pub fn new(metric: MetricId, stat: StatId, device_id: u32, array_index: u32) -> Self {
        Self {
            metric,
            stat,
            device_id,
            array_index,
            data_offset: 0,
            data_size: 0,
        }
    }
}

/// The usage set a client reports to the service when registering a query,
/// so telemetry producers only collect what somebody is asking for.
pub fn metric_uses(elements: &[QueryElement]) -> Vec<crate::control::MetricUse> {
    elements
        .iter()
        .map(|e| crate::control::MetricUse {
            metric: e.metric,
            device_id: e.device_id,
            array_index: e.array_index,
        })
        .collect()
}

/// A typed scalar on its way into an output blob.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Double(f64),
    Uint64(u64),
    Uint32(u32),
    Int32(i32),
    Enum(i32),
    Bool(bool),
}

impl MetricValue {
    pub fn as_f64(self) -> f64 {
        match self {
            MetricValue::Double(v) => v,
            MetricValue::Uint64(v) => v as f64,
            MetricValue::Uint32(v) => v as f64,
            MetricValue::Int32(v) => v as f64,
            MetricValue::Enum(v) => v as f64,
            MetricValue::Bool(v) => v as u8 as f64,
        }
    }
}

impl From<TelemetryValue> for MetricValue {
    fn from(v: TelemetryValue) -> Self {
        match v {
            TelemetryValue::Double(v) => MetricValue::Double(v),
            TelemetryValue::Uint64(v) => MetricValue::Uint64(v),
            TelemetryValue::Int32(v) => MetricValue::Int32(v),
            TelemetryValue::Bool(v) => MetricValue::Bool(v),
        }
    }
}

pub(crate) fn round_up_to_alignment(cursor: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (cursor + alignment - 1) & !(alignment - 1)
}

/// Writes a value into a blob slot of the given wire type. `None` encodes as
/// quiet-NaN for floats and zero otherwise.
pub(crate) fn write_value(
    blob: &mut [u8],
    offset: usize,
    data_type: DataType,
    value: Option<MetricValue>,
) {
    let slot = &mut blob[offset..offset + data_type.size()];
    match data_type {
        DataType::Double => {
            let v = value.map(MetricValue::as_f64).unwrap_or(f64::NAN);
            LittleEndian::write_f64(slot, v);
        }
        DataType::Uint64 => {
            let v = match value {
                Some(MetricValue::Uint64(v)) => v,
                Some(other) => other.as_f64() as u64,
                None => 0,
            };
            LittleEndian::write_u64(slot, v);
        }
        DataType::Uint32 => {
            let v = match value {
                Some(MetricValue::Uint32(v)) => v,
                Some(other) => other.as_f64() as u32,
                None => 0,
            };
            LittleEndian::write_u32(slot, v);
        }
        DataType::Int32 | DataType::Enum => {
            let v = match value {
                Some(MetricValue::Int32(v)) | Some(MetricValue::Enum(v)) => v,
                Some(other) => other.as_f64() as i32,
                None => 0,
            };
            LittleEndian::write_i32(slot, v);
        }
        DataType::Bool => {
            let v = match value {
                Some(MetricValue::Bool(v)) => v,
                Some(other) => other.as_f64() != 0.0,
                None => false,
            };
            slot[0] = v as u8;
        }
        DataType::String => {
            // Strings are copied by the static gather path, never here.
            slot.fill(0);
        }
    }
}

/// Copies a string into a fixed-size blob slot, NUL padded and truncated on
/// a character boundary.
pub(crate) fn write_string(blob: &mut [u8], offset: usize, value: &str) {
    let slot = &mut blob[offset..offset + DataType::String.size()];
    slot.fill(0);
    let mut len = value.len().min(slot.len() - 1);
    while len > 0 && !value.is_char_boundary(len) {
        len -= 1;
    }
    slot[..len].copy_from_slice(&value.as_bytes()[..len]);
}

/// Reads one frame metric out of a record. `None` means the metric is absent
/// for this frame.
pub fn frame_metric_value(m: &FrameMetrics, id: MetricId) -> Option<MetricValue> {
    use MetricValue::*;
    match id {
        MetricId::PresentStartQpc => Some(Uint64(m.present_start_qpc)),
        MetricId::PresentStartTime => Some(Double(m.present_start_ms)),
        MetricId::BetweenPresents => Some(Double(m.ms_between_presents)),
        MetricId::InPresentApi => Some(Double(m.ms_in_present_api)),
        MetricId::UntilRenderStart => Some(Double(m.ms_until_render_start)),
        MetricId::UntilRenderComplete => Some(Double(m.ms_until_render_complete)),
        MetricId::GpuDuration => Some(Double(m.ms_gpu_duration)),
        MetricId::VideoDuration => Some(Double(m.ms_video_duration)),
        MetricId::SinceInput => Some(Double(m.ms_since_input)),
        MetricId::CpuStartQpc => Some(Uint64(m.cpu_start_qpc)),
        MetricId::CpuStartTime => Some(Double(m.cpu_start_ms)),
        MetricId::CpuBusy => Some(Double(m.ms_cpu_busy)),
        MetricId::CpuWait => Some(Double(m.ms_cpu_wait)),
        MetricId::BetweenAppStart => Some(Double(m.ms_cpu_time())),
        MetricId::GpuLatency => Some(Double(m.ms_gpu_latency)),
        MetricId::GpuBusy => Some(Double(m.ms_gpu_busy)),
        MetricId::GpuWait => Some(Double(m.ms_gpu_wait)),
        MetricId::VideoBusy => Some(Double(m.ms_video_busy)),
        MetricId::UntilDisplayed => Some(Double(m.ms_until_displayed)),
        MetricId::BetweenDisplayChange => Some(Double(m.ms_between_display_change)),
        MetricId::DisplayedTime => Some(Double(m.ms_displayed_time)),
        MetricId::DisplayLatency => Some(Double(m.ms_display_latency)),
        MetricId::ScreenTimeQpc => Some(Uint64(m.screen_time_qpc)),
        MetricId::ClickToPhotonLatency => m.ms_click_to_photon_latency.map(Double),
        MetricId::AllInputToPhotonLatency => m.ms_all_input_photon_latency.map(Double),
        MetricId::InstrumentedInputToPhotonLatency => m.ms_instrumented_input_time.map(Double),
        MetricId::PcLatency => m.ms_pc_latency.map(Double),
        MetricId::AnimationError => m.ms_animation_error.map(Double),
        MetricId::AnimationTime => m.ms_animation_time.map(Double),
        MetricId::InstrumentedLatency => m.ms_instrumented_latency.map(Double),
        MetricId::InstrumentedRenderLatency => m.ms_instrumented_render_latency.map(Double),
        MetricId::InstrumentedSleep => m.ms_instrumented_sleep.map(Double),
        MetricId::InstrumentedGpuLatency => m.ms_instrumented_gpu_latency.map(Double),
        MetricId::ReadyTimeToDisplayLatency => m.ms_ready_time_to_display_latency.map(Double),
        MetricId::BetweenSimStarts => m.ms_between_sim_starts.map(Double),
        MetricId::FlipDelay => m.ms_flip_delay.map(Double),
        MetricId::PresentedFps => Some(Double(m.fps_present)),
        MetricId::DisplayedFps => Some(Double(m.fps_display)),
        MetricId::ApplicationFps => Some(Double(m.fps_application)),
        MetricId::FrameType => Some(Enum(frame_type_value(m.frame_type))),
        MetricId::DroppedFrames => Some(Bool(m.is_dropped_frame)),
        MetricId::SyncInterval => Some(Int32(m.sync_interval)),
        MetricId::PresentFlags => Some(Uint32(m.present_flags.bits())),
        MetricId::PresentMode => Some(Enum(present_mode_value(m.present_mode))),
        MetricId::PresentRuntime => Some(Enum(runtime_value(m.runtime))),
        MetricId::AllowsTearing => Some(Bool(m.allows_tearing)),
        MetricId::SwapChainAddress => Some(Uint64(m.swap_chain_address)),
        // Telemetry and static metrics are not frame fields.
        _ => None,
    }
}
