use std::io::{self, Write};

use crate::error::ServiceError;
use crate::intro::{enum_values, frame_type_value, present_mode_value, runtime_value, EnumId};
use crate::metrics::{FrameMetrics, MetricsVersion};

/// Missing-value sentinel used in place of absent metrics.
const NA: &str = "NA";

/// Column order of a V2 recording. Appending a metric means appending here,
/// to `FrameMetrics`, and to introspection together.
const V2_COLUMNS: &[&str] = &[
    "Application",
    "ProcessID",
    "SwapChainAddress",
    "PresentRuntime",
    "SyncInterval",
    "PresentFlags",
    "AllowsTearing",
    "PresentMode",
    "FrameType",
    "CPUStartQPC",
    "FrameTime",
    "CPUBusy",
    "CPUWait",
    "GPULatency",
    "GPUTime",
    "GPUBusy",
    "GPUWait",
    "VideoBusy",
    "DisplayLatency",
    "DisplayedTime",
    "AnimationError",
    "AnimationTime",
    "AllInputToPhotonLatency",
    "ClickToPhotonLatency",
    "InstrumentedInputToPhotonLatency",
    "PCLatency",
    "InstrumentedLatency",
    "InstrumentedSleep",
    "InstrumentedRenderLatency",
    "InstrumentedGPULatency",
    "ReadyTimeToDisplayLatency",
    "BetweenSimulationStarts",
    "FlipDelay",
    "DroppedFrames",
];

/// Legacy V1 column order.
const V1_COLUMNS: &[&str] = &[
    "Application",
    "ProcessID",
    "SwapChainAddress",
    "Runtime",
    "SyncInterval",
    "PresentFlags",
    "AllowsTearing",
    "PresentMode",
    "Dropped",
    "TimeInSeconds",
    "msInPresentAPI",
    "msBetweenPresents",
    "msUntilRenderComplete",
    "msUntilDisplayed",
    "msBetweenDisplayChange",
    "msUntilRenderStart",
    "msGPUActive",
    "msGPUVideoActive",
    "msSinceInput",
    "QPCTime",
];

pub fn columns(version: MetricsVersion) -> &'static [&'static str] {
    match version {
        MetricsVersion::V1 => V1_COLUMNS,
        MetricsVersion::V2 => V2_COLUMNS,
    }
}

/// Checks a recording header against the expected column order, including
/// the column count.
pub fn validate_header(line: &str, version: MetricsVersion) -> Result<(), ServiceError> {
    let expected = columns(version);
    let found: Vec<&str> = line.trim_end_matches(['\r', '\n']).split(',').collect();
    if found.len() != expected.len() {
        return Err(ServiceError::InvalidEtlFile(format!(
            "header has {} columns, expected {}",
            found.len(),
            expected.len()
        )));
    }
    for (i, (&f, &e)) in found.iter().zip(expected.iter()).enumerate() {
        if f != e {
            return Err(ServiceError::InvalidEtlFile(format!(
                "header column {i} is {f:?}, expected {e:?}"
            )));
        }
    }
    Ok(())
}

fn enum_name(id: EnumId, value: i32) -> &'static str {
    enum_values(id)
        .iter()
        .find(|(v, _)| *v == value)
        .map(|(_, name)| *name)
        .unwrap_or("Unknown")
}

fn ms(value: f64) -> String {
    format!("{value:.4}")
}

fn opt_ms(value: Option<f64>) -> String {
    value.map(ms).unwrap_or_else(|| NA.to_string())
}

/// Streams one CSV row per metrics record.
pub struct CsvWriter<W: Write> {
    writer: W,
    version: MetricsVersion,
}

impl<W: Write> CsvWriter<W> {
    /// Writes the header immediately; rows follow via `write_row`.
    pub fn new(mut writer: W, version: MetricsVersion) -> io::Result<Self> {
        writeln!(writer, "{}", columns(version).join(","))?;
        Ok(Self { writer, version })
    }

    pub fn write_row(
        &mut self,
        application: &str,
        process_id: u32,
        m: &FrameMetrics,
    ) -> io::Result<()> {
        match self.version {
            MetricsVersion::V1 => self.write_v1_row(application, process_id, m),
            MetricsVersion::V2 => self.write_v2_row(application, process_id, m),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_v2_row(
        &mut self,
        application: &str,
        process_id: u32,
        m: &FrameMetrics,
    ) -> io::Result<()> {
        let fields = [
            application.to_string(),
            process_id.to_string(),
            format!("0x{:016X}", m.swap_chain_address),
            enum_name(EnumId::PresentRuntime, runtime_value(m.runtime)).to_string(),
            m.sync_interval.to_string(),
            m.present_flags.bits().to_string(),
            (m.allows_tearing as u8).to_string(),
            enum_name(EnumId::PresentMode, present_mode_value(m.present_mode)).to_string(),
            enum_name(EnumId::FrameType, frame_type_value(m.frame_type)).to_string(),
            m.cpu_start_qpc.to_string(),
            ms(m.ms_cpu_time()),
            ms(m.ms_cpu_busy),
            ms(m.ms_cpu_wait),
            ms(m.ms_gpu_latency),
            ms(m.ms_gpu_busy + m.ms_gpu_wait),
            ms(m.ms_gpu_busy),
            ms(m.ms_gpu_wait),
            ms(m.ms_video_busy),
            ms(m.ms_display_latency),
            ms(m.ms_displayed_time),
            opt_ms(m.ms_animation_error),
            opt_ms(m.ms_animation_time),
            opt_ms(m.ms_all_input_photon_latency),
            opt_ms(m.ms_click_to_photon_latency),
            opt_ms(m.ms_instrumented_input_time),
            opt_ms(m.ms_pc_latency),
            opt_ms(m.ms_instrumented_latency),
            opt_ms(m.ms_instrumented_sleep),
            opt_ms(m.ms_instrumented_render_latency),
            opt_ms(m.ms_instrumented_gpu_latency),
            opt_ms(m.ms_ready_time_to_display_latency),
            opt_ms(m.ms_between_sim_starts),
            opt_ms(m.ms_flip_delay),
            (m.is_dropped_frame as u8).to_string(),
        ];
        writeln!(self.writer, "{}", fields.join(","))
    }

    fn write_v1_row(
        &mut self,
        application: &str,
        process_id: u32,
        m: &FrameMetrics,
    ) -> io::Result<()> {
        let fields = [
            application.to_string(),
            process_id.to_string(),
            format!("0x{:016X}", m.swap_chain_address),
            enum_name(EnumId::PresentRuntime, runtime_value(m.runtime)).to_string(),
            m.sync_interval.to_string(),
            m.present_flags.bits().to_string(),
            (m.allows_tearing as u8).to_string(),
            enum_name(EnumId::PresentMode, present_mode_value(m.present_mode)).to_string(),
            (m.is_dropped_frame as u8).to_string(),
            format!("{:.7}", m.time_in_seconds),
            ms(m.ms_in_present_api),
            ms(m.ms_between_presents),
            ms(m.ms_until_render_complete),
            ms(m.ms_until_displayed),
            ms(m.ms_between_display_change),
            ms(m.ms_until_render_start),
            ms(m.ms_gpu_duration),
            ms(m.ms_video_duration),
            ms(m.ms_since_input),
            m.present_start_qpc.to_string(),
        ];
        writeln!(self.writer, "{}", fields.join(","))
    }
}
