use crate::present::{FrameType, PresentFlags, PresentMode, Runtime};

/// Which metric layout generation the pipeline is producing.
///
/// V1 is the legacy single-row-per-present mode without look-ahead; V2 emits
/// one row per displayed instance and resolves displayed time against the
/// next displayed present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricsVersion {
    V1,
    V2,
}

/// One output record of the metrics calculator.
///
/// Fields that cannot be computed for a given frame are `None`; everything
/// else defaults to zero when the inputs are unknown. Blob serialization
/// encodes `None` as quiet-NaN for floats and zero for integers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameMetrics {
    // Core timing
    pub present_start_qpc: u64,
    pub present_start_ms: f64,
    pub time_in_seconds: f64,
    pub ms_between_presents: f64,
    pub ms_in_present_api: f64,
    pub ms_until_render_start: f64,
    pub ms_until_render_complete: f64,
    pub ms_gpu_duration: f64,
    pub ms_video_duration: f64,
    pub ms_since_input: f64,

    // CPU (app frames only)
    pub cpu_start_qpc: u64,
    pub cpu_start_ms: f64,
    pub ms_cpu_busy: f64,
    pub ms_cpu_wait: f64,

    // GPU (app frames only)
    pub ms_gpu_latency: f64,
    pub ms_gpu_busy: f64,
    pub ms_gpu_wait: f64,
    pub ms_video_busy: f64,

    // Display (displayed frames only)
    pub ms_until_displayed: f64,
    pub ms_between_display_change: f64,
    pub ms_displayed_time: f64,
    pub ms_display_latency: f64,
    pub screen_time_qpc: u64,

    // Input-to-photon latency
    pub ms_click_to_photon_latency: Option<f64>,
    pub ms_all_input_photon_latency: Option<f64>,
    pub ms_instrumented_input_time: Option<f64>,
    pub ms_pc_latency: Option<f64>,

    // Animation
    pub ms_animation_error: Option<f64>,
    pub ms_animation_time: Option<f64>,

    // Instrumented
    pub ms_instrumented_latency: Option<f64>,
    pub ms_instrumented_render_latency: Option<f64>,
    pub ms_instrumented_sleep: Option<f64>,
    pub ms_instrumented_gpu_latency: Option<f64>,
    pub ms_ready_time_to_display_latency: Option<f64>,
    pub ms_between_sim_starts: Option<f64>,

    // Vendor
    pub ms_flip_delay: Option<f64>,

    // Derived rates
    pub fps_present: f64,
    pub fps_display: f64,
    pub fps_application: f64,

    // Classification
    pub frame_type: FrameType,
    pub is_dropped_frame: bool,

    // Present-call passthroughs
    pub swap_chain_address: u64,
    pub present_flags: PresentFlags,
    pub sync_interval: i32,
    pub runtime: Runtime,
    pub present_mode: PresentMode,
    pub allows_tearing: bool,
}

impl FrameMetrics {
    /// Total CPU time of the frame. Also the resolution target of the
    /// "between app start" metric alias.
    pub fn ms_cpu_time(&self) -> f64 {
        self.ms_cpu_busy + self.ms_cpu_wait
    }
}

/// Carry-state updates produced alongside a metrics record.
///
/// The calculator never mutates the swap-chain state directly; it emits this
/// patch and the driver applies it, which keeps the per-instance computation
/// replayable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDeltas {
    pub new_input_to_frame_start_ema: Option<f64>,
    pub new_accumulated_input_to_frame_start: Option<f64>,
    pub new_last_received_pcl_sim_start: Option<u64>,
    pub new_last_received_pcl_input_time: Option<u64>,
    pub last_received_not_displayed_all_input_time: Option<u64>,
    pub last_received_not_displayed_mouse_click_time: Option<u64>,
    pub last_received_not_displayed_app_provider_input_time: Option<u64>,
    /// Set when a pending dropped-frame input was consumed by a displayed
    /// frame; clears all of the not-displayed input caches together.
    pub should_reset_input_times: bool,
}

impl StateDeltas {
    pub fn is_empty(&self) -> bool {
        *self == StateDeltas::default()
    }
}

/// One metrics record paired with its carry-state patch.
#[derive(Debug, Clone, Default)]
pub struct ComputedMetrics {
    pub metrics: FrameMetrics,
    pub deltas: StateDeltas,
}
