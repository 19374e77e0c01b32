use crate::metrics::types::StateDeltas;
use crate::present::{FrameData, PresentResult};

/// Which timestamp family drives the animation-error calculation.
///
/// Starts at `CpuStart` and upgrades monotonically the first time a present
/// carries a provider sim-start. An app-provider sim-start outranks the
/// platform latency instrumentation when both appear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnimationErrorSource {
    #[default]
    CpuStart,
    AppProvider,
    PcLatency,
}

/// Running per-swap-chain state consulted and advanced by the calculator.
#[derive(Debug, Clone, Default)]
pub struct SwapChainCoreState {
    /// The most recent present that has been processed.
    pub last_present: Option<FrameData>,

    /// The most recent processed present whose final displayed entry was an
    /// app frame (or which was dropped entirely).
    pub last_app_present: Option<FrameData>,

    /// Last simulation start regardless of display outcome.
    pub last_sim_start_time: u64,

    /// Simulation start of the most recent displayed frame.
    pub last_displayed_sim_start_time: u64,

    /// Screen time of the most recent displayed frame of any type.
    pub last_displayed_screen_time: u64,

    /// Screen time of the most recent displayed application frame.
    pub last_displayed_app_screen_time: u64,

    /// First simulation start ever received from a provider.
    pub first_app_sim_start_time: u64,

    // Input times carried over from dropped presents so the latency can be
    // credited to the next frame that actually reaches the screen.
    pub last_received_not_displayed_all_input_time: u64,
    pub last_received_not_displayed_mouse_click_time: u64,
    pub last_received_not_displayed_app_provider_input_time: u64,
    pub last_received_not_displayed_pcl_sim_start: u64,
    pub last_received_not_displayed_pcl_input_time: u64,

    pub animation_error_source: AnimationErrorSource,

    /// Input-to-frame-start time accumulated across consecutive dropped
    /// presents that share one pending input.
    pub accumulated_input_to_frame_start_time: f64,

    /// Running EMA of input-to-frame-start time.
    pub input_to_frame_start_ema: f64,

    pub last_displayed_flip_delay: u64,
}

impl SwapChainCoreState {
    /// Applies a calculator-produced patch.
    pub fn apply_deltas(&mut self, d: &StateDeltas) {
        if d.should_reset_input_times {
            self.last_received_not_displayed_all_input_time = 0;
            self.last_received_not_displayed_mouse_click_time = 0;
            self.last_received_not_displayed_app_provider_input_time = 0;
            self.last_received_not_displayed_pcl_sim_start = 0;
            self.last_received_not_displayed_pcl_input_time = 0;
        }
        if let Some(t) = d.last_received_not_displayed_all_input_time {
            self.last_received_not_displayed_all_input_time = t;
        }
        if let Some(t) = d.last_received_not_displayed_mouse_click_time {
            self.last_received_not_displayed_mouse_click_time = t;
        }
        if let Some(t) = d.last_received_not_displayed_app_provider_input_time {
            self.last_received_not_displayed_app_provider_input_time = t;
        }
        if let Some(t) = d.new_last_received_pcl_sim_start {
            self.last_received_not_displayed_pcl_sim_start = t;
        }
        if let Some(t) = d.new_last_received_pcl_input_time {
            self.last_received_not_displayed_pcl_input_time = t;
        }
        if let Some(v) = d.new_accumulated_input_to_frame_start {
            self.accumulated_input_to_frame_start_time = v;
        }
        if let Some(v) = d.new_input_to_frame_start_ema {
            self.input_to_frame_start_ema = v;
        }
    }

    /// Advances the history after a present has been fully processed.
    pub fn update_after_present(&mut self, present: &FrameData) {
        let display_count = present.displayed_count();

        if present.final_state == PresentResult::Presented {
            if display_count > 0 {
                let last_idx = display_count - 1;
                let (last_type, last_screen_time) = present.displayed[last_idx];

                if last_type.is_app() {
                    match self.animation_error_source {
                        AnimationErrorSource::AppProvider => {
                            if present.app_sim_start_time != 0 {
                                self.latch_displayed_sim_start(
                                    present.app_sim_start_time,
                                    last_screen_time,
                                );
                            }
                        }
                        AnimationErrorSource::PcLatency => {
                            if present.pcl_sim_start_time != 0 {
                                self.latch_displayed_sim_start(
                                    present.pcl_sim_start_time,
                                    last_screen_time,
                                );
                            }
                        }
                        AnimationErrorSource::CpuStart => {
                            // First sighting of a provider sim-start switches
                            // the source permanently.
                            if present.app_sim_start_time != 0 {
                                self.animation_error_source = AnimationErrorSource::AppProvider;
                                self.latch_displayed_sim_start(
                                    present.app_sim_start_time,
                                    last_screen_time,
                                );
                            } else if present.pcl_sim_start_time != 0 {
                                self.animation_error_source = AnimationErrorSource::PcLatency;
                                self.latch_displayed_sim_start(
                                    present.pcl_sim_start_time,
                                    last_screen_time,
                                );
                            } else {
                                if let Some(last_app) = &self.last_app_present {
                                    self.last_displayed_sim_start_time =
                                        last_app.present_start_time + last_app.time_in_present;
                                }
                                self.last_displayed_app_screen_time = last_screen_time;
                            }
                        }
                    }
                }
            }

            if display_count > 0 {
                self.last_displayed_screen_time = present.displayed[display_count - 1].1;
                self.last_displayed_flip_delay = present.flip_delay;
            } else {
                self.last_displayed_screen_time = 0;
                self.last_displayed_flip_delay = 0;
            }
        }

        // A dropped present still stands in as the last app present.
        if display_count > 0 {
            if present.displayed[display_count - 1].0.is_app() {
                self.last_app_present = Some(present.clone());
            }
        } else {
            self.last_app_present = Some(present.clone());
        }

        // Latest sim start of either kind; the platform instrumentation wins
        // when both are present.
        if present.pcl_sim_start_time != 0 {
            self.last_sim_start_time = present.pcl_sim_start_time;
        } else if present.app_sim_start_time != 0 {
            self.last_sim_start_time = present.app_sim_start_time;
        }

        self.last_present = Some(present.clone());
    }

    fn latch_displayed_sim_start(&mut self, sim_start: u64, screen_time: u64) {
        self.last_displayed_sim_start_time = sim_start;
        if self.first_app_sim_start_time == 0 {
            self.first_app_sim_start_time = sim_start;
        }
        self.last_displayed_app_screen_time = screen_time;
    }
}
