use bitflags::bitflags;

/// How a displayed frame instance was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FrameType {
    #[default]
    NotSet,
    Application,
    Repeated,
    Intel,
    Amd,
    Nvidia,
}

impl FrameType {
    /// Application frames and unattributed frames both count as app frames
    /// for metric attribution.
    pub fn is_app(self) -> bool {
        matches!(self, FrameType::NotSet | FrameType::Application)
    }
}

/// Final outcome of a present call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PresentResult {
    #[default]
    Unknown,
    Presented,
    Discarded,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PresentMode {
    #[default]
    Unknown,
    HardwareLegacyFlip,
    HardwareLegacyCopyToFrontBuffer,
    HardwareDirectFlip,
    HardwareIndependentFlip,
    ComposedFlip,
    ComposedCopyGpuGdi,
    ComposedCopyCpuGdi,
    ComposedCompositionAtlas,
    HardwareComposedIndependentFlip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Runtime {
    Dxgi,
    D3d9,
    #[default]
    Other,
}

/// Input device classification reported by the app instrumentation provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum InputDeviceKind {
    #[default]
    None,
    Keyboard,
    Mouse,
    Gamepad,
}

bitflags! {
    /// Raw flags passed by the application to the present call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PresentFlags: u32 {
        const TEST = 0x1;
        const DO_NOT_SEQUENCE = 0x2;
        const RESTART = 0x4;
        const DO_NOT_WAIT = 0x8;
        const STEREO_PREFER_RIGHT = 0x10;
        const STEREO_TEMPORARY_MONO = 0x20;
        const RESTRICT_TO_OUTPUT = 0x40;
        const USE_DURATION = 0x100;
        const ALLOW_TEARING = 0x200;
    }
}

/// One timestamped input sample from the app instrumentation provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AppInputSample {
    pub time: u64,
    pub kind: InputDeviceKind,
}

/// A fully owned snapshot of one present event.
///
/// All timestamps are raw ticks; zero means the value was never observed.
/// A snapshot is immutable once it leaves the event source, with one
/// exception: the sequencer may adjust `flip_delay` and the screen time of
/// `displayed[0]` when correcting collapsed frames.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameData {
    // Identity
    pub process_id: u32,
    pub thread_id: u32,
    pub swap_chain_address: u64,
    pub frame_id: u32,
    pub app_frame_id: u32,

    // Timing
    pub present_start_time: u64,
    pub time_in_present: u64,
    pub ready_time: u64,
    pub gpu_start_time: u64,
    pub gpu_duration: u64,
    pub gpu_video_duration: u64,

    // Source-frame timing propagated by an upstream frame-generation layer.
    pub app_propagated_present_start_time: u64,
    pub app_propagated_time_in_present: u64,
    pub app_propagated_gpu_start_time: u64,
    pub app_propagated_ready_time: u64,
    pub app_propagated_gpu_duration: u64,
    pub app_propagated_gpu_video_duration: u64,

    // Markers exposed by the application's own instrumentation.
    pub app_sim_start_time: u64,
    pub app_sleep_start_time: u64,
    pub app_sleep_end_time: u64,
    pub app_render_submit_start_time: u64,
    pub app_render_submit_end_time: u64,
    pub app_present_start_time: u64,
    pub app_present_end_time: u64,
    pub app_input_sample: AppInputSample,

    // Input device timestamps
    pub input_time: u64,
    pub mouse_click_time: u64,

    // Platform latency instrumentation
    pub pcl_sim_start_time: u64,
    pub pcl_input_ping_time: u64,

    /// On-screen appearances of this present. Empty when dropped; more than
    /// one entry when the compositor repeats the present or a vendor layer
    /// synthesizes extra frames.
    pub displayed: Vec<(FrameType, u64)>,

    pub final_state: PresentResult,

    // Vendor-specific
    pub flip_delay: u64,
    pub flip_token: u32,

    // Present-call passthroughs
    pub runtime: Runtime,
    pub sync_interval: i32,
    pub present_mode: PresentMode,
    pub present_flags: PresentFlags,
    pub supports_tearing: bool,
}

impl FrameData {
    /// A present counts as displayed when it completed and hit the screen at
    /// least once.
    pub fn is_displayed(&self) -> bool {
        self.final_state == PresentResult::Presented && !self.displayed.is_empty()
    }

    pub fn displayed_count(&self) -> usize {
        self.displayed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displayed_requires_presented_state_and_screen_time() {
        let mut p = FrameData {
            final_state: PresentResult::Presented,
            displayed: vec![(FrameType::Application, 100)],
            ..Default::default()
        };
        assert!(p.is_displayed());

        p.final_state = PresentResult::Discarded;
        assert!(!p.is_displayed());

        p.final_state = PresentResult::Presented;
        p.displayed.clear();
        assert!(!p.is_displayed());
    }

    #[test]
    fn app_frame_classification() {
        assert!(FrameType::NotSet.is_app());
        assert!(FrameType::Application.is_app());
        assert!(!FrameType::Repeated.is_app());
        assert!(!FrameType::Nvidia.is_app());
    }
}
