use indexmap::IndexMap;
use serde_derive::{Deserialize, Serialize};

use crate::error::{Result, ServiceError};
use crate::present::{FrameType, PresentMode, Runtime};

/// Device id addressing per-frame metrics (no physical device).
pub const UNIVERSAL_DEVICE_ID: u32 = 0;
/// Device id addressing whole-system telemetry.
pub const SYSTEM_DEVICE_ID: u32 = 65536;

/// Every metric the system can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricId {
    // Per-frame timing
    PresentStartQpc,
    PresentStartTime,
    BetweenPresents,
    InPresentApi,
    UntilRenderStart,
    UntilRenderComplete,
    GpuDuration,
    VideoDuration,
    SinceInput,

    // CPU
    CpuStartQpc,
    CpuStartTime,
    CpuBusy,
    CpuWait,
    /// Documented alias: resolves to the frame's total CPU time.
    BetweenAppStart,

    // GPU
    GpuLatency,
    GpuBusy,
    GpuWait,
    VideoBusy,

    // Display
    UntilDisplayed,
    BetweenDisplayChange,
    DisplayedTime,
    DisplayLatency,
    ScreenTimeQpc,

    // Input latency
    ClickToPhotonLatency,
    AllInputToPhotonLatency,
    InstrumentedInputToPhotonLatency,
    PcLatency,

    // Animation
    AnimationError,
    AnimationTime,

    // Instrumented
    InstrumentedLatency,
    InstrumentedRenderLatency,
    InstrumentedSleep,
    InstrumentedGpuLatency,
    ReadyTimeToDisplayLatency,
    BetweenSimStarts,

    // Vendor
    FlipDelay,

    // Rates
    PresentedFps,
    DisplayedFps,
    ApplicationFps,

    // Classification and passthroughs
    FrameType,
    DroppedFrames,
    SyncInterval,
    PresentFlags,
    PresentMode,
    PresentRuntime,
    AllowsTearing,
    SwapChainAddress,

    // GPU telemetry
    GpuPower,
    GpuTemperature,
    GpuUtilization,
    GpuFrequency,
    GpuMemUsed,
    GpuFanSpeed,

    // System telemetry
    CpuUtilization,
    CpuPower,
    CpuTemperature,
    CpuFrequency,

    // Statics
    Application,
    GpuName,
    GpuVendor,
    CpuName,
    CpuVendor,
}

/// Statistics computable by the dynamic query engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatId {
    None,
    Avg,
    NonZeroAvg,
    Percentile01,
    Percentile05,
    Percentile10,
    Percentile90,
    Percentile95,
    Percentile99,
    Min,
    Max,
    OldestPoint,
    MidPoint,
    NewestPoint,
}

impl StatId {
    pub fn is_point(self) -> bool {
        matches!(self, StatId::OldestPoint | StatId::MidPoint | StatId::NewestPoint)
    }

    pub fn percentile(self) -> Option<f64> {
        match self {
            StatId::Percentile01 => Some(0.01),
            StatId::Percentile05 => Some(0.05),
            StatId::Percentile10 => Some(0.10),
            StatId::Percentile90 => Some(0.90),
            StatId::Percentile95 => Some(0.95),
            StatId::Percentile99 => Some(0.99),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            StatId::None => "none",
            StatId::Avg => "avg",
            StatId::NonZeroAvg => "non-zero avg",
            StatId::Percentile01 => "1%",
            StatId::Percentile05 => "5%",
            StatId::Percentile10 => "10%",
            StatId::Percentile90 => "90%",
            StatId::Percentile95 => "95%",
            StatId::Percentile99 => "99%",
            StatId::Min => "min",
            StatId::Max => "max",
            StatId::OldestPoint => "oldest",
            StatId::MidPoint => "mid",
            StatId::NewestPoint => "newest",
        }
    }
}

pub const ALL_STATS: &[StatId] = &[
    StatId::Avg,
    StatId::NonZeroAvg,
    StatId::Percentile01,
    StatId::Percentile05,
    StatId::Percentile10,
    StatId::Percentile90,
    StatId::Percentile95,
    StatId::Percentile99,
    StatId::Min,
    StatId::Max,
    StatId::OldestPoint,
    StatId::MidPoint,
    StatId::NewestPoint,
];

/// Wire representation of a metric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Double,
    Uint64,
    Uint32,
    Int32,
    Enum,
    Bool,
    /// Fixed-size UTF-8 buffer for static name metrics.
    String,
}

impl DataType {
    pub fn size(self) -> usize {
        match self {
            DataType::Double | DataType::Uint64 => 8,
            DataType::Uint32 | DataType::Int32 | DataType::Enum => 4,
            DataType::Bool => 1,
            DataType::String => 260,
        }
    }

    pub fn alignment(self) -> usize {
        match self {
            DataType::Double | DataType::Uint64 => 8,
            DataType::Uint32 | DataType::Int32 | DataType::Enum => 4,
            DataType::Bool | DataType::String => 1,
        }
    }
}

/// Enumerations exposed through introspection so clients can decode enum
/// typed blob values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnumId {
    FrameType,
    PresentMode,
    PresentRuntime,
    DeviceVendor,
}

pub fn enum_values(id: EnumId) -> &'static [(i32, &'static str)] {
    match id {
        EnumId::FrameType => &[
            (0, "Not Set"),
            (1, "Application"),
            (2, "Repeated"),
            (3, "Intel"),
            (4, "AMD"),
            (5, "NVIDIA"),
        ],
        EnumId::PresentMode => &[
            (0, "Unknown"),
            (1, "Hardware: Legacy Flip"),
            (2, "Hardware: Legacy Copy to Front Buffer"),
            (3, "Hardware: Direct Flip"),
            (4, "Hardware: Independent Flip"),
            (5, "Composed: Flip"),
            (6, "Composed: Copy with GPU GDI"),
            (7, "Composed: Copy with CPU GDI"),
            (8, "Composed: Composition Atlas"),
            (9, "Hardware Composed: Independent Flip"),
        ],
        EnumId::PresentRuntime => &[(0, "DXGI"), (1, "D3D9"), (2, "Other")],
        EnumId::DeviceVendor => &[(0, "Unknown"), (1, "Intel"), (2, "AMD"), (3, "NVIDIA")],
    }
}

pub fn frame_type_value(t: FrameType) -> i32 {
    match t {
        FrameType::NotSet => 0,
        FrameType::Application => 1,
        FrameType::Repeated => 2,
        FrameType::Intel => 3,
        FrameType::Amd => 4,
        FrameType::Nvidia => 5,
    }
}

pub fn present_mode_value(m: PresentMode) -> i32 {
    match m {
        PresentMode::Unknown => 0,
        PresentMode::HardwareLegacyFlip => 1,
        PresentMode::HardwareLegacyCopyToFrontBuffer => 2,
        PresentMode::HardwareDirectFlip => 3,
        PresentMode::HardwareIndependentFlip => 4,
        PresentMode::ComposedFlip => 5,
        PresentMode::ComposedCopyGpuGdi => 6,
        PresentMode::ComposedCopyCpuGdi => 7,
        PresentMode::ComposedCompositionAtlas => 8,
        PresentMode::HardwareComposedIndependentFlip => 9,
    }
}

pub fn runtime_value(r: Runtime) -> i32 {
    match r {
        Runtime::Dxgi => 0,
        Runtime::D3d9 => 1,
        Runtime::Other => 2,
    }
}

/// Which kind of query a metric can appear in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Per-frame value, usable in both frame-event and dynamic queries.
    DynamicFrame,
    /// Telemetry sample stream, dynamic queries only.
    Dynamic,
    /// Resolved once at registration.
    Static,
}

/// Which device class serves a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Universal,
    System,
    Gpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceVendor {
    Unknown,
    Intel,
    Amd,
    Nvidia,
}

#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub id: u32,
    pub class: DeviceClass,
    pub vendor: DeviceVendor,
    pub name: String,
}

#[derive(Debug, Clone, Copy)]
pub struct MetricInfo {
    pub id: MetricId,
    pub name: &'static str,
    pub kind: MetricKind,
    /// Type of the value in a frame-event blob.
    pub frame_type: DataType,
    /// Type of a non-averaged dynamic stat output. Averages widen to Double.
    pub polled_type: DataType,
    pub enum_id: Option<EnumId>,
    pub device_class: DeviceClass,
}

impl MetricInfo {
    pub fn supports_stat(&self, stat: StatId) -> bool {
        match self.kind {
            MetricKind::Static => stat == StatId::None,
            _ => self.polled_type != DataType::String && stat != StatId::None,
        }
    }
}

macro_rules! metric_table {
    ($(($id:ident, $name:literal, $kind:ident, $frame:ident, $polled:ident, $enum_id:expr, $class:ident)),* $(,)?) => {
        pub const METRIC_TABLE: &[MetricInfo] = &[
            $(MetricInfo {
                id: MetricId::$id,
                name: $name,
                kind: MetricKind::$kind,
                frame_type: DataType::$frame,
                polled_type: DataType::$polled,
                enum_id: $enum_id,
                device_class: DeviceClass::$class,
            }),*
        ];
    };
}

metric_table![
    (PresentStartQpc, "Present Start QPC", DynamicFrame, Uint64, Uint64, None, Universal),
    (PresentStartTime, "Present Start Time", DynamicFrame, Double, Double, None, Universal),
    (BetweenPresents, "Between Presents", DynamicFrame, Double, Double, None, Universal),
    (InPresentApi, "In Present API", DynamicFrame, Double, Double, None, Universal),
    (UntilRenderStart, "Until Render Start", DynamicFrame, Double, Double, None, Universal),
    (UntilRenderComplete, "Until Render Complete", DynamicFrame, Double, Double, None, Universal),
    (GpuDuration, "GPU Duration", DynamicFrame, Double, Double, None, Universal),
    (VideoDuration, "Video Duration", DynamicFrame, Double, Double, None, Universal),
    (SinceInput, "Since Input", DynamicFrame, Double, Double, None, Universal),
    (CpuStartQpc, "CPU Start QPC", DynamicFrame, Uint64, Uint64, None, Universal),
    (CpuStartTime, "CPU Start Time", DynamicFrame, Double, Double, None, Universal),
    (CpuBusy, "CPU Busy", DynamicFrame, Double, Double, None, Universal),
    (CpuWait, "CPU Wait", DynamicFrame, Double, Double, None, Universal),
    (BetweenAppStart, "Between App Start", DynamicFrame, Double, Double, None, Universal),
    (GpuLatency, "GPU Latency", DynamicFrame, Double, Double, None, Universal),
    (GpuBusy, "GPU Busy", DynamicFrame, Double, Double, None, Universal),
    (GpuWait, "GPU Wait", DynamicFrame, Double, Double, None, Universal),
    (VideoBusy, "Video Busy", DynamicFrame, Double, Double, None, Universal),
    (UntilDisplayed, "Until Displayed", DynamicFrame, Double, Double, None, Universal),
    (BetweenDisplayChange, "Between Display Change", DynamicFrame, Double, Double, None, Universal),
    (DisplayedTime, "Displayed Time", DynamicFrame, Double, Double, None, Universal),
    (DisplayLatency, "Display Latency", DynamicFrame, Double, Double, None, Universal),
    (ScreenTimeQpc, "Screen Time QPC", DynamicFrame, Uint64, Uint64, None, Universal),
    (ClickToPhotonLatency, "Click To Photon Latency", DynamicFrame, Double, Double, None, Universal),
    (AllInputToPhotonLatency, "All Input To Photon Latency", DynamicFrame, Double, Double, None, Universal),
    (InstrumentedInputToPhotonLatency, "Instrumented Input To Photon Latency", DynamicFrame, Double, Double, None, Universal),
    (PcLatency, "PC Latency", DynamicFrame, Double, Double, None, Universal),
    (AnimationError, "Animation Error", DynamicFrame, Double, Double, None, Universal),
    (AnimationTime, "Animation Time", DynamicFrame, Double, Double, None, Universal),
    (InstrumentedLatency, "Instrumented Latency", DynamicFrame, Double, Double, None, Universal),
    (InstrumentedRenderLatency, "Instrumented Render Latency", DynamicFrame, Double, Double, None, Universal),
    (InstrumentedSleep, "Instrumented Sleep", DynamicFrame, Double, Double, None, Universal),
    (InstrumentedGpuLatency, "Instrumented GPU Latency", DynamicFrame, Double, Double, None, Universal),
    (ReadyTimeToDisplayLatency, "Ready Time To Display Latency", DynamicFrame, Double, Double, None, Universal),
    (BetweenSimStarts, "Between Simulation Starts", DynamicFrame, Double, Double, None, Universal),
    (FlipDelay, "Flip Delay", DynamicFrame, Double, Double, None, Universal),
    (PresentedFps, "Presented FPS", DynamicFrame, Double, Double, None, Universal),
    (DisplayedFps, "Displayed FPS", DynamicFrame, Double, Double, None, Universal),
    (ApplicationFps, "Application FPS", DynamicFrame, Double, Double, None, Universal),
    (FrameType, "Frame Type", DynamicFrame, Enum, Enum, Some(EnumId::FrameType), Universal),
    (DroppedFrames, "Dropped Frames", DynamicFrame, Bool, Bool, None, Universal),
    (SyncInterval, "Sync Interval", DynamicFrame, Int32, Int32, None, Universal),
    (PresentFlags, "Present Flags", DynamicFrame, Uint32, Uint32, None, Universal),
    (PresentMode, "Present Mode", DynamicFrame, Enum, Enum, Some(EnumId::PresentMode), Universal),
    (PresentRuntime, "Present Runtime", DynamicFrame, Enum, Enum, Some(EnumId::PresentRuntime), Universal),
    (AllowsTearing, "Allows Tearing", DynamicFrame, Bool, Bool, None, Universal),
    (SwapChainAddress, "Swap Chain Address", DynamicFrame, Uint64, Uint64, None, Universal),
    (GpuPower, "GPU Power", Dynamic, Double, Double, None, Gpu),
    (GpuTemperature, "GPU Temperature", Dynamic, Double, Double, None, Gpu),
    (GpuUtilization, "GPU Utilization", Dynamic, Double, Double, None, Gpu),
    (GpuFrequency, "GPU Frequency", Dynamic, Double, Double, None, Gpu),
    (GpuMemUsed, "GPU Memory Used", Dynamic, Uint64, Uint64, None, Gpu),
    (GpuFanSpeed, "GPU Fan Speed", Dynamic, Double, Double, None, Gpu),
    (CpuUtilization, "CPU Utilization", Dynamic, Double, Double, None, System),
    (CpuPower, "CPU Power", Dynamic, Double, Double, None, System),
    (CpuTemperature, "CPU Temperature", Dynamic, Double, Double, None, System),
    (CpuFrequency, "CPU Frequency", Dynamic, Double, Double, None, System),
    (Application, "Application", Static, String, String, None, Universal),
    (GpuName, "GPU Name", Static, String, String, None, Gpu),
    (GpuVendor, "GPU Vendor", Static, Enum, Enum, Some(EnumId::DeviceVendor), Gpu),
    (CpuName, "CPU Name", Static, String, String, None, System),
    (CpuVendor, "CPU Vendor", Static, Enum, Enum, Some(EnumId::DeviceVendor), System),
];

/// Self-describing metadata tree: which metrics exist, their types and stat
/// support, and which devices serve them. Clients use it to validate queries
/// and resolve blob layouts before registering.
#[derive(Debug, Clone)]
pub struct Introspection {
    metrics: IndexMap<MetricId, MetricInfo>,
    devices: IndexMap<u32, DeviceInfo>,
}

impl Default for Introspection {
    fn default() -> Self {
        Self::new()
    }
}

impl Introspection {
    pub fn new() -> Self {
        let metrics = METRIC_TABLE.iter().map(|m| (m.id, *m)).collect();
        let mut devices = IndexMap::new();
        devices.insert(
            UNIVERSAL_DEVICE_ID,
            DeviceInfo {
                id: UNIVERSAL_DEVICE_ID,
                class: DeviceClass::Universal,
                vendor: DeviceVendor::Unknown,
                name: "Universal".to_string(),
            },
        );
        devices.insert(
            SYSTEM_DEVICE_ID,
            DeviceInfo {
                id: SYSTEM_DEVICE_ID,
                class: DeviceClass::System,
                vendor: DeviceVendor::Unknown,
                name: "System".to_string(),
            },
        );
        Self { metrics, devices }
    }

    /// Registers a GPU adapter. Ids 1..SYSTEM_DEVICE_ID are valid adapter
    /// ids.
    pub fn add_gpu_device(&mut self, id: u32, vendor: DeviceVendor, name: &str) -> Result<()> {
        if id == UNIVERSAL_DEVICE_ID || id >= SYSTEM_DEVICE_ID {
            return Err(ServiceError::OutOfRange(format!(
                "gpu device id {id} collides with a reserved id"
            )));
        }
        self.devices.insert(
            id,
            DeviceInfo {
                id,
                class: DeviceClass::Gpu,
                vendor,
                name: name.to_string(),
            },
        );
        Ok(())
    }

    pub fn find_metric(&self, id: MetricId) -> Result<&MetricInfo> {
        self.metrics
            .get(&id)
            .ok_or_else(|| ServiceError::QueryMalformed(format!("unknown metric {id:?}")))
    }

    pub fn find_device(&self, id: u32) -> Result<&DeviceInfo> {
        self.devices
            .get(&id)
            .ok_or_else(|| ServiceError::QueryMalformed(format!("unknown device id {id}")))
    }

    pub fn metrics(&self) -> impl Iterator<Item = &MetricInfo> {
        self.metrics.values()
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceInfo> {
        self.devices.values()
    }

    /// Checks that `device_id` can serve `metric`.
    pub fn validate_binding(&self, metric: &MetricInfo, device_id: u32) -> Result<()> {
        let device = self.find_device(device_id)?;
        if device.class == metric.device_class {
            Ok(())
        } else {
            Err(ServiceError::QueryMalformed(format!(
                "metric {:?} is not served by device {}",
                metric.id, device_id
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_metric_is_listed_once() {
        let intro = Introspection::new();
        assert_eq!(intro.metrics().count(), METRIC_TABLE.len());
    }

    #[test]
    fn static_string_metrics_support_no_stats() {
        let intro = Introspection::new();
        let app = intro.find_metric(MetricId::Application).unwrap();
        assert!(!app.supports_stat(StatId::Avg));
        assert!(app.supports_stat(StatId::None));
        let busy = intro.find_metric(MetricId::CpuBusy).unwrap();
        assert!(busy.supports_stat(StatId::Avg));
        assert!(busy.supports_stat(StatId::Percentile99));
    }

    #[test]
    fn device_binding_validation() {
        let mut intro = Introspection::new();
        intro
            .add_gpu_device(1, DeviceVendor::Intel, "Arc A770")
            .unwrap();
        let gpu_power = *intro.find_metric(MetricId::GpuPower).unwrap();
        assert!(intro.validate_binding(&gpu_power, 1).is_ok());
        assert!(intro.validate_binding(&gpu_power, UNIVERSAL_DEVICE_ID).is_err());
        assert!(intro.validate_binding(&gpu_power, SYSTEM_DEVICE_ID).is_err());

        let cpu_busy = *intro.find_metric(MetricId::CpuBusy).unwrap();
        assert!(intro.validate_binding(&cpu_busy, UNIVERSAL_DEVICE_ID).is_ok());
        assert!(intro.validate_binding(&cpu_busy, 1).is_err());

        assert!(intro.add_gpu_device(SYSTEM_DEVICE_ID, DeviceVendor::Amd, "x").is_err());
    }

    #[test]
    fn reserved_device_ids_are_kept_distinct() {
        assert_eq!(UNIVERSAL_DEVICE_ID, 0);
        assert_eq!(SYSTEM_DEVICE_ID, 65536);
    }
}
