use rustc_hash::{FxHashMap, FxHashSet};
use serde_derive::{Deserialize, Serialize};

use crate::error::{Result, ServiceError};
use crate::intro::MetricId;

/// Build identity exchanged during session open. Client and service must
/// match exactly.
pub const BUILD_ID: &str = env!("CARGO_PKG_VERSION");

pub const TELEMETRY_PERIOD_MS_MIN: u32 = 4;
pub const TELEMETRY_PERIOD_MS_MAX: u32 = 5000;
pub const ETW_FLUSH_PERIOD_MS_MIN: u32 = 8;
pub const ETW_FLUSH_PERIOD_MS_MAX: u32 = 1000;

/// One `{metric, device, array}` usage declaration. The service aggregates
/// these across clients to gate telemetry collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricUse {
    pub metric: MetricId,
    pub device_id: u32,
    pub array_index: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenSessionParams {
    pub client_pid: u32,
    pub client_build_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenSessionResponse {
    pub service_build_id: String,
    /// Name prefix and salt identifying the published store segment.
    pub store_prefix: String,
    pub store_salt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StartTrackingParams {
    pub target_pid: u32,
    pub is_playback: bool,
    pub is_backpressured: bool,
}

/// Every request the control channel accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Action {
    OpenSession(OpenSessionParams),
    StartTracking(StartTrackingParams),
    StopTracking { target_pid: u32 },
    SetTelemetryPeriod { period_ms: u32 },
    SetEtwFlushPeriod { period_ms: Option<u32> },
    ReportMetricUse { uses: Vec<MetricUse> },
    StartEtlLogging,
    FinishEtlLogging { handle: u32 },
    StopPlayback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActionResponse {
    SessionOpened(OpenSessionResponse),
    EtlLoggingStarted { handle: u32 },
    EtlLoggingFinished { file_path: String },
    Done,
}

/// Request envelope. The token correlates a response to its request on the
/// duplex channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub token: u64,
    pub action: Action,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub token: u64,
    pub result: std::result::Result<ActionResponse, ServiceError>,
}

/// The service operations a control session drives. Implemented by the
/// service host; the dispatcher below owns session bookkeeping only.
pub trait ServiceControl {
    fn is_playback(&self) -> bool;
    fn store_identity(&self) -> (String, u32);
    fn start_tracking(&self, pid: u32, is_playback: bool, is_backpressured: bool) -> Result<()>;
    fn stop_tracking(&self, pid: u32) -> Result<()>;
    fn set_telemetry_period(&self, period_ms: u32);
    fn set_etw_flush_period(&self, period_ms: Option<u32>);
    fn publish_metric_use(&self, uses: &[MetricUse]);
    fn retract_metric_use(&self, uses: &[MetricUse]);
    fn start_etl_logging(&self) -> Result<u32>;
    fn finish_etl_logging(&self, handle: u32) -> Result<String>;
    fn stop_playback(&self) -> Result<()>;
}

/// Server-side state of one control connection.
///
/// Tracks which pids and metric uses this client holds so that dropping the
/// session (client disconnect) releases everything it acquired.
pub struct ControlSession<C: ServiceControl> {
    control: C,
    open: bool,
    tracked_pids: FxHashSet<u32>,
    published_uses: Vec<MetricUse>,
}

impl<C: ServiceControl> ControlSession<C> {
    pub fn new(control: C) -> Self {
        Self {
            control,
            open: false,
            tracked_pids: FxHashSet::default(),
            published_uses: Vec::new(),
        }
    }

    pub fn handle(&mut self, request: Request) -> Response {
        let result = self.dispatch(request.action);
        Response {
            token: request.token,
            result,
        }
    }

    fn dispatch(&mut self, action: Action) -> std::result::Result<ActionResponse, ServiceError> {
        if let Action::OpenSession(params) = &action {
            if params.client_build_id != BUILD_ID {
                return Err(ServiceError::VersionMismatch {
                    client: params.client_build_id.clone(),
                    service: BUILD_ID.to_string(),
                });
            }
            self.open = true;
            let (store_prefix, store_salt) = self.control.store_identity();
            return Ok(ActionResponse::SessionOpened(OpenSessionResponse {
                service_build_id: BUILD_ID.to_string(),
                store_prefix,
                store_salt,
            }));
        }

        if !self.open {
            return Err(ServiceError::SessionNotOpen);
        }

        match action {
            Action::OpenSession(_) => unreachable!("handled above"),
            Action::StartTracking(params) => {
                if params.is_playback != self.control.is_playback() {
                    return Err(ServiceError::ModeMismatch);
                }
                if self.tracked_pids.contains(&params.target_pid) {
                    return Err(ServiceError::AlreadyTrackingProcess(params.target_pid));
                }
                self.control.start_tracking(
                    params.target_pid,
                    params.is_playback,
                    params.is_backpressured,
                )?;
                self.tracked_pids.insert(params.target_pid);
                Ok(ActionResponse::Done)
            }
            Action::StopTracking { target_pid } => {
                if !self.tracked_pids.contains(&target_pid) {
                    return Err(ServiceError::InvalidPid(target_pid));
                }
                self.control.stop_tracking(target_pid)?;
                self.tracked_pids.remove(&target_pid);
                Ok(ActionResponse::Done)
            }
            Action::SetTelemetryPeriod { period_ms } => {
                let clamped = period_ms.clamp(TELEMETRY_PERIOD_MS_MIN, TELEMETRY_PERIOD_MS_MAX);
                self.control.set_telemetry_period(clamped);
                Ok(ActionResponse::Done)
            }
            Action::SetEtwFlushPeriod { period_ms } => {
                let clamped = period_ms
                    .map(|ms| ms.clamp(ETW_FLUSH_PERIOD_MS_MIN, ETW_FLUSH_PERIOD_MS_MAX));
                self.control.set_etw_flush_period(clamped);
                Ok(ActionResponse::Done)
            }
            Action::ReportMetricUse { uses } => {
                self.control.publish_metric_use(&uses);
                self.published_uses.extend(uses);
                Ok(ActionResponse::Done)
            }
            Action::StartEtlLogging => {
                let handle = self.control.start_etl_logging()?;
                Ok(ActionResponse::EtlLoggingStarted { handle })
            }
            Action::FinishEtlLogging { handle } => {
                let file_path = self.control.finish_etl_logging(handle)?;
                Ok(ActionResponse::EtlLoggingFinished { file_path })
            }
            Action::StopPlayback => {
                self.control.stop_playback()?;
                Ok(ActionResponse::Done)
            }
        }
    }
}

impl<C: ServiceControl> Drop for ControlSession<C> {
    fn drop(&mut self) {
        for pid in self.tracked_pids.drain() {
            if let Err(err) = self.control.stop_tracking(pid) {
                log::warn!("failed to release tracking of pid {pid} on disconnect: {err}");
            }
        }
        if !self.published_uses.is_empty() {
            self.control.retract_metric_use(&self.published_uses);
        }
    }
}

/// Mutex-guarded, refcounted union of every client's declared metric use.
/// Telemetry producers consult it so unqueried metrics are never collected.
#[derive(Debug, Default)]
pub struct MetricUseAggregator {
    uses: FxHashMap<MetricUse, usize>,
}

impl MetricUseAggregator {
    pub fn publish(&mut self, uses: &[MetricUse]) {
        for u in uses {
            *self.uses.entry(*u).or_insert(0) += 1;
        }
    }

    pub fn retract(&mut self, uses: &[MetricUse]) {
        for u in uses {
            if let Some(count) = self.uses.get_mut(u) {
                *count -= 1;
                if *count == 0 {
                    self.uses.remove(u);
                }
            }
        }
    }

    pub fn is_used(&self, u: &MetricUse) -> bool {
        self.uses.contains_key(u)
    }

    /// True when any client declared use of any metric on the device.
    pub fn device_has_uses(&self, device_id: u32) -> bool {
        self.uses.keys().any(|u| u.device_id == device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct FakeService {
        playback: bool,
        stop_calls: Arc<AtomicU32>,
    }

    impl ServiceControl for &FakeService {
        fn is_playback(&self) -> bool {
            self.playback
        }
        fn store_identity(&self) -> (String, u32) {
            ("framemon_store".to_string(), 0x5eed)
        }
        fn start_tracking(&self, pid: u32, _: bool, _: bool) -> Result<()> {
            if pid == 0 {
                return Err(ServiceError::InvalidPid(pid));
            }
            Ok(())
        }
        fn stop_tracking(&self, _pid: u32) -> Result<()> {
            self.stop_calls.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        fn set_telemetry_period(&self, _period_ms: u32) {}
        fn set_etw_flush_period(&self, _period_ms: Option<u32>) {}
        fn publish_metric_use(&self, _uses: &[MetricUse]) {}
        fn retract_metric_use(&self, _uses: &[MetricUse]) {}
        fn start_etl_logging(&self) -> Result<u32> {
            Ok(1)
        }
        fn finish_etl_logging(&self, _handle: u32) -> Result<String> {
            Ok("trace.etl".to_string())
        }
        fn stop_playback(&self) -> Result<()> {
            Err(ServiceError::ModeMismatch)
        }
    }

    fn open_session(session: &mut ControlSession<&FakeService>) {
        let response = session.handle(Request {
            token: 1,
            action: Action::OpenSession(OpenSessionParams {
                client_pid: 100,
                client_build_id: BUILD_ID.to_string(),
            }),
        });
        assert!(response.result.is_ok());
    }

    #[test]
    fn requests_before_open_session_are_rejected() {
        let service = FakeService::default();
        let mut session = ControlSession::new(&service);
        let response = session.handle(Request {
            token: 7,
            action: Action::StopPlayback,
        });
        assert_eq!(response.token, 7);
        assert_eq!(response.result, Err(ServiceError::SessionNotOpen));
    }

    #[test]
    fn version_mismatch_rejects_session() {
        let service = FakeService::default();
        let mut session = ControlSession::new(&service);
        let response = session.handle(Request {
            token: 2,
            action: Action::OpenSession(OpenSessionParams {
                client_pid: 100,
                client_build_id: "0.0.0-other".to_string(),
            }),
        });
        assert!(matches!(
            response.result,
            Err(ServiceError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn duplicate_tracking_is_an_error_without_state_change() {
        let service = FakeService::default();
        let mut session = ControlSession::new(&service);
        open_session(&mut session);

        let start = Action::StartTracking(StartTrackingParams {
            target_pid: 42,
            is_playback: false,
            is_backpressured: false,
        });
        assert!(session.handle(Request { token: 3, action: start.clone() }).result.is_ok());
        assert_eq!(
            session.handle(Request { token: 4, action: start }).result,
            Err(ServiceError::AlreadyTrackingProcess(42))
        );

        // Untracking twice reports the second as an invalid pid.
        let stop = Action::StopTracking { target_pid: 42 };
        assert!(session.handle(Request { token: 5, action: stop.clone() }).result.is_ok());
        assert_eq!(
            session.handle(Request { token: 6, action: stop }).result,
            Err(ServiceError::InvalidPid(42))
        );
    }

    #[test]
    fn playback_mode_mismatch_is_rejected() {
        let service = FakeService::default();
        let mut session = ControlSession::new(&service);
        open_session(&mut session);
        let response = session.handle(Request {
            token: 3,
            action: Action::StartTracking(StartTrackingParams {
                target_pid: 42,
                is_playback: true,
                is_backpressured: false,
            }),
        });
        assert_eq!(response.result, Err(ServiceError::ModeMismatch));
    }

    #[test]
    fn dropping_a_session_releases_its_tracked_pids() {
        let service = FakeService::default();
        let stop_calls = service.stop_calls.clone();
        {
            let mut session = ControlSession::new(&service);
            open_session(&mut session);
            for pid in [10, 11] {
                let response = session.handle(Request {
                    token: 0,
                    action: Action::StartTracking(StartTrackingParams {
                        target_pid: pid,
                        is_playback: false,
                        is_backpressured: false,
                    }),
                });
                assert!(response.result.is_ok());
            }
        }
        assert_eq!(stop_calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn responses_echo_the_correlation_token() {
        let service = FakeService::default();
        let mut session = ControlSession::new(&service);
        let request = Request {
            token: 0xdead_beef,
            action: Action::OpenSession(OpenSessionParams {
                client_pid: 1,
                client_build_id: BUILD_ID.to_string(),
            }),
        };
        assert_eq!(session.handle(request).token, 0xdead_beef);
    }

    #[test]
    fn wire_types_round_trip_through_json() {
        let request = Request {
            token: 99,
            action: Action::ReportMetricUse {
                uses: vec![MetricUse {
                    metric: MetricId::GpuPower,
                    device_id: 1,
                    array_index: 0,
                }],
            },
        };
        let encoded = serde_json::to_string(&request).unwrap();
        let decoded: Request = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, request);

        let response = Response {
            token: 99,
            result: Err(ServiceError::AlreadyTrackingProcess(42)),
        };
        let encoded = serde_json::to_string(&response).unwrap();
        let decoded: Response = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn aggregator_refcounts_across_clients() {
        let mut agg = MetricUseAggregator::default();
        let use_a = MetricUse {
            metric: MetricId::GpuPower,
            device_id: 1,
            array_index: 0,
        };
        agg.publish(&[use_a]);
        agg.publish(&[use_a]);
        assert!(agg.is_used(&use_a));
        assert!(agg.device_has_uses(1));

        agg.retract(&[use_a]);
        assert!(agg.is_used(&use_a));
        agg.retract(&[use_a]);
        assert!(!agg.is_used(&use_a));
        assert!(!agg.device_has_uses(1));
    }
}
