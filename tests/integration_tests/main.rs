use std::sync::{Arc, RwLock};
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};

use framemon::control::ServiceControl;
use framemon::intro::{Introspection, MetricId, StatId, SYSTEM_DEVICE_ID, UNIVERSAL_DEVICE_ID};
use framemon::metrics::{MetricsVersion, UnifiedSwapChain};
use framemon::present::{FrameData, FrameType, PresentResult};
use framemon::query::{DynamicQuery, FrameEventQuery, QueryElement};
use framemon::service::{Service, ServiceConfig, TraceEvent};
use framemon::source::{FrameMetricsSource, DEFAULT_PER_SWAP_CHAIN_CAPACITY};
use framemon::telemetry::{DataStores, TelemetryValue};
use framemon::timebase::TimeBase;

// 10 MHz frequency: one tick is 100ns, 10,000 ticks per millisecond.
const FREQ: u64 = 10_000_000;

fn displayed_present(start: u64, screen: u64) -> FrameData {
    FrameData {
        present_start_time: start,
        time_in_present: 50,
        displayed: vec![(FrameType::Application, screen)],
        final_state: PresentResult::Presented,
        ..Default::default()
    }
}

#[test]
fn single_displayed_frame_resolves_after_its_successor() {
    let tb = TimeBase::new(FREQ);
    let mut chain = UnifiedSwapChain::new();

    let p1 = FrameData {
        present_start_time: 1000,
        time_in_present: 50,
        ready_time: 1100,
        displayed: vec![(FrameType::Application, 1200)],
        final_state: PresentResult::Presented,
        ..Default::default()
    };
    assert!(chain.enqueue(&tb, p1, MetricsVersion::V2).is_empty());

    let p2 = displayed_present(2000, 2200);
    let out = chain.enqueue(&tb, p2, MetricsVersion::V2);
    assert_eq!(out.len(), 1);
    let m = &out[0].metrics;
    assert!((m.ms_in_present_api - 0.005).abs() < 1e-9);
    assert!((m.ms_until_render_complete - 0.010).abs() < 1e-9);
    assert!((m.ms_until_displayed - 0.020).abs() < 1e-9);
    assert_eq!(m.ms_between_presents, 0.0);
    assert!(!m.is_dropped_frame);
}

#[test]
fn dropped_frame_credits_its_input_to_the_next_displayed_frame() {
    let tb = TimeBase::new(FREQ);
    let mut chain = UnifiedSwapChain::new();

    // Baseline so the dropped present is not the seed.
    chain.enqueue(&tb, displayed_present(400, 450), MetricsVersion::V2);

    let dropped = FrameData {
        present_start_time: 1000,
        time_in_present: 50,
        input_time: 500,
        final_state: PresentResult::Discarded,
        ..Default::default()
    };
    let shown = FrameData {
        present_start_time: 1500,
        time_in_present: 50,
        displayed: vec![(FrameType::Application, 2000)],
        final_state: PresentResult::Presented,
        ..Default::default()
    };

    // The dropped present is blocked behind the waiting seed present and
    // releases when the displayed one arrives.
    assert!(chain.enqueue(&tb, dropped, MetricsVersion::V2).is_empty());
    let out = chain.enqueue(&tb, shown, MetricsVersion::V2);
    let dropped_record = out
        .iter()
        .find(|c| c.metrics.present_start_qpc == 1000)
        .unwrap();
    assert_eq!(dropped_record.metrics.ms_all_input_photon_latency, None);
    assert!(dropped_record.metrics.is_dropped_frame);
    assert_eq!(chain.core.last_received_not_displayed_all_input_time, 500);

    // Flush the displayed present with a successor; it consumes the pending
    // input even though it carries none of its own.
    let out = chain.enqueue(&tb, displayed_present(3000, 3100), MetricsVersion::V2);
    let shown_record = out
        .iter()
        .find(|c| c.metrics.present_start_qpc == 1500)
        .unwrap();
    let latency = shown_record.metrics.ms_all_input_photon_latency.unwrap();
    assert!((latency - 0.150).abs() < 1e-9);

    assert_eq!(chain.core.last_received_not_displayed_all_input_time, 0);
    assert_eq!(chain.core.last_received_not_displayed_mouse_click_time, 0);
    assert_eq!(chain.core.last_received_not_displayed_app_provider_input_time, 0);
    assert_eq!(chain.core.last_received_not_displayed_pcl_sim_start, 0);
    assert_eq!(chain.core.last_received_not_displayed_pcl_input_time, 0);
}

#[test]
fn collapsed_nvidia_frame_is_corrected_against_its_successor() {
    let tb = TimeBase::new(FREQ);
    let mut chain = UnifiedSwapChain::new();

    chain.enqueue(&tb, displayed_present(500, 1000), MetricsVersion::V2);

    let runt = FrameData {
        present_start_time: 1000,
        time_in_present: 50,
        flip_delay: 100,
        displayed: vec![(FrameType::Nvidia, 1500)],
        final_state: PresentResult::Presented,
        ..Default::default()
    };
    chain.enqueue(&tb, runt, MetricsVersion::V2);

    let next = FrameData {
        present_start_time: 2000,
        time_in_present: 50,
        displayed: vec![(FrameType::Application, 1400)],
        final_state: PresentResult::Presented,
        ..Default::default()
    };
    let out = chain.enqueue(&tb, next, MetricsVersion::V2);
    let runt_record = out
        .iter()
        .find(|c| c.metrics.present_start_qpc == 1000)
        .unwrap();
    assert!((runt_record.metrics.ms_until_displayed - 0.050).abs() < 1e-9);

    // The correction landed on the successor: flip delay inherited and its
    // screen time pinned to the runt's.
    let out = chain.enqueue(&tb, displayed_present(3000, 3200), MetricsVersion::V2);
    let next_record = out
        .iter()
        .find(|c| c.metrics.present_start_qpc == 2000)
        .unwrap();
    assert_eq!(next_record.metrics.screen_time_qpc, 1500);
    assert_eq!(next_record.metrics.ms_flip_delay, Some(0.010));
}

#[test]
fn pc_latency_ema_converges_across_the_pipeline() {
    let tb = TimeBase::new(FREQ);
    let mut chain = UnifiedSwapChain::new();

    // Input-to-sim deltas of 5ms, 10ms, 15ms.
    let frames = [
        (1_000_000u64, 50_000u64),
        (2_000_000, 100_000),
        (3_000_000, 150_000),
    ];
    let mut presents = Vec::new();
    for (sim, delta) in &frames {
        let start = sim + 10_000;
        presents.push(FrameData {
            present_start_time: start,
            time_in_present: 50,
            pcl_sim_start_time: *sim,
            pcl_input_ping_time: sim - delta,
            displayed: vec![(FrameType::Application, start + 100_000)],
            final_state: PresentResult::Presented,
            ..Default::default()
        });
    }
    // Flush frame.
    presents.push(displayed_present(4_000_000, 4_100_000));

    let mut records = Vec::new();
    for p in presents {
        records.extend(chain.enqueue(&tb, p, MetricsVersion::V2));
    }
    assert_eq!(records.len(), 3);

    let expected_ema = [5.0, 5.5, 6.45];
    for (record, ((sim, _), ema)) in records.iter().zip(frames.iter().zip(expected_ema)) {
        let screen = sim + 10_000 + 100_000;
        let expected = ema + tb.delta_signed_ms(*sim, screen);
        let actual = record.metrics.ms_pc_latency.unwrap();
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }
}

#[test]
fn dynamic_query_average_over_empty_window_is_zero() {
    let mut stores = DataStores::new();
    stores.open_process_store(7, 64, 0, false);
    let stores = Arc::new(RwLock::new(stores));
    let mut source =
        FrameMetricsSource::new(stores.clone(), FREQ, 7, DEFAULT_PER_SWAP_CHAIN_CAPACITY).unwrap();

    let tb = TimeBase::new(FREQ);
    let intro = Introspection::new();
    let mut elements = vec![QueryElement::new(
        MetricId::CpuBusy,
        StatId::Avg,
        UNIVERSAL_DEVICE_ID,
        0,
    )];
    let guard = stores.read().unwrap();
    let mut query = DynamicQuery::new(&mut elements, 100.0, 0.0, &tb, &intro, &guard).unwrap();
    drop(guard);

    let mut blob = vec![0xffu8; query.blob_size()];
    query
        .poll(&stores, Some(&mut source), 1_000_000, &mut blob)
        .unwrap();
    assert_eq!(LittleEndian::read_f64(&blob[..8]), 0.0);
}

#[test]
fn frame_query_blob_layout_is_padded_to_sixteen_bytes() {
    let intro = Introspection::new();
    let stores = DataStores::new();
    let mut elements = vec![
        QueryElement::new(MetricId::CpuBusy, StatId::None, UNIVERSAL_DEVICE_ID, 0),
        QueryElement::new(MetricId::DisplayLatency, StatId::None, UNIVERSAL_DEVICE_ID, 0),
        QueryElement::new(MetricId::SyncInterval, StatId::None, UNIVERSAL_DEVICE_ID, 0),
    ];
    let query = FrameEventQuery::new(&mut elements, &intro, &stores).unwrap();
    assert_eq!(elements[0].data_offset, 0);
    assert_eq!(elements[1].data_offset, 8);
    assert_eq!(elements[2].data_offset, 16);
    assert_eq!(query.blob_size(), 32);
}

fn wait_for<F: Fn() -> bool>(predicate: F) {
    for _ in 0..400 {
        if predicate() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("condition not reached in time");
}

#[test]
fn presents_flow_from_the_service_to_a_frame_query() {
    let _ = env_logger::builder().is_test(true).try_init();

    let service = Arc::new(Service::start(ServiceConfig::new(FREQ, 0)));
    service.start_tracking(7, false, false).unwrap();

    // System telemetry joined to frames by CPU-start proximity.
    let stores = service.stores();
    {
        let mut guard = stores.write().unwrap();
        let system = guard.system_store_mut();
        system
            .telemetry
            .register(
                MetricId::CpuUtilization,
                framemon::intro::DataType::Double,
                1,
            )
            .unwrap();
        system
            .telemetry
            .push_sample(MetricId::CpuUtilization, 0, 1_000, TelemetryValue::Double(42.5))
            .unwrap();
    }

    let tx = service.event_sender();
    for (start, screen) in [(1_000, 1_200), (2_000, 2_200), (3_000, 3_200), (4_000, 4_200)] {
        let mut p = displayed_present(start, screen);
        p.process_id = 7;
        tx.send(TraceEvent::Present(Box::new(p))).unwrap();
    }
    wait_for(|| {
        let guard = stores.read().unwrap();
        guard
            .process_store(7)
            .map(|s| s.frames.len() == 4)
            .unwrap_or(false)
    });

    let mut source =
        FrameMetricsSource::new(stores.clone(), FREQ, 7, DEFAULT_PER_SWAP_CHAIN_CAPACITY).unwrap();

    let intro = Introspection::new();
    let mut elements = vec![
        QueryElement::new(MetricId::PresentStartQpc, StatId::None, UNIVERSAL_DEVICE_ID, 0),
        QueryElement::new(MetricId::UntilDisplayed, StatId::None, UNIVERSAL_DEVICE_ID, 0),
        QueryElement::new(MetricId::CpuUtilization, StatId::None, SYSTEM_DEVICE_ID, 0),
    ];
    let guard = stores.read().unwrap();
    let query = FrameEventQuery::new(&mut elements, &intro, &guard).unwrap();
    drop(guard);

    let mut out = vec![0u8; query.blob_size() * 8];
    let written = query.consume(&mut source, &stores, 8, &mut out).unwrap();
    // Four presents resolve to three records (the newest still waits for a
    // successor).
    assert_eq!(written, 3);

    let first = &out[..query.blob_size()];
    assert_eq!(
        LittleEndian::read_u64(&first[elements[0].data_offset..]),
        1_000
    );
    assert!(
        (LittleEndian::read_f64(&first[elements[1].data_offset..]) - 0.02).abs() < 1e-9
    );
    assert_eq!(
        LittleEndian::read_f64(&first[elements[2].data_offset..]),
        42.5
    );

    // No further records until new presents arrive.
    let written = query.consume(&mut source, &stores, 8, &mut out).unwrap();
    assert_eq!(written, 0);
}

#[test]
fn frame_query_layout_is_stable_across_reregistration() {
    let intro = Introspection::new();
    let stores = DataStores::new();
    let make = || {
        let mut elements = vec![
            QueryElement::new(MetricId::CpuBusy, StatId::None, UNIVERSAL_DEVICE_ID, 0),
            QueryElement::new(MetricId::DroppedFrames, StatId::None, UNIVERSAL_DEVICE_ID, 0),
            QueryElement::new(MetricId::DisplayLatency, StatId::None, UNIVERSAL_DEVICE_ID, 0),
        ];
        let query = FrameEventQuery::new(&mut elements, &intro, &stores).unwrap();
        (elements, query.blob_size())
    };
    let (layout_a, size_a) = make();
    let (layout_b, size_b) = make();
    assert_eq!(layout_a, layout_b);
    assert_eq!(size_a, size_b);
}

#[test]
fn dropped_frame_display_metrics_are_nan_in_frame_query_blobs() {
    let mut stores = DataStores::new();
    stores.open_process_store(7, 64, 0, false);
    {
        let store = stores.process_store_mut(7).unwrap();
        store.frames.push({
            let mut p = displayed_present(500, 600);
            p.process_id = 7;
            p
        });
        store.frames.push(FrameData {
            process_id: 7,
            present_start_time: 1_000,
            time_in_present: 50,
            final_state: PresentResult::Discarded,
            ..Default::default()
        });
        // Successor that flushes both queued records.
        store.frames.push({
            let mut p = displayed_present(2_000, 2_200);
            p.process_id = 7;
            p
        });
    }
    let stores = Arc::new(RwLock::new(stores));
    let mut source =
        FrameMetricsSource::new(stores.clone(), FREQ, 7, DEFAULT_PER_SWAP_CHAIN_CAPACITY).unwrap();

    let intro = Introspection::new();
    let mut elements = vec![
        QueryElement::new(MetricId::DisplayedTime, StatId::None, UNIVERSAL_DEVICE_ID, 0),
        QueryElement::new(MetricId::BetweenPresents, StatId::None, UNIVERSAL_DEVICE_ID, 0),
    ];
    let query = {
        let guard = stores.read().unwrap();
        FrameEventQuery::new(&mut elements, &intro, &guard).unwrap()
    };

    let mut out = vec![0u8; query.blob_size() * 4];
    let written = query.consume(&mut source, &stores, 4, &mut out).unwrap();
    assert_eq!(written, 2);

    // Second record is the dropped present.
    let record = &out[query.blob_size()..2 * query.blob_size()];
    assert!(LittleEndian::read_f64(&record[elements[0].data_offset..]).is_nan());
    let between = LittleEndian::read_f64(&record[elements[1].data_offset..]);
    assert!((between - 0.05).abs() < 1e-9);
}

#[test]
fn consumed_records_stream_to_csv() {
    use framemon::csv::{validate_header, CsvWriter};

    let mut stores = DataStores::new();
    stores.open_process_store(7, 64, 0, false);
    {
        let store = stores.process_store_mut(7).unwrap();
        for (start, screen) in [(1_000, 1_200), (2_000, 2_200), (3_000, 3_200)] {
            let mut p = displayed_present(start, screen);
            p.process_id = 7;
            store.frames.push(p);
        }
    }
    let stores = Arc::new(RwLock::new(stores));
    let mut source =
        FrameMetricsSource::new(stores, FREQ, 7, DEFAULT_PER_SWAP_CHAIN_CAPACITY).unwrap();

    let records = source.consume(16).unwrap();
    assert_eq!(records.len(), 2);

    let mut writer = CsvWriter::new(Vec::new(), MetricsVersion::V2).unwrap();
    for record in &records {
        writer.write_row("game.exe", 7, record).unwrap();
    }
    let text = String::from_utf8(writer.into_inner()).unwrap();
    let mut lines = text.lines();
    validate_header(lines.next().unwrap(), MetricsVersion::V2).unwrap();
    assert_eq!(lines.count(), records.len());
}

#[test]
fn dynamic_query_serves_stats_and_telemetry_points_over_a_window() {
    let mut stores = DataStores::new();
    stores.open_process_store(7, 64, 0, false);
    {
        let store = stores.process_store_mut(7).unwrap();
        // Presents every 1ms (10,000 ticks); each resolves when the next
        // arrives.
        for i in 0..10u64 {
            let start = 100_000 + i * 10_000;
            let mut p = displayed_present(start, start + 2_000);
            p.process_id = 7;
            store.frames.push(p);
        }
    }
    {
        let gpu = stores.register_gpu(1);
        gpu.telemetry
            .register(MetricId::GpuPower, framemon::intro::DataType::Double, 1)
            .unwrap();
        for i in 0..10u64 {
            gpu.telemetry
                .push_sample(
                    MetricId::GpuPower,
                    0,
                    100_000 + i * 10_000,
                    TelemetryValue::Double(100.0 + i as f64),
                )
                .unwrap();
        }
    }

    let stores = Arc::new(RwLock::new(stores));
    let mut source =
        FrameMetricsSource::new(stores.clone(), FREQ, 7, DEFAULT_PER_SWAP_CHAIN_CAPACITY).unwrap();

    let tb = TimeBase::new(FREQ);
    let mut intro = Introspection::new();
    intro
        .add_gpu_device(1, framemon::intro::DeviceVendor::Nvidia, "RTX")
        .unwrap();

    let mut elements = vec![
        QueryElement::new(MetricId::BetweenPresents, StatId::Avg, UNIVERSAL_DEVICE_ID, 0),
        QueryElement::new(
            MetricId::BetweenPresents,
            StatId::Percentile95,
            UNIVERSAL_DEVICE_ID,
            0,
        ),
        QueryElement::new(MetricId::GpuPower, StatId::NewestPoint, 1, 0),
    ];
    let mut query = {
        let guard = stores.read().unwrap();
        DynamicQuery::new(&mut elements, 10.0, 0.0, &tb, &intro, &guard).unwrap()
    };

    // Both stats over one metric share a binding yet land at distinct
    // offsets.
    assert_eq!(elements[0].data_offset, 0);
    assert_eq!(elements[1].data_offset, 8);
    assert_eq!(elements[2].data_offset, 16);

    let now = 100_000 + 9 * 10_000;
    let mut blob = vec![0u8; query.blob_size()];
    query.poll(&stores, Some(&mut source), now, &mut blob).unwrap();

    // Every resolved record inside the window has a 1ms gap to its
    // predecessor except the seed.
    let avg = LittleEndian::read_f64(&blob[..8]);
    assert!(avg > 0.0 && avg <= 1.0, "avg was {avg}");
    let p95 = LittleEndian::read_f64(&blob[8..16]);
    assert!((p95 - 1.0).abs() < 1e-9, "p95 was {p95}");
    let newest = LittleEndian::read_f64(&blob[16..24]);
    assert_eq!(newest, 109.0);
}
