use crate::metrics::animation::calculate_animation_metrics;
use crate::metrics::base::calculate_base_present_metrics;
use crate::metrics::chain_state::{AnimationErrorSource, SwapChainCoreState};
use crate::metrics::cpu_gpu::calculate_cpu_gpu_metrics;
use crate::metrics::display::{
    adjust_screen_time_for_collapsed_present, calculate_display_metrics, DisplayIndexing,
};
use crate::metrics::input::calculate_input_latency_metrics;
use crate::metrics::instrumented::{calculate_instrumented_metrics, calculate_pc_latency};
use crate::metrics::types::{ComputedMetrics, MetricsVersion};
use crate::present::{FrameData, FrameType};
use crate::timebase::TimeBase;

/// Exponential moving average step; a zero running value seeds directly.
pub fn calculate_ema(current: f64, value: f64, alpha: f64) -> f64 {
    if current == 0.0 {
        value
    } else {
        current + alpha * (value - current)
    }
}

/// Resolves the CPU start time of the frame: the point where the previous
/// app present left the present call.
pub fn calculate_cpu_start(chain: &SwapChainCoreState, _present: &FrameData) -> u64 {
    if let Some(last_app) = &chain.last_app_present {
        if last_app.app_propagated_present_start_time != 0 {
            last_app.app_propagated_present_start_time + last_app.app_propagated_time_in_present
        } else {
            last_app.present_start_time + last_app.time_in_present
        }
    } else if let Some(last) = &chain.last_present {
        last.present_start_time + last.time_in_present
    } else {
        0
    }
}

/// Simulation start used for animation error, per the chain's current source.
pub fn calculate_animation_sim_start(
    chain: &SwapChainCoreState,
    present: &FrameData,
    source: AnimationErrorSource,
) -> u64 {
    match source {
        AnimationErrorSource::CpuStart => calculate_cpu_start(chain, present),
        AnimationErrorSource::AppProvider => present.app_sim_start_time,
        AnimationErrorSource::PcLatency => present.pcl_sim_start_time,
    }
}

fn cpu_start_ms(tb: &TimeBase, cpu_start_qpc: u64) -> f64 {
    let session_start = tb.session_start();
    if session_start != 0 && cpu_start_qpc != 0 {
        tb.delta_signed_ms(session_start, cpu_start_qpc)
    } else {
        0.0
    }
}

fn fps_from_ms(ms: f64) -> f64 {
    if ms > 0.0 {
        1000.0 / ms
    } else {
        0.0
    }
}

/// Assembles one `FrameMetrics` record for a single displayed instance (or
/// for the whole present when it was dropped). Pure; carry-state updates are
/// returned as deltas.
#[allow(clippy::too_many_arguments)]
pub fn compute_frame_metrics(
    tb: &TimeBase,
    present: &FrameData,
    screen_time: u64,
    next_screen_time: u64,
    is_displayed: bool,
    is_app_frame: bool,
    frame_type: FrameType,
    chain: &SwapChainCoreState,
) -> ComputedMetrics {
    let mut result = ComputedMetrics::default();
    result.metrics.frame_type = frame_type;

    calculate_base_present_metrics(tb, present, chain, &mut result.metrics);
    calculate_display_metrics(
        tb,
        present,
        chain,
        is_displayed,
        screen_time,
        next_screen_time,
        &mut result.metrics,
    );
    calculate_cpu_gpu_metrics(tb, chain, present, is_app_frame, &mut result.metrics);
    calculate_animation_metrics(
        tb,
        chain,
        present,
        is_displayed,
        is_app_frame,
        screen_time,
        &mut result.metrics,
    );
    calculate_input_latency_metrics(
        tb,
        chain,
        present,
        is_displayed,
        is_app_frame,
        &mut result.metrics,
        &mut result.deltas,
    );
    result.metrics.ms_pc_latency = calculate_pc_latency(
        tb,
        chain,
        present,
        is_displayed,
        screen_time,
        &mut result.deltas,
    );
    calculate_instrumented_metrics(
        tb,
        chain,
        present,
        is_displayed,
        is_app_frame,
        screen_time,
        &mut result.metrics,
    );

    result.metrics.cpu_start_qpc = calculate_cpu_start(chain, present);
    result.metrics.cpu_start_ms = cpu_start_ms(tb, result.metrics.cpu_start_qpc);

    result.metrics.fps_present = fps_from_ms(result.metrics.ms_between_presents);
    result.metrics.fps_display = fps_from_ms(result.metrics.ms_between_display_change);
    result.metrics.fps_application = fps_from_ms(result.metrics.ms_cpu_time());

    result
}

/// Produces every metrics record owed for `present`, applying state deltas
/// between instances and advancing the carry-state when the present's
/// processing completes.
///
/// The caller decides when the "next displayed" present is known; a displayed
/// V2 present without one only yields its intermediate instances and leaves
/// the carry-state untouched until the final instance is resolved.
pub fn compute_metrics_for_present(
    tb: &TimeBase,
    present: &mut FrameData,
    mut next_displayed: Option<&mut FrameData>,
    chain: &mut SwapChainCoreState,
    version: MetricsVersion,
) -> Vec<ComputedMetrics> {
    let mut results = Vec::new();

    let display_count = present.displayed_count();
    let is_displayed = present.is_displayed();

    // Dropped present: a single record with display metrics zeroed.
    if !is_displayed || display_count == 0 {
        let indexing = DisplayIndexing::calculate(present, next_displayed.is_some());
        let is_app_frame = indexing.is_app_index(indexing.start_index);
        let frame_type = if display_count > 0 {
            present.displayed[indexing.start_index].0
        } else {
            FrameType::NotSet
        };

        let computed =
            compute_frame_metrics(tb, present, 0, 0, false, is_app_frame, frame_type, chain);
        chain.apply_deltas(&computed.deltas);
        results.push(computed);

        chain.update_after_present(present);
        return results;
    }

    // V1 computes displayed presents immediately, one record per present.
    if version == MetricsVersion::V1 {
        let mut screen_time = present.displayed[0].1;
        let mut next_screen_time = 0;

        adjust_screen_time_for_collapsed_present(
            present,
            next_displayed.as_deref_mut(),
            chain.last_displayed_flip_delay,
            chain.last_displayed_screen_time,
            &mut screen_time,
            &mut next_screen_time,
            version,
        );

        // Pin next to current so the displayed-time metric reads zero for
        // the single-row output.
        next_screen_time = screen_time;

        let indexing = DisplayIndexing::calculate(present, false);
        let is_app_frame = indexing.is_app_index(0);
        let is_displayed_instance = is_displayed && screen_time != 0;
        let frame_type = if is_displayed_instance {
            present.displayed[0].0
        } else {
            FrameType::NotSet
        };

        let computed = compute_frame_metrics(
            tb,
            present,
            screen_time,
            next_screen_time,
            is_displayed_instance,
            is_app_frame,
            frame_type,
            chain,
        );
        chain.apply_deltas(&computed.deltas);
        results.push(computed);

        chain.update_after_present(present);
        return results;
    }

    let indexing = DisplayIndexing::calculate(present, next_displayed.is_some());
    let should_update_chain = next_displayed.is_some();

    for display_index in indexing.start_index..indexing.end_index {
        let mut screen_time = present.displayed[display_index].1;
        let mut next_screen_time = if display_index + 1 < display_count {
            // Next instance of the same present.
            present.displayed[display_index + 1].1
        } else {
            // First instance of the next presented frame.
            match next_displayed.as_deref() {
                Some(next) if !next.displayed.is_empty() => next.displayed[0].1,
                _ => break,
            }
        };

        adjust_screen_time_for_collapsed_present(
            present,
            next_displayed.as_deref_mut(),
            0,
            0,
            &mut screen_time,
            &mut next_screen_time,
            version,
        );

        let is_app_frame = indexing.is_app_index(display_index);
        let is_displayed_instance = is_displayed && screen_time != 0 && next_screen_time != 0;
        let frame_type = if is_displayed_instance {
            present.displayed[display_index].0
        } else {
            FrameType::NotSet
        };

        let computed = compute_frame_metrics(
            tb,
            present,
            screen_time,
            next_screen_time,
            is_displayed_instance,
            is_app_frame,
            frame_type,
            chain,
        );
        chain.apply_deltas(&computed.deltas);
        results.push(computed);
    }

    if should_update_chain {
        chain.update_after_present(present);
    }

    results
}
