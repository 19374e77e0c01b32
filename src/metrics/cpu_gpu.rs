use crate::metrics::calculator::calculate_cpu_start;
use crate::metrics::chain_state::SwapChainCoreState;
use crate::metrics::types::FrameMetrics;
use crate::present::FrameData;
use crate::timebase::TimeBase;

// Each of these prefers the app-propagated timing (set when a frame
// generation layer carries the source frame's timing) over the native one.

fn cpu_busy(tb: &TimeBase, chain: &SwapChainCoreState, present: &FrameData) -> f64 {
    let cpu_start = calculate_cpu_start(chain, present);
    if cpu_start == 0 {
        return 0.0;
    }
    if present.app_propagated_present_start_time != 0 {
        tb.delta_unsigned_ms(cpu_start, present.app_propagated_present_start_time)
    } else if present.present_start_time != 0 {
        tb.delta_unsigned_ms(cpu_start, present.present_start_time)
    } else {
        0.0
    }
}

fn cpu_wait(tb: &TimeBase, present: &FrameData) -> f64 {
    if present.app_propagated_time_in_present != 0 {
        tb.ticks_to_ms(present.app_propagated_time_in_present)
    } else {
        tb.ticks_to_ms(present.time_in_present)
    }
}

fn gpu_latency(tb: &TimeBase, chain: &SwapChainCoreState, present: &FrameData) -> f64 {
    let cpu_start = calculate_cpu_start(chain, present);
    if cpu_start == 0 {
        return 0.0;
    }
    if present.app_propagated_gpu_start_time != 0 {
        tb.delta_unsigned_ms(cpu_start, present.app_propagated_gpu_start_time)
    } else if present.gpu_start_time != 0 {
        tb.delta_unsigned_ms(cpu_start, present.gpu_start_time)
    } else {
        0.0
    }
}

fn gpu_busy(tb: &TimeBase, present: &FrameData) -> f64 {
    if present.app_propagated_gpu_duration != 0 {
        tb.ticks_to_ms(present.app_propagated_gpu_duration)
    } else if present.gpu_duration != 0 {
        tb.ticks_to_ms(present.gpu_duration)
    } else {
        0.0
    }
}

fn video_busy(tb: &TimeBase, present: &FrameData) -> f64 {
    if present.app_propagated_gpu_video_duration != 0 {
        tb.ticks_to_ms(present.app_propagated_gpu_video_duration)
    } else if present.gpu_video_duration != 0 {
        tb.ticks_to_ms(present.gpu_video_duration)
    } else {
        0.0
    }
}

fn gpu_span(tb: &TimeBase, present: &FrameData) -> f64 {
    if present.app_propagated_gpu_start_time != 0 || present.app_propagated_ready_time != 0 {
        tb.delta_unsigned_ms(
            present.app_propagated_gpu_start_time,
            present.app_propagated_ready_time,
        )
    } else if present.gpu_start_time != 0 || present.ready_time != 0 {
        tb.delta_unsigned_ms(present.gpu_start_time, present.ready_time)
    } else {
        0.0
    }
}

/// CPU and GPU busy/wait metrics. Attributed to app frames only; synthesized
/// frame instances report zero.
pub fn calculate_cpu_gpu_metrics(
    tb: &TimeBase,
    chain: &SwapChainCoreState,
    present: &FrameData,
    is_app_frame: bool,
    out: &mut FrameMetrics,
) {
    if !is_app_frame {
        return;
    }
    out.ms_cpu_busy = cpu_busy(tb, chain, present);
    out.ms_cpu_wait = cpu_wait(tb, present);
    out.ms_gpu_latency = gpu_latency(tb, chain, present);
    out.ms_gpu_busy = gpu_busy(tb, present);
    out.ms_video_busy = video_busy(tb, present);
    out.ms_gpu_wait = (gpu_span(tb, present) - out.ms_gpu_busy).max(0.0);
}
