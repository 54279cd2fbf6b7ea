// Metric wrappers over the `metrics` facade. The batching pipeline reports
// two kinds of data: event counts and latencies. `t_duration!` is the
// latency entry point — every stage, tail, and per-request timing records a
// `Duration` through it so the seconds conversion lives in one place. With
// the `telemetry` feature off, call sites compile down to a no-op handle.
#[cfg(feature = "telemetry")]
macro_rules! t_counter {
    ($($tt:tt)*) => {
        metrics::counter!($($tt)*)
    };
}

#[cfg(not(feature = "telemetry"))]
macro_rules! t_counter {
    ($($tt:tt)*) => {
        $crate::macros::Noop
    };
}

#[cfg(feature = "telemetry")]
macro_rules! t_histogram {
    ($($tt:tt)*) => {
        metrics::histogram!($($tt)*)
    };
}

#[cfg(not(feature = "telemetry"))]
macro_rules! t_histogram {
    ($($tt:tt)*) => {
        $crate::macros::Noop
    };
}

/// Record a wall-clock `Duration` as seconds on a histogram, optionally with
/// labels: `t_duration!("name", dur)` or `t_duration!("name", "k" => "v"; dur)`.
macro_rules! t_duration {
    ($name:expr, $dur:expr) => {
        t_histogram!($name).record($dur.as_secs_f64())
    };
    ($name:expr, $($key:expr => $value:expr),+ ; $dur:expr) => {
        t_histogram!($name, $($key => $value),+).record($dur.as_secs_f64())
    };
}

/// Stand-in for both counter and histogram handles when telemetry is off.
#[cfg(not(feature = "telemetry"))]
#[derive(Copy, Clone)]
pub(crate) struct Noop;

#[cfg(not(feature = "telemetry"))]
impl Noop {
    pub(crate) fn increment(&self, _value: u64) {}

    pub(crate) fn record(&self, _value: f64) {}
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    #[test]
    #[cfg(not(feature = "telemetry"))]
    fn noop_handle_absorbs_everything() {
        t_counter!("kvmux_test_counter").increment(1);
        t_histogram!("kvmux_test_histogram").record(0.5);
        t_duration!("kvmux_test_duration", Duration::from_millis(3));
        t_duration!("kvmux_test_duration", "stage" => "recv"; Duration::from_millis(3));
    }

    #[test]
    #[cfg(feature = "telemetry")]
    fn macros_expand_against_metrics_facade() {
        t_counter!("kvmux_test_counter").increment(1);
        t_histogram!("kvmux_test_histogram").record(0.5);
        t_duration!("kvmux_test_duration", Duration::from_millis(3));
        t_duration!("kvmux_test_duration", "stage" => "recv"; Duration::from_millis(3));
    }
}
