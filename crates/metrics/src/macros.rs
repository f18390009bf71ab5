/// Register a histogram with the zero metrics registry and store it in a
/// static. An optional third argument specifies label names. The reported
/// metric name is the lower_snake_case version of the declared ident.
#[macro_export]
macro_rules! register_zero_histogram {
    ($VIS:vis $NAME:ident, $HELP:literal $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::Histogram> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    let name = $crate::metric_name!(stringify!([<$NAME:lower>]));
                }
                let opts = $crate::prometheus::HistogramOpts::new(name, $HELP);
                let histogram = $crate::prometheus::Histogram::with_opts(opts)
                    .expect("Metric initialization failed");
                $crate::ZERO_METRICS_REGISTRY
                    .register(Box::new(histogram.clone()))
                    .expect("Metric registration failed");
                histogram
            });
    };
    ($VIS:vis $NAME:ident, $HELP:literal, $LABELS:expr $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::HistogramVec> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    let name = $crate::metric_name!(stringify!([<$NAME:lower>]));
                }
                let opts = $crate::prometheus::HistogramOpts::new(name, $HELP);
                let histogram = $crate::prometheus::HistogramVec::new(opts, $LABELS)
                    .expect("Metric initialization failed");
                $crate::ZERO_METRICS_REGISTRY
                    .register(Box::new(histogram.clone()))
                    .expect("Metric registration failed");
                histogram
            });
    };
}

/// Register an integer counter with the zero metrics registry and store it in
/// a static. An optional third argument specifies label names.
#[macro_export]
macro_rules! register_zero_counter {
    ($VIS:vis $NAME:ident, $HELP:literal $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::IntCounter> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    let name = $crate::metric_name!(stringify!([<$NAME:lower>]));
                }
                let counter = $crate::prometheus::IntCounter::new(name, $HELP)
                    .expect("Metric initialization failed");
                $crate::ZERO_METRICS_REGISTRY
                    .register(Box::new(counter.clone()))
                    .expect("Metric registration failed");
                counter
            });
    };
    ($VIS:vis $NAME:ident, $HELP:literal, $LABELS:expr $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::IntCounterVec> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    let name = $crate::metric_name!(stringify!([<$NAME:lower>]));
                }
                let opts = $crate::prometheus::Opts::new(name, $HELP);
                let counter = $crate::prometheus::IntCounterVec::new(opts, $LABELS)
                    .expect("Metric initialization failed");
                $crate::ZERO_METRICS_REGISTRY
                    .register(Box::new(counter.clone()))
                    .expect("Metric registration failed");
                counter
            });
    };
}

/// Register a floating-point gauge with the zero metrics registry and store
/// it in a static. An optional third argument specifies label names.
#[macro_export]
macro_rules! register_zero_gauge {
    ($VIS:vis $NAME:ident, $HELP:literal $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::Gauge> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    let name = $crate::metric_name!(stringify!([<$NAME:lower>]));
                }
                let gauge = $crate::prometheus::Gauge::new(name, $HELP)
                    .expect("Metric initialization failed");
                $crate::ZERO_METRICS_REGISTRY
                    .register(Box::new(gauge.clone()))
                    .expect("Metric registration failed");
                gauge
            });
    };
    ($VIS:vis $NAME:ident, $HELP:literal, $LABELS:expr $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::GaugeVec> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    let name = $crate::metric_name!(stringify!([<$NAME:lower>]));
                }
                let opts = $crate::prometheus::Opts::new(name, $HELP);
                let gauge = $crate::prometheus::GaugeVec::new(opts, $LABELS)
                    .expect("Metric initialization failed");
                $crate::ZERO_METRICS_REGISTRY
                    .register(Box::new(gauge.clone()))
                    .expect("Metric registration failed");
                gauge
            });
    };
}
