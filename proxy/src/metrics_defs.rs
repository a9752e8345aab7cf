use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "request.duration",
    metric_type: MetricType::Histogram,
    description: "End-to-end request duration in seconds. Tagged with status.",
};

pub const BACKEND_REQUEST_DURATION: MetricDef = MetricDef {
    name: "backend.request.duration",
    metric_type: MetricType::Histogram,
    description: "Single backend dispatch duration in seconds. Tagged with backend, status.",
};

pub const ALL_METRICS: &[MetricDef] = &[REQUEST_DURATION, BACKEND_REQUEST_DURATION];
