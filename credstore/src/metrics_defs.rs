use shared::metrics_defs::{MetricDef, MetricType};

pub const CREDENTIALS_REFRESH: MetricDef = MetricDef {
    name: "credentials.refresh",
    metric_type: MetricType::Counter,
    description: "Credentials cache refresh attempts. Tagged with result (ok, not_found, error).",
};

pub const ALL_METRICS: &[MetricDef] = &[CREDENTIALS_REFRESH];
