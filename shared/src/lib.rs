pub mod http;
pub mod metrics_defs;

/// Increment a counter declared as a [`metrics_defs::MetricDef`].
///
/// `counter!(DEF)` or `counter!(DEF, "label" => value, ...)`.
#[macro_export]
macro_rules! counter {
    ($def:expr) => {
        ::metrics::counter!($def.name)
    };
    ($def:expr, $($label:expr => $value:expr),+ $(,)?) => {
        ::metrics::counter!($def.name, $($label => $value),+)
    };
}
