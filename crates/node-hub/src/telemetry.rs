use metrics::counter;
use sqlx::Error as SqlxError;

pub(crate) fn record_internal_error_metrics(err: &anyhow::Error) {
    counter!("node_hub_internal_errors_total").increment(1);
    if let Some(db_err) = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<SqlxError>())
    {
        let kind = match db_err {
            SqlxError::RowNotFound => "row_not_found",
            SqlxError::Database(_) => "database",
            SqlxError::Io(_) => "io",
            SqlxError::PoolTimedOut | SqlxError::PoolClosed => "pool",
            _ => "other",
        };
        counter!("node_hub_db_errors_total", "kind" => kind).increment(1);
    }
}

/// Close reasons and dispatch results are low-cardinality labels; node ids are not.
pub(crate) fn record_session_closed(reason: &'static str) {
    counter!("node_hub_session_closed_total", "reason" => reason).increment(1);
}

pub(crate) fn record_dispatch(result: &'static str) {
    counter!("node_hub_dispatch_total", "result" => result).increment(1);
}

pub(crate) fn record_traffic_report(result: &'static str) {
    counter!("node_hub_traffic_reports_total", "result" => result).increment(1);
}

pub(crate) fn record_quota_check(result: &'static str) {
    counter!("node_hub_quota_checks_total", "result" => result).increment(1);
}
