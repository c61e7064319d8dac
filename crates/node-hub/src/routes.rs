pub use crate::http::build_metrics_router;
pub use crate::http::build_router;
pub use crate::tasks::flush::traffic_flush_loop;
