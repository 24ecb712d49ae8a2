//! HTTP API handlers
//!
//! Polling-style surface: submit, inspect, cancel and re-submit work items,
//! plus queue statistics and health for operational dashboards.

pub mod health;
pub mod pipelines;
pub mod queues;
pub mod work_items;

pub use health::health_routes;
pub use pipelines::pipeline_routes;
pub use queues::queue_routes;
pub use work_items::work_item_routes;
