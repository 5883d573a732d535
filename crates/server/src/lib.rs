//! HTTP layer for the Portcullis gateway: axum routing, request-id
//! middleware, and the health/metrics endpoints.

pub mod middleware;
pub mod router;
