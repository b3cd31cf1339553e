//! HTTP front door of the delivery pipeline.
//!
//! Endpoints:
//! - POST   /api/tasks: submit a notification task
//! - GET    /api/tasks: list tasks, newest first (`skip`, `limit`)
//! - GET    /api/tasks/{id}: full task record
//! - GET    /api/tasks/{id}/status: delivery status only
//! - PATCH  /api/tasks/{id}: reschedule a pending task (`scheduled_at`)
//! - DELETE /api/tasks/{id}: administrative delete
//! - GET    /health

pub mod routes;
pub mod state;
