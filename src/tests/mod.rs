//! Integration tests for the multi-tenant front-end.
//!
//! End-to-end cases covering routing, middleware rewriting, error
//! rendering, lifecycle idempotence, the task scheduler, supervised
//! processes and the command channel.

mod cases_lifecycle_test;
mod cases_offline_test;
mod cases_routing_test;
mod cases_tasks_test;
mod cases_tcp_test;

pub mod support;
