//! HTTP request handlers.

mod agent;
mod health;
mod hosts;
mod pipelines;
mod tasks;
mod webhook;

pub use agent::agent_connect;
pub use health::{health_check, metrics_handler};
pub use hosts::{create_host, delete_host, get_host, list_hosts, refresh_host, test_connection};
pub use pipelines::{create_pipeline, list_pipelines};
pub use tasks::{cancel_task, get_task, list_tasks, submit_task};
pub use webhook::receive_webhook;
