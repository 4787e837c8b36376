pub mod api;
pub mod config;
pub mod failover_events;
pub mod failover_proxy;
pub mod failover_state;
pub mod health_monitor;
pub mod job_store;
pub mod node_transport;
pub mod object_store;
pub mod probe;
pub mod provider_manager;
pub mod race;
pub mod snapshot_engine;
pub mod snapshot_scheduler;
pub mod standby_manager;
pub mod status_api;
