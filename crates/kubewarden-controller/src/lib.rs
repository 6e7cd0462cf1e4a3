pub mod certs;
pub mod cli;
pub mod conditions;
pub mod config;
pub mod crds;
pub mod error;
pub mod index;
pub mod policy_config;
pub mod policy_controller;
pub mod policy_server_controller;
pub mod rollout;
pub mod store;
pub mod webhook;
