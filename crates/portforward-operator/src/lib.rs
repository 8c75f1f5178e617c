//! portforward-operator: Kubernetes controller for router port-forward rules

pub mod client;
pub mod config;
pub mod context;
pub mod controllers;
pub mod delta;
pub mod desired;
pub mod drift;
pub mod events;
pub mod executor;
pub mod finalizer;
pub mod health;
pub mod locks;
pub mod operation;
pub mod periodic;
pub mod rate_limit;
pub mod rules;
pub mod service;
pub mod store;

#[cfg(test)]
mod testing;

pub use config::PortForwardConfig;
pub use rules::{PortRule, RuleSnapshot, ServiceKey};
