//! Kubernetes client for kubemux
//!
//! This crate builds cluster clients from kubeconfig documents (optionally
//! routed through a local tunnel port) and provides the resource accessors
//! the engine depends on: namespaces, pods, containers.

mod client;

pub use client::{ClusterClient, PodSummary, api_server_endpoint};
