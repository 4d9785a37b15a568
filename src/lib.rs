//! Lifeline: process lifecycle and health supervision for network services.
//!
//! # Architecture Overview
//!
//! ```text
//!   ┌──────────────────────────────────────────────────────────────────┐
//!   │                           LIFELINE                               │
//!   │                                                                  │
//!   │  ┌───────────────┐   listener   ┌──────────────┐                 │
//!   │  │ net::handoff  │─────────────▶│ http::server │◀── traffic      │
//!   │  │  (Upgrader)   │              └──────┬───────┘                 │
//!   │  └───────▲───────┘                     │ /healthz /readiness     │
//!   │          │ fds 3..                     ▼ /liveness /health       │
//!   │   successor gen.              ┌──────────────┐                   │
//!   │                               │ http::probes │                   │
//!   │  ┌───────────────┐            └──────┬───────┘                   │
//!   │  │  lifecycle    │   register        │ snapshot                  │
//!   │  │ startup/      │────────────▶┌─────▼────────┐   ping/close     │
//!   │  │ shutdown      │             │   health     │────────────────▶ │ collaborators
//!   │  └───────────────┘             │  registry    │                  │
//!   │                                └──────────────┘                  │
//!   └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod collaborators;
pub mod config;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use config::schema::ServiceConfig;
pub use health::HealthRegistry;
pub use http::HttpServer;
pub use lifecycle::{Orchestrator, Service};
pub use net::Upgrader;
