//! # Eos - Energy Surplus Allocation for Home Assistant
//!
//! A Rust implementation of a household energy-surplus allocation and
//! load-control engine: it decides in real time which deferrable loads
//! (EV charger, water-heater stages, battery charging) may draw power,
//! based on live telemetry of solar production, grid import/export,
//! per-phase current and battery state of charge.
//!
//! ## Features
//!
//! - **Priority scheduling**: surplus is allocated across consumers'
//!   descending power stages, highest priority first
//! - **Feedback control**: virtual entities push setpoints to external
//!   actuators (e.g. an EV charger) from live grid measurements
//! - **Phase protection**: a hard interlock sheds load before any phase
//!   exceeds its breaker limit
//! - **Battery aware**: a reserve floor is never depleted by allocation
//!   decisions, and cheap-hour grid pre-charging bridges dark mornings
//! - **Self-healing**: desired switch states are reconciled against the
//!   platform with bounded retries
//!
//! ## Architecture
//!
//! The application follows a modular architecture with clear separation of concerns:
//!
//! - `config`: Configuration management and validation
//! - `logging`: Structured logging and tracing
//! - `bus`: Entity-state bus access (Home Assistant REST API)
//! - `telemetry`: Power telemetry acquisition and publication
//! - `battery`: Battery state tracking and headroom
//! - `phase`: Phase overload protection
//! - `virtual_entity`: Feedback-controlled virtual switches
//! - `scheduler`: Surplus allocation across consumer stages
//! - `precharge`: Battery grid pre-charge planning
//! - `enforce`: Desired-state enforcement and fault tracking
//! - `engine`: Control loop orchestration

pub mod battery;
pub mod bus;
pub mod config;
pub mod enforce;
pub mod engine;
pub mod error;
pub mod logging;
pub mod phase;
pub mod precharge;
pub mod scheduler;
pub mod telemetry;
pub mod virtual_entity;

// Re-export commonly used types
pub use config::Config;
pub use engine::EnergyEngine;
pub use error::{EosError, Result};
