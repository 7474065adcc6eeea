//! Bluetooth Module
//!
//! Session management for a single VibMotor peripheral.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   SessionCommand    ┌──────────────────────────────┐
//! │ SessionHandle├────────────────────►│        SessionManager        │
//! └──────────────┘                     │  (owns all state, one task)  │
//! ┌──────────────┐   PlatformEvent     │                              │
//! │ BlePlatform  ├────────────────────►│ Adapter  Scanner  Connection │
//! │  (btleplug)  │◄────────────────────┤ Dispatcher        Status     │
//! └──────────────┘   fire-and-forget   └──────────────┬───────────────┘
//!                                                     │ watch
//!                                                     ▼
//!                                              SessionStatus
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - UUIDs, name filter and the ON/OFF command codec
//! - [`platform`] - The BLE stack boundary: operations and events
//! - [`adapter`] - Radio state tracking
//! - [`scanner`] - Service-scoped discovery and name matching
//! - [`connection`] - Connect and GATT discovery state machine
//! - [`dispatcher`] - Timed ON/OFF pulses
//! - [`status`] - Observable status snapshot
//! - [`service`] - The session actor tying it together
//! - [`btleplug_backend`] - [`platform::BlePlatform`] over btleplug

pub mod adapter;
pub mod btleplug_backend;
pub mod connection;
pub mod dispatcher;
pub mod platform;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod status;

pub use btleplug_backend::BtleplugPlatform;
pub use service::{SessionCommand, SessionHandle, SessionManager};
