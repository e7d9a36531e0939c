//! Mock control-plane server
//!
//! Stands in for the vendor backend that the agent under test polls for
//! configuration and reports telemetry to. One process is spawned per test
//! scenario; the test driver inspects and steers it through the `/mock/*`
//! routes.
//!
//! ```text
//! agent  ── GET  /config, /api/runtime/config, /api/runtime/firewall/lists
//!        ── POST /api/runtime/events
//! driver ── POST /mock/config, /mock/down, /mock/up
//!        ── GET  /mock/events, /mock/token, /tests/simple
//! ```

pub mod error;
pub mod server;
pub mod state;

pub use error::{MockError, MockResult};
pub use server::{MockServer, MockServerConfig};
pub use state::{ConfigVersion, MockState};
