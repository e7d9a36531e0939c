//! Server test harness
//!
//! Runs every scenario directory of a test suite against a PHP web server
//! hosted by one of several backends. Each scenario gets its own mock
//! control-plane server and a pair of freshly leased ports; its assertion
//! script decides pass or fail.
//!
//! ```text
//! Orchestrator
//!   ├── Backend::initialize
//!   ├── discover + prepare (ports, env, Backend::process_scenario)
//!   ├── Backend::pre_flight
//!   ├── ScenarioRunner::run  (one task per scenario, bounded)
//!   │     mock up → server up → script → record → teardown
//!   └── Backend::teardown → SuiteReport
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod ports;
pub mod process;
pub mod runner;
pub mod scenario;

pub use backend::{Backend, BackendKind};
pub use config::HarnessConfig;
pub use error::{HarnessError, HarnessResult};
pub use orchestrator::{Orchestrator, SuiteReport};
pub use runner::{RunOptions, ScenarioRunner};
pub use scenario::{Outcome, PreparedScenario, ScenarioResult, ScenarioSpec};
