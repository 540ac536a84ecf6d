//! Mocks and fixtures shared by the Threadloom test suites.

mod backend;
mod fixtures;
mod transport;

pub use backend::MockBackend;
pub use fixtures::{scenario_a, scenario_b, test_config, write_config, GraphBuilder};
pub use transport::RecordingTransport;
