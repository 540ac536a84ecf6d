pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod handle;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, ThreadloomError};
pub use event::EventBus;
pub use graph::{Connection, Edge, Graph, Node, Position};
pub use handle::{HandleCategory, HandleId};
pub use traits::{ChatBackend, GraphStore, NodeHandler, SessionListener, Transport};
pub use types::*;
