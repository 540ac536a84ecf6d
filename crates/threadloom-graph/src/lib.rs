pub mod context;
pub mod merge;
pub mod planner;
pub mod title;

pub use context::ContextAssembler;
pub use merge::{ConnectOutcome, ContextMerger, MergeNodeData, MergeOutcome};
pub use planner::ExecutionPlanner;
pub use title::{regenerate_title, TitleStrategy};
