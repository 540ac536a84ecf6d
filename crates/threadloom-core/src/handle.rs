//! Typed connection points on nodes.
//!
//! A handle id has the shape `<category>_<nodeId>`, e.g. `context_abc123`.
//! The category decides which node kinds may connect into it and how many
//! edges it may hold.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ThreadloomError};
use crate::types::{NodeId, NodeKind};

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleCategory {
    Prompt,
    Context,
    Attachment,
}

impl HandleCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prompt => "prompt",
            Self::Context => "context",
            Self::Attachment => "attachment",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "prompt" => Some(Self::Prompt),
            "context" => Some(Self::Context),
            "attachment" => Some(Self::Attachment),
            _ => None,
        }
    }

    /// Whether a node of `source` kind may feed a handle of this category.
    pub fn accepts(&self, source: NodeKind) -> bool {
        match self {
            Self::Prompt => matches!(source, NodeKind::Prompt | NodeKind::Routing),
            Self::Context => matches!(
                source,
                NodeKind::TextGeneration | NodeKind::ParallelGeneration | NodeKind::ContextMerge
            ),
            Self::Attachment => matches!(source, NodeKind::Attachment | NodeKind::Github),
        }
    }

    /// Maximum number of incoming edges on a handle of this category owned
    /// by a node of `owner` kind. `None` means unbounded.
    pub fn capacity(&self, owner: NodeKind) -> Option<usize> {
        match (self, owner) {
            (Self::Attachment, _) => None,
            (Self::Context, NodeKind::ContextMerge) => None,
            (Self::Prompt | Self::Context, _) => Some(1),
        }
    }
}

/// Input handle categories a node of the given kind exposes.
pub fn input_categories(kind: NodeKind) -> &'static [HandleCategory] {
    match kind {
        NodeKind::TextGeneration | NodeKind::ParallelGeneration | NodeKind::Routing => &[
            HandleCategory::Prompt,
            HandleCategory::Context,
            HandleCategory::Attachment,
        ],
        NodeKind::ContextMerge => &[HandleCategory::Context],
        NodeKind::Prompt | NodeKind::Attachment | NodeKind::Github => &[],
    }
}

/// Output handle category of a node kind.
pub fn output_category(kind: NodeKind) -> HandleCategory {
    match kind {
        NodeKind::Prompt | NodeKind::Routing => HandleCategory::Prompt,
        NodeKind::Attachment | NodeKind::Github => HandleCategory::Attachment,
        NodeKind::TextGeneration | NodeKind::ParallelGeneration | NodeKind::ContextMerge => {
            HandleCategory::Context
        }
    }
}

/// A parsed handle id.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct HandleId {
    pub category: HandleCategory,
    pub node_id: NodeId,
}

impl HandleId {
    pub fn new(category: HandleCategory, node_id: NodeId) -> Self {
        Self { category, node_id }
    }

    pub fn context(node_id: &NodeId) -> Self {
        Self::new(HandleCategory::Context, node_id.clone())
    }

    pub fn prompt(node_id: &NodeId) -> Self {
        Self::new(HandleCategory::Prompt, node_id.clone())
    }

    pub fn attachment(node_id: &NodeId) -> Self {
        Self::new(HandleCategory::Attachment, node_id.clone())
    }

    pub fn parse(s: &str) -> Result<Self> {
        let (category, node) = s
            .split_once('_')
            .ok_or_else(|| ThreadloomError::NotFound(format!("malformed handle id: {s}")))?;
        let category = HandleCategory::parse(category)
            .ok_or_else(|| ThreadloomError::NotFound(format!("unknown handle category: {s}")))?;
        if node.is_empty() {
            return Err(ThreadloomError::NotFound(format!("handle without node: {s}")));
        }
        Ok(Self {
            category,
            node_id: NodeId::from_string(node),
        })
    }
}

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.category.as_str(), self.node_id)
    }
}
