use thiserror::Error;

use crate::model::{NamespaceScope, ResourceKind};

/// Failures while laying out or writing a table.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("row has {found} cells but the table declares {expected} columns")]
    RowShape { expected: usize, found: usize },

    #[error("failed to write table output")]
    Write(#[from] std::io::Error),
}

/// Terminal failures of a watch session. Every variant ends the session.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("resource type '{kind}' is not supported for {operation}")]
    UnsupportedKind {
        kind: String,
        operation: &'static str,
    },

    #[error("failed to list {kind} in {scope}")]
    Fetch {
        kind: ResourceKind,
        scope: NamespaceScope,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to open watch on {kind} in {scope}")]
    Subscription {
        kind: ResourceKind,
        scope: NamespaceScope,
        #[source]
        source: anyhow::Error,
    },

    #[error("watch connection lost for {kind} in {scope}")]
    StreamClosed {
        kind: ResourceKind,
        scope: NamespaceScope,
    },

    #[error("failed to render {kind} table")]
    Render {
        kind: ResourceKind,
        #[source]
        source: RenderError,
    },
}

impl WatchError {
    pub fn unsupported(kind: &str, operation: &'static str) -> Self {
        Self::UnsupportedKind {
            kind: kind.to_string(),
            operation,
        }
    }
}

#[derive(Debug, Error)]
#[error("Resource '{kind}/{name}' not found in namespace '{namespace}'")]
pub struct NotFoundError {
    pub kind: &'static str,
    pub name: String,
    pub namespace: String,
}
