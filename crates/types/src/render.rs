use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Sink for render-ready fragments. The transport layer owns the receiver and
/// turns fragments into markup.
pub type RenderSender = mpsc::UnboundedSender<RenderFragment>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FragmentKind {
    Content,
    Reasoning,
    ToolStatus,
    Error,
}

impl fmt::Display for FragmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Content => "content",
            Self::Reasoning => "reasoning",
            Self::ToolStatus => "tool-status",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderFragment {
    pub kind: FragmentKind,
    pub region: String,
    pub text: String,
}

/// Target region ids for one response bubble.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseRegions {
    pub response_id: String,
}

impl ResponseRegions {
    pub fn new(response_id: impl Into<String>) -> Self {
        Self {
            response_id: response_id.into(),
        }
    }

    pub fn content(&self) -> String {
        format!("content-{}", self.response_id)
    }

    pub fn reasoning(&self) -> String {
        format!("reasoning-{}", self.response_id)
    }

    pub fn tool(&self) -> String {
        format!("tool-{}", self.response_id)
    }

    /// Region a fragment of `kind` is routed to. Errors land in the content
    /// region so they show up where the answer was expected.
    pub fn region_for(&self, kind: FragmentKind) -> String {
        match kind {
            FragmentKind::Content | FragmentKind::Error => self.content(),
            FragmentKind::Reasoning => self.reasoning(),
            FragmentKind::ToolStatus => self.tool(),
        }
    }

    pub fn fragment(&self, kind: FragmentKind, text: impl Into<String>) -> RenderFragment {
        RenderFragment {
            kind,
            region: self.region_for(kind),
            text: text.into(),
        }
    }
}
