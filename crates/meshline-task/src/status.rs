use std::fmt;
use std::str::FromStr;

/// Provider-assigned job id. Also the webhook correlation key, so it is
/// treated as unique across every entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    Expired,
    #[serde(alias = "CANCELLED")]
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Expired | Self::Canceled
        )
    }

    // Position along PENDING -> IN_PROGRESS -> terminal.
    pub fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::InProgress => 1,
            Self::Succeeded | Self::Failed | Self::Expired | Self::Canceled => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Expired => "EXPIRED",
            Self::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value:?}")]
pub struct ParseStatusError {
    kind: &'static str,
    value: String,
}

impl FromStr for TaskStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            "EXPIRED" => Ok(Self::Expired),
            "CANCELED" | "CANCELLED" => Ok(Self::Canceled),
            _ => Err(ParseStatusError {
                kind: "task status",
                value: s.to_string(),
            }),
        }
    }
}

/// Pipeline stage a task belongs to. Serialized names match manifests
/// written by earlier tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ServiceKind {
    #[serde(rename = "text3d")]
    Text3d,
    #[serde(rename = "text3d_refine")]
    Refine,
    #[serde(rename = "rigging")]
    Rigging,
    #[serde(rename = "animation")]
    Animation,
    #[serde(rename = "retexture")]
    Retexture,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 5] = [
        Self::Text3d,
        Self::Refine,
        Self::Rigging,
        Self::Animation,
        Self::Retexture,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text3d => "text3d",
            Self::Refine => "text3d_refine",
            Self::Rigging => "rigging",
            Self::Animation => "animation",
            Self::Retexture => "retexture",
        }
    }

    /// Last path segment of the callback URL for this stage.
    pub fn webhook_endpoint(self) -> &'static str {
        match self {
            Self::Text3d => "text3d",
            Self::Refine => "refine",
            Self::Rigging => "rigging",
            Self::Animation => "animation",
            Self::Retexture => "retexture",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceKind {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s || k.webhook_endpoint() == s)
            .ok_or(ParseStatusError {
                kind: "service",
                value: s,
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusSource {
    Orchestrator,
    Webhook,
    Manual,
    Service,
}
