use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

/// Action protected by the client-side rate limiter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Upload,
    Payment,
    Email,
    FaceSearch,
    /// Any action without a dedicated rule; uses the fallback window.
    Other(String),
}

impl ActionType {
    /// Build the bucket key for this action, optionally scoped to a subject
    /// (a campaign, a user, an email address).
    pub fn key(&self, subject: Option<&str>) -> String {
        match subject {
            Some(subject) => format!("{}:{}", self, subject),
            None => self.to_string(),
        }
    }
}

impl Display for ActionType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            ActionType::Upload => write!(f, "upload"),
            ActionType::Payment => write!(f, "payment"),
            ActionType::Email => write!(f, "email"),
            ActionType::FaceSearch => write!(f, "face_search"),
            ActionType::Other(name) => write!(f, "{}", name),
        }
    }
}

impl FromStr for ActionType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upload" => Ok(ActionType::Upload),
            "payment" => Ok(ActionType::Payment),
            "email" => Ok(ActionType::Email),
            "face_search" => Ok(ActionType::FaceSearch),
            "" => Err(anyhow::anyhow!("Action type must not be empty")),
            other => Ok(ActionType::Other(other.to_string())),
        }
    }
}
