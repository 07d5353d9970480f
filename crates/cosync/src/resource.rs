//! Shared resources under collaboration and their channel naming.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of resource being collaborated on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Session,
    Workflow,
}

impl ResourceKind {
    /// Wire spelling of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Session => "session",
            ResourceKind::Workflow => "workflow",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A specific resource instance: the unit a collaboration session attaches
/// to and the scope of its broadcast and presence channels.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub id: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn session(id: impl Into<String>) -> Self {
        Self::new(ResourceKind::Session, id)
    }

    pub fn workflow(id: impl Into<String>) -> Self {
        Self::new(ResourceKind::Workflow, id)
    }

    /// Name of the operation broadcast channel for this resource.
    pub fn channel_name(&self) -> String {
        format!("{}:{}", self.kind, self.id)
    }

    /// Name of the presence channel for this resource.
    pub fn presence_channel_name(&self) -> String {
        format!("presence:{}:{}", self.kind, self.id)
    }

    /// Parse an operation channel name back into the resource it names.
    /// Presence channels and unknown kinds yield `None`.
    pub fn from_channel_name(name: &str) -> Option<ResourceRef> {
        let (kind, id) = name.split_once(':')?;
        let kind = match kind {
            "session" => ResourceKind::Session,
            "workflow" => ResourceKind::Workflow,
            _ => return None,
        };
        if id.is_empty() {
            return None;
        }
        Some(ResourceRef::new(kind, id))
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_naming() {
        let resource = ResourceRef::workflow("wf-42");
        assert_eq!(resource.channel_name(), "workflow:wf-42");
        assert_eq!(resource.presence_channel_name(), "presence:workflow:wf-42");
    }

    #[test]
    fn test_session_channel_naming() {
        let resource = ResourceRef::session("s-1");
        assert_eq!(resource.channel_name(), "session:s-1");
    }

    #[test]
    fn test_kind_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(ResourceKind::Workflow).unwrap(),
            serde_json::json!("workflow")
        );
        let kind: ResourceKind = serde_json::from_value(serde_json::json!("session")).unwrap();
        assert_eq!(kind, ResourceKind::Session);
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let result: Result<ResourceKind, _> =
            serde_json::from_value(serde_json::json!("document"));
        assert!(result.is_err());
    }

    #[test]
    fn test_channel_name_round_trip() {
        let resource = ResourceRef::workflow("wf-42");
        assert_eq!(
            ResourceRef::from_channel_name(&resource.channel_name()),
            Some(resource)
        );
    }

    #[test]
    fn test_non_operation_channels_do_not_parse() {
        assert_eq!(ResourceRef::from_channel_name("presence:workflow:wf-1"), None);
        assert_eq!(ResourceRef::from_channel_name("document:d-1"), None);
        assert_eq!(ResourceRef::from_channel_name("workflow:"), None);
        assert_eq!(ResourceRef::from_channel_name("loose-name"), None);
    }
}
