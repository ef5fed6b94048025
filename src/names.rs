//! Canonical channel-name registry.
//!
//! Every sender and receiver in the system — dashboard, widget, and
//! server-side broadcasters — resolves topics through this module. A
//! topic string built anywhere else is a bug: two parties that disagree
//! on a name silently never see each other's events.
//!
//! Grammar:
//! - `org:<org>` — organization-wide
//! - `org:<org>:conversation:<conv>` — per-conversation
//! - `org:<org>:typing:<conv>` — typing previews for one conversation
//! - `org:<org>:widget:<conv>` — widget-origin traffic
//! - `org:<org>:dashboard` — dashboard-only traffic

use uuid::Uuid;

/// A logical channel scope. Renders to exactly one wire-level topic
/// string, and parses back from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelScope {
    Organization(Uuid),
    Conversation(Uuid, Uuid),
    Typing(Uuid, Uuid),
    Widget(Uuid, Uuid),
    Dashboard(Uuid),
}

impl ChannelScope {
    /// Render the wire-level topic name for this scope.
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::Organization(org) => format!("org:{org}"),
            Self::Conversation(org, conv) => format!("org:{org}:conversation:{conv}"),
            Self::Typing(org, conv) => format!("org:{org}:typing:{conv}"),
            Self::Widget(org, conv) => format!("org:{org}:widget:{conv}"),
            Self::Dashboard(org) => format!("org:{org}:dashboard"),
        }
    }

    /// Parse a topic string back into its scope. Returns `None` for
    /// anything outside the canonical grammar.
    #[must_use]
    pub fn parse(topic: &str) -> Option<Self> {
        let rest = topic.strip_prefix("org:")?;
        let mut parts = rest.splitn(3, ':');
        let org: Uuid = parts.next()?.parse().ok()?;

        let Some(kind) = parts.next() else {
            return Some(Self::Organization(org));
        };
        match (kind, parts.next()) {
            ("dashboard", None) => Some(Self::Dashboard(org)),
            ("conversation", Some(conv)) => Some(Self::Conversation(org, conv.parse().ok()?)),
            ("typing", Some(conv)) => Some(Self::Typing(org, conv.parse().ok()?)),
            ("widget", Some(conv)) => Some(Self::Widget(org, conv.parse().ok()?)),
            _ => None,
        }
    }

    /// The organization this scope belongs to.
    #[must_use]
    pub fn organization_id(&self) -> Uuid {
        match self {
            Self::Organization(org)
            | Self::Conversation(org, _)
            | Self::Typing(org, _)
            | Self::Widget(org, _)
            | Self::Dashboard(org) => *org,
        }
    }
}

/// Organization-wide topic.
#[must_use]
pub fn organization(org: Uuid) -> String {
    ChannelScope::Organization(org).name()
}

/// Per-conversation topic.
#[must_use]
pub fn conversation(org: Uuid, conv: Uuid) -> String {
    ChannelScope::Conversation(org, conv).name()
}

/// Typing-preview topic for one conversation.
#[must_use]
pub fn typing(org: Uuid, conv: Uuid) -> String {
    ChannelScope::Typing(org, conv).name()
}

/// Widget-origin topic for one conversation.
#[must_use]
pub fn widget(org: Uuid, conv: Uuid) -> String {
    ChannelScope::Widget(org, conv).name()
}

/// Dashboard-only topic.
#[must_use]
pub fn dashboard(org: Uuid) -> String {
    ChannelScope::Dashboard(org).name()
}

#[cfg(test)]
#[path = "names_test.rs"]
mod tests;
