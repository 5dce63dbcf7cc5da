//! Push channel scope and message model.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::UserId;

/// Scope of a push subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopicFilter {
    /// Messages addressed to one user (`?userId=<id>`).
    Targeted(UserId),
    /// Unscoped messages.
    Broadcast,
}

impl TopicFilter {
    /// Query parameters selecting this scope on the event stream.
    #[must_use]
    pub fn query(&self) -> Vec<(&'static str, String)> {
        match self {
            Self::Targeted(user) => vec![("userId", user.as_str().to_string())],
            Self::Broadcast => Vec::new(),
        }
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Targeted(user) => write!(formatter, "user:{user}"),
            Self::Broadcast => formatter.write_str("broadcast"),
        }
    }
}

/// One inbound message: `{ "type": "<domain>.<verb>", "data": {...} }`.
///
/// The payload is opaque to the synchronization core; consumers treat a
/// message as a hint to re-fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    /// Dot-namespaced topic.
    #[serde(rename = "type")]
    pub topic: String,
    /// Opaque payload.
    #[serde(default)]
    pub data: Value,
}

impl PushMessage {
    /// Creates a message.
    #[must_use]
    pub fn new(topic: impl Into<String>, data: Value) -> Self {
        Self {
            topic: topic.into(),
            data,
        }
    }

    /// Domain part of the topic (`calendar` for `calendar.created`).
    #[must_use]
    pub fn domain(&self) -> &str {
        self.topic
            .split_once('.')
            .map_or(self.topic.as_str(), |(domain, _)| domain)
    }

    /// Returns `true` when the topic starts with `domain` followed by a dot.
    #[must_use]
    pub fn matches_domain(&self, domain: &str) -> bool {
        self.topic
            .strip_prefix(domain)
            .is_some_and(|rest| rest.starts_with('.'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case("calendar.created", "calendar", true)]
    #[case("calendar.deleted", "calendar", true)]
    #[case("standup.commented", "calendar", false)]
    #[case("calendar", "calendar", false)]
    #[case("calendars.created", "calendar", false)]
    #[case("ticket.updated", "ticket", true)]
    fn test_matches_domain(#[case] topic: &str, #[case] domain: &str, #[case] expected: bool) {
        let message = PushMessage::new(topic, Value::Null);
        assert_eq!(message.matches_domain(domain), expected);
    }

    #[rstest]
    fn test_domain_is_prefix_before_first_dot() {
        assert_eq!(PushMessage::new("standup.commented", Value::Null).domain(), "standup");
        assert_eq!(PushMessage::new("ping", Value::Null).domain(), "ping");
    }

    #[rstest]
    fn test_decodes_wire_type_field() {
        let message: PushMessage =
            serde_json::from_value(json!({ "type": "calendar.created", "data": { "id": "e-1" } }))
                .unwrap();

        assert_eq!(message.topic, "calendar.created");
        assert_eq!(message.data["id"], "e-1");
    }

    #[rstest]
    fn test_filter_query() {
        assert_eq!(
            TopicFilter::Targeted(UserId::new("u-1")).query(),
            [("userId", "u-1".to_string())]
        );
        assert!(TopicFilter::Broadcast.query().is_empty());
    }
}
