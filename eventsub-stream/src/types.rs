//! Core types for the eventsub-stream crate.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Upstream account (broadcaster) identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub String);

impl AccountId {
    /// Create a new account ID from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the account ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for AccountId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for AccountId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlates an issued subscription request with its eventual result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TicketId(u64);

impl TicketId {
    /// Create a new TicketId with the given value
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TicketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ticket-{}", self.0)
    }
}

/// Identifies one attached listener. Unique per id source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Create a new ListenerId with the given value
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Event kinds a session can subscribe to.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    /// A chat message was posted in the channel
    ChannelChatMessage,
    /// Someone followed the channel
    ChannelFollow,
    /// The channel raided another channel
    ChannelRaidFrom,
    /// Another channel raided this channel
    ChannelRaidTo,
    /// A channel point reward was redeemed
    ChannelRedemptionAdd,
    /// The stream went live
    ChannelStreamOnline,
    /// The stream went offline
    ChannelStreamOffline,
    /// Someone subscribed to the channel
    ChannelSubscription,
    /// Someone gifted subscriptions
    ChannelSubscriptionGift,
}

impl EventKind {
    /// Every supported kind, in table order.
    pub const ALL: [EventKind; 9] = [
        EventKind::ChannelChatMessage,
        EventKind::ChannelFollow,
        EventKind::ChannelRaidFrom,
        EventKind::ChannelRaidTo,
        EventKind::ChannelRedemptionAdd,
        EventKind::ChannelStreamOnline,
        EventKind::ChannelStreamOffline,
        EventKind::ChannelSubscription,
        EventKind::ChannelSubscriptionGift,
    ];

    /// Discriminator delivered to listeners alongside each event.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ChannelChatMessage => "channelChatMessage",
            EventKind::ChannelFollow => "channelFollow",
            EventKind::ChannelRaidFrom => "channelRaidFrom",
            EventKind::ChannelRaidTo => "channelRaidTo",
            EventKind::ChannelRedemptionAdd => "channelRedemptionAdd",
            EventKind::ChannelStreamOnline => "channelStreamOnline",
            EventKind::ChannelStreamOffline => "channelStreamOffline",
            EventKind::ChannelSubscription => "channelSubscription",
            EventKind::ChannelSubscriptionGift => "channelSubscriptionGift",
        }
    }

    /// Table entry describing how to subscribe to this kind.
    pub fn spec(&self) -> &'static KindSpec {
        // EVENT_KINDS is declared in the same order as ALL
        &EVENT_KINDS[*self as usize]
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown event kind: {s}"))
    }
}

/// Condition fields sent upstream with a subscription request.
pub type Condition = BTreeMap<String, String>;

/// Static description of how one event kind is subscribed upstream.
#[derive(Debug)]
pub struct KindSpec {
    /// Local discriminator
    pub kind: EventKind,
    /// Upstream subscription type
    pub upstream_type: &'static str,
    /// Upstream subscription version
    pub version: &'static str,
    /// Builds the condition for the given account
    pub condition: fn(&AccountId) -> Condition,
}

fn broadcaster(account: &AccountId) -> Condition {
    Condition::from([("broadcaster_user_id".to_string(), account.0.clone())])
}

fn broadcaster_and_user(account: &AccountId) -> Condition {
    Condition::from([
        ("broadcaster_user_id".to_string(), account.0.clone()),
        ("user_id".to_string(), account.0.clone()),
    ])
}

fn broadcaster_and_moderator(account: &AccountId) -> Condition {
    Condition::from([
        ("broadcaster_user_id".to_string(), account.0.clone()),
        ("moderator_user_id".to_string(), account.0.clone()),
    ])
}

fn raid_from(account: &AccountId) -> Condition {
    Condition::from([("from_broadcaster_user_id".to_string(), account.0.clone())])
}

fn raid_to(account: &AccountId) -> Condition {
    Condition::from([("to_broadcaster_user_id".to_string(), account.0.clone())])
}

/// Event kind -> upstream subscription table, resolved at compile time.
pub static EVENT_KINDS: [KindSpec; 9] = [
    KindSpec {
        kind: EventKind::ChannelChatMessage,
        upstream_type: "channel.chat.message",
        version: "1",
        condition: broadcaster_and_user,
    },
    KindSpec {
        kind: EventKind::ChannelFollow,
        upstream_type: "channel.follow",
        version: "2",
        condition: broadcaster_and_moderator,
    },
    KindSpec {
        kind: EventKind::ChannelRaidFrom,
        upstream_type: "channel.raid",
        version: "1",
        condition: raid_from,
    },
    KindSpec {
        kind: EventKind::ChannelRaidTo,
        upstream_type: "channel.raid",
        version: "1",
        condition: raid_to,
    },
    KindSpec {
        kind: EventKind::ChannelRedemptionAdd,
        upstream_type: "channel.channel_points_custom_reward_redemption.add",
        version: "1",
        condition: broadcaster,
    },
    KindSpec {
        kind: EventKind::ChannelStreamOnline,
        upstream_type: "stream.online",
        version: "1",
        condition: broadcaster,
    },
    KindSpec {
        kind: EventKind::ChannelStreamOffline,
        upstream_type: "stream.offline",
        version: "1",
        condition: broadcaster,
    },
    KindSpec {
        kind: EventKind::ChannelSubscription,
        upstream_type: "channel.subscribe",
        version: "1",
        condition: broadcaster,
    },
    KindSpec {
        kind: EventKind::ChannelSubscriptionGift,
        upstream_type: "channel.subscription.gift",
        version: "1",
        condition: broadcaster,
    },
];

/// Caller-supplied rewrite applied to an event payload before fan-out.
#[derive(Clone)]
pub struct Normalizer(Arc<dyn Fn(Value) -> Value + Send + Sync>);

impl Normalizer {
    /// Wrap a payload rewrite function.
    pub fn new(f: impl Fn(Value) -> Value + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Apply the rewrite.
    pub fn apply(&self, payload: Value) -> Value {
        (self.0)(payload)
    }
}

impl std::fmt::Debug for Normalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Normalizer(..)")
    }
}

/// One desired event subscription. Immutable once issued.
#[derive(Debug, Clone)]
pub struct SubscriptionRequest {
    /// Local event kind
    pub kind: EventKind,
    /// Upstream subscription type
    pub upstream_type: &'static str,
    /// Upstream subscription version
    pub version: &'static str,
    /// Target account condition
    pub condition: Condition,
    /// Optional payload rewrite
    pub normalizer: Option<Normalizer>,
}

impl SubscriptionRequest {
    /// Build the request for `kind` targeting `account` from the static table.
    pub fn for_kind(kind: EventKind, account: &AccountId) -> Self {
        let spec = kind.spec();
        Self {
            kind,
            upstream_type: spec.upstream_type,
            version: spec.version,
            condition: (spec.condition)(account),
            normalizer: None,
        }
    }

    /// Attach a payload rewrite to this request.
    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = Some(normalizer);
        self
    }
}

/// An upstream event tagged with its kind. The payload is not parsed further.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedEvent {
    /// Event kind discriminator
    pub kind: EventKind,
    /// Account whose session received the event
    pub account_id: AccountId,
    /// Upstream subscription the event was delivered for
    pub subscription_id: String,
    /// Raw payload
    pub payload: Value,
    /// When the session received the event
    pub received_at: DateTime<Utc>,
}

/// WebSocket-style close code reported by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseCode(u16);

impl CloseCode {
    /// Voluntary shutdown; never triggers a reconnect.
    pub const NORMAL: CloseCode = CloseCode(1000);

    /// Wrap a raw close code.
    pub fn new(code: u16) -> Self {
        Self(code)
    }

    /// Raw code value
    pub fn as_u16(&self) -> u16 {
        self.0
    }

    /// Whether this close was a normal shutdown.
    pub fn is_normal(&self) -> bool {
        *self == Self::NORMAL
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
