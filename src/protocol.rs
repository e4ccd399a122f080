// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Wire Protocol
//!
//! Every message is a single JSON object per WebSocket frame. Outbound
//! envelopes are `{"action": ..., "data": ...}`. Inbound frames from the
//! companion application use either the same shape or
//! `{"topic": ..., "payload": ...}`; both are accepted.
//!
//! Topic and action names form closed sets. Inbound topics that the relay
//! does not know about are still cached and routed, under [`Topic::Other`].

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors raised while decoding an inbound frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid frame: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("invalid payload for {topic}: {source}")]
    InvalidPayload {
        topic: String,
        #[source]
        source: serde_json::Error,
    },
}

// ============================================================================
// Topics (inbound)
// ============================================================================

/// Wire name of the classification marker sent by the primary instance.
pub const PRIMARY_INSTANCE_TOPIC: &str = "TWITCHAT_PRIMARY_INSTANCE";

/// Inbound message category.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// "I am the primary instance" classification marker.
    PrimaryInstance,
    CounterList,
    TriggerList,
    TimerList,
    ChatColumnsCount,
    QnaSessionList,
    GlobalStates,
    /// Any topic outside the known set, kept verbatim.
    Other(String),
}

impl Topic {
    /// Maps a wire name to a topic. The `SET_*` names are what the companion
    /// application answers `GET_*` requests with.
    pub fn from_wire(name: &str) -> Topic {
        match name {
            PRIMARY_INSTANCE_TOPIC => Topic::PrimaryInstance,
            "ON_COUNTER_LIST" | "SET_COUNTER_LIST" => Topic::CounterList,
            "ON_TRIGGER_LIST" | "SET_TRIGGER_LIST" => Topic::TriggerList,
            "ON_TIMER_LIST" | "SET_TIMER_LIST" => Topic::TimerList,
            "ON_CHAT_COLUMNS_COUNT" | "SET_CHAT_COLUMNS_COUNT" => Topic::ChatColumnsCount,
            "ON_QNA_SESSION_LIST" | "SET_QNA_SESSION_LIST" => Topic::QnaSessionList,
            "ON_GLOBAL_STATES" => Topic::GlobalStates,
            other => Topic::Other(other.to_string()),
        }
    }

    /// Canonical wire name.
    pub fn as_str(&self) -> &str {
        match self {
            Topic::PrimaryInstance => PRIMARY_INSTANCE_TOPIC,
            Topic::CounterList => "ON_COUNTER_LIST",
            Topic::TriggerList => "ON_TRIGGER_LIST",
            Topic::TimerList => "ON_TIMER_LIST",
            Topic::ChatColumnsCount => "ON_CHAT_COLUMNS_COUNT",
            Topic::QnaSessionList => "ON_QNA_SESSION_LIST",
            Topic::GlobalStates => "ON_GLOBAL_STATES",
            Topic::Other(name) => name,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// State payloads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub value: f64,
    #[serde(default, rename = "perUser")]
    pub per_user: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CounterList {
    #[serde(default)]
    pub counters: Vec<CounterEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerList {
    #[serde(default)]
    pub trigger_list: Vec<TriggerEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerKind {
    Timer,
    Countdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerEntry {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(rename = "type")]
    pub kind: TimerKind,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub paused: bool,
    #[serde(default, rename = "startAt_ms")]
    pub start_at_ms: Option<u64>,
    #[serde(default, rename = "pausedAt_ms")]
    pub paused_at_ms: Option<u64>,
    #[serde(default, rename = "offset_ms")]
    pub offset_ms: i64,
    #[serde(default, rename = "duration_ms")]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerList {
    #[serde(default)]
    pub timer_list: Vec<TimerEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChatColumnsCount {
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QnaSession {
    pub id: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub open: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QnaSessionList {
    #[serde(default)]
    pub session_list: Vec<QnaSession>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterValue {
    pub id: String,
    pub value: f64,
}

/// A bingo grid configured in the companion application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BingoGridEntry {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// An animated text overlay configured in the companion application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnimatedTextEntry {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub enabled: bool,
}

/// Aggregated toggle states of the companion application. Fields the relay
/// does not model are kept in `extra`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalStates {
    pub emergency_mode: bool,
    pub censorship_enabled: bool,
    pub message_merge_enabled: bool,
    pub moderation_tools_visible: bool,
    pub show_viewer_count: bool,
    pub voice_control_enabled: bool,
    pub has_active_chat_alert: bool,
    pub has_active_poll: bool,
    pub has_active_prediction: bool,
    pub has_active_raffle_with_entries: bool,
    pub is_message_highlighted: bool,
    pub tts_speaking: bool,
    pub last_raider_name: Option<String>,
    pub counter_values: Vec<CounterValue>,
    pub bingo_grid_list: Vec<BingoGridEntry>,
    pub animated_text_list: Vec<AnimatedTextEntry>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// A decoded state event, one variant per known state topic.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    CounterList(CounterList),
    TriggerList(TriggerList),
    TimerList(TimerList),
    ChatColumnsCount(ChatColumnsCount),
    QnaSessionList(QnaSessionList),
    GlobalStates(GlobalStates),
    Other { topic: String, payload: Value },
}

impl Event {
    /// Topic this event is cached and routed under.
    pub fn topic(&self) -> Topic {
        match self {
            Event::CounterList(_) => Topic::CounterList,
            Event::TriggerList(_) => Topic::TriggerList,
            Event::TimerList(_) => Topic::TimerList,
            Event::ChatColumnsCount(_) => Topic::ChatColumnsCount,
            Event::QnaSessionList(_) => Topic::QnaSessionList,
            Event::GlobalStates(_) => Topic::GlobalStates,
            Event::Other { topic, .. } => Topic::Other(topic.clone()),
        }
    }
}

/// A fully decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// The sender claims to be the primary companion instance.
    ClaimPrimary { secret: Option<String> },
    Event(Event),
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(alias = "action")]
    topic: String,
    #[serde(default, alias = "data")]
    payload: Value,
}

#[derive(Debug, Default, Deserialize)]
struct ClaimPayload {
    #[serde(default)]
    secret: Option<String>,
}

fn typed<T: DeserializeOwned>(topic: &Topic, payload: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(payload).map_err(|source| ProtocolError::InvalidPayload {
        topic: topic.to_string(),
        source,
    })
}

/// Decodes one inbound text frame.
pub fn decode_frame(text: &str) -> Result<Inbound, ProtocolError> {
    let raw: RawFrame = serde_json::from_str(text)?;
    let topic = Topic::from_wire(&raw.topic);

    let event = match topic {
        Topic::PrimaryInstance => {
            let claim: ClaimPayload = if raw.payload.is_null() {
                ClaimPayload::default()
            } else {
                typed(&topic, raw.payload)?
            };
            return Ok(Inbound::ClaimPrimary {
                secret: claim.secret,
            });
        }
        Topic::CounterList => Event::CounterList(typed(&topic, raw.payload)?),
        Topic::TriggerList => Event::TriggerList(typed(&topic, raw.payload)?),
        Topic::TimerList => Event::TimerList(typed(&topic, raw.payload)?),
        Topic::ChatColumnsCount => Event::ChatColumnsCount(typed(&topic, raw.payload)?),
        Topic::QnaSessionList => Event::QnaSessionList(typed(&topic, raw.payload)?),
        Topic::GlobalStates => Event::GlobalStates(typed(&topic, raw.payload)?),
        Topic::Other(name) => Event::Other {
            topic: name,
            payload: raw.payload,
        },
    };

    Ok(Inbound::Event(event))
}

// ============================================================================
// Actions (outbound)
// ============================================================================

macro_rules! actions {
    ($($variant:ident => $wire:literal,)*) => {
        /// Outbound request or command understood by the companion application.
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub enum Action {
            $($variant,)*
            /// Escape hatch for commands added on the companion side first.
            Custom(String),
        }

        impl Action {
            pub fn as_str(&self) -> &str {
                match self {
                    $(Action::$variant => $wire,)*
                    Action::Custom(name) => name,
                }
            }

            pub fn from_wire(name: &str) -> Action {
                match name {
                    $($wire => Action::$variant,)*
                    other => Action::Custom(other.to_string()),
                }
            }
        }
    };
}

actions! {
    Connected => "CONNECTED",
    GetAllCounters => "GET_ALL_COUNTERS",
    GetTriggerList => "GET_TRIGGER_LIST",
    GetTimerList => "GET_TIMER_LIST",
    GetChatColumnsCount => "GET_CHAT_COLUMNS_COUNT",
    GetQnaSessionList => "GET_QNA_SESSION_LIST",
    GetGlobalStates => "GET_GLOBAL_STATES",
    AutomodAccept => "SET_AUTOMOD_ACCEPT",
    AutomodReject => "SET_AUTOMOD_REJECT",
    BingoToggle => "BINGO_TOGGLE",
    CensorDeletedMessagesToggle => "SET_CENSOR_DELETED_MESSAGES_TOGGLE",
    ChatFeedRead => "SET_CHAT_FEED_READ",
    ChatFeedReadAll => "SET_CHAT_FEED_READ_ALL",
    ChatFeedPause => "SET_CHAT_FEED_PAUSE_STATE",
    ChatFeedUnpause => "SET_CHAT_FEED_UNPAUSE",
    ChatFeedScroll => "SET_CHAT_FEED_SCROLL",
    ChatFeedScrollBottom => "SET_CHAT_FEED_SCROLL_BOTTOM",
    ChatFeedSelect => "SET_CHAT_FEED_SELECT",
    ChatFeedSelectChoosingAction => "SET_CHAT_FEED_SELECT_CHOOSING_ACTION",
    ChatFeedSelectActionDelete => "SET_CHAT_FEED_SELECT_ACTION_DELETE",
    ChatFeedSelectActionBan => "SET_CHAT_FEED_SELECT_ACTION_BAN",
    ChatFeedSelectActionSave => "SET_CHAT_FEED_SELECT_ACTION_SAVE",
    ChatFeedSelectActionHighlight => "SET_CHAT_FEED_SELECT_ACTION_HIGHLIGHT",
    ChatFeedSelectActionShoutout => "SET_CHAT_FEED_SELECT_ACTION_SHOUTOUT",
    ChatFeedSelectActionCancel => "SET_CHAT_FEED_SELECT_ACTION_CANCEL",
    ClearChatHighlight => "SET_CLEAR_CHAT_HIGHLIGHT",
    CountdownAdd => "SET_COUNTDOWN_ADD",
    CounterAdd => "SET_COUNTER_ADD",
    DisableStt => "SET_DISABLE_STT",
    EnableStt => "SET_ENABLE_STT",
    ExecuteTrigger => "SET_EXECUTE_TRIGGER",
    GreetFeedRead => "SET_GREET_FEED_READ",
    GreetFeedReadAll => "SET_GREET_FEED_READ_ALL",
    HideChatAlert => "SET_HIDE_CHAT_ALERT",
    MergeToggle => "SET_MERGE_TOGGLE",
    ModToolsToggle => "SET_MOD_TOOLS_TOGGLE",
    PollToggle => "SET_POLL_TOGGLE",
    PredictionToggle => "PREDICTION_TOGGLE",
    QnaHighlight => "SET_QNA_HIGHLIGHT",
    QnaSkip => "SET_QNA_SKIP",
    RafflePickWinner => "SET_RAFFLE_PICK_WINNER",
    RaffleToggle => "SET_RAFFLE_TOGGLE",
    SendMessage => "SET_SEND_MESSAGE",
    SetEmergencyMode => "SET_EMERGENCY_MODE",
    ShoutoutLastRaider => "SET_SHOUTOUT_LAST_RAIDER",
    StopTts => "SET_STOP_CURRENT_TTS_AUDIO",
    TimerAdd => "SET_TIMER_ADD",
    ToggleTrigger => "SET_TRIGGER_STATE",
    ViewersCountToggle => "SET_VIEWERS_COUNT_TOGGLE",
    VoiceControl => "SET_VOICE_CONTROL_STATE",
    BingoGridVisibility => "SET_BINGO_GRID_CONFIGS_VISIBILITY_FROM_SD",
    AnimatedTextContent => "SET_ANIMATED_TEXT_CONTENT_FROM_SD",
    // Older companion builds only understand these names.
    LegacyChatFeedScrollUp => "CHAT_FEED_SCROLL_UP",
    LegacyChatFeedScrollDown => "CHAT_FEED_SCROLL_DOWN",
    LegacyChatFeedRead => "CHAT_FEED_READ",
    LegacyGreetFeedRead => "GREET_FEED_READ",
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requests issued to a freshly classified primary connection so the topic
/// cache is warm before any widget asks.
pub const STATE_REQUESTS: [Action; 6] = [
    Action::GetAllCounters,
    Action::GetTriggerList,
    Action::GetTimerList,
    Action::GetChatColumnsCount,
    Action::GetQnaSessionList,
    Action::GetGlobalStates,
];

// ============================================================================
// Command payloads
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CounterOp {
    #[serde(rename = "ADD")]
    Add,
    #[serde(rename = "DEL")]
    Del,
    #[serde(rename = "SET")]
    Set,
}

/// `value` is a string because the companion evaluates arithmetic
/// expressions and placeholders in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterAdd {
    pub id: String,
    pub value: String,
    pub action: CounterOp,
}

/// Payload of [`Action::TimerAdd`] and [`Action::CountdownAdd`]. A missing id
/// targets the default timer/countdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeAdd {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ById {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleTrigger {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forced_state: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatFeedTarget {
    /// Zero-based chat column index.
    pub col_index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyMode {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_confirmation: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessage {
    pub message: String,
}

/// Payload of the legacy scroll commands. `scroll_by` is in pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatFeedScrollBy {
    pub scroll_by: i32,
    pub col_index: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GreetFeedRead {
    pub message_count: u32,
}

/// Payload of [`Action::AnimatedTextContent`]. The companion echoes
/// `query_id` back in its completion events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnimatedTextContent {
    pub query_id: String,
    pub id: String,
    pub text: String,
    pub auto_hide: bool,
}

impl AnimatedTextContent {
    /// Builds the payload with a fresh query id.
    pub fn new(id: impl Into<String>, text: impl Into<String>, auto_hide: bool) -> Self {
        AnimatedTextContent {
            query_id: uuid::Uuid::new_v4().to_string(),
            id: id.into(),
            text: text.into(),
            auto_hide,
        }
    }
}

// ============================================================================
// Envelope encoding
// ============================================================================

/// Outbound wire envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Envelope {
    pub fn new(action: &Action, data: Option<Value>) -> Self {
        Envelope {
            action: action.as_str().to_string(),
            data,
        }
    }

    /// Serializes the envelope to its JSON text form.
    pub fn encode(&self) -> String {
        // An Envelope only holds a String and a serde_json::Value, whose
        // serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Serializes a typed command payload into an envelope data value.
pub fn payload<T: Serialize>(value: &T) -> Option<Value> {
    serde_json::to_value(value).ok()
}
