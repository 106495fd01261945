//! Dialogue store
//!
//! Append-only, bounded conversation history for one session, kept in the
//! shape language-model providers consume directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role of a dialogue message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments as streamed by the provider
    pub arguments: String,
}

/// One dialogue turn, immutable once created
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Set when role is `tool`: the call this message answers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Optional speaker label from the client (e.g. diarization)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    fn new(role: Role, content: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content,
            tool_calls: None,
            tool_call_id: None,
            speaker: None,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, Some(content.into()))
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, Some(content.into()))
    }

    #[must_use]
    pub fn user_with_speaker(content: impl Into<String>, speaker: impl Into<String>) -> Self {
        let mut message = Self::new(Role::User, Some(content.into()));
        message.speaker = Some(speaker.into());
        message
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, Some(content.into()))
    }

    /// Assistant message carrying tool-call requests; content may be empty
    #[must_use]
    pub fn assistant_with_tools(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        let mut message = Self::new(Role::Assistant, content);
        message.tool_calls = Some(tool_calls);
        message
    }

    /// Tool result answering `tool_call_id`
    #[must_use]
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut message = Self::new(Role::Tool, Some(content.into()));
        message.tool_call_id = Some(tool_call_id.into());
        message
    }

    #[must_use]
    pub const fn is_system(&self) -> bool {
        matches!(self.role, Role::System)
    }
}

/// Serializable dialogue snapshot for persistence collaborators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogueSnapshot {
    pub messages: Vec<Message>,
    pub max_messages: usize,
    pub keep_system: bool,
}

/// Ordered, bounded message history for one session
#[derive(Debug, Clone)]
pub struct Dialogue {
    messages: Vec<Message>,
    /// Nominal maximum; system messages may push the real length past it
    max_messages: usize,
    /// Never evict system messages, even over the maximum
    keep_system: bool,
}

impl Dialogue {
    #[must_use]
    pub const fn new(max_messages: usize, keep_system: bool) -> Self {
        Self {
            messages: Vec::new(),
            max_messages,
            keep_system,
        }
    }

    /// Append a message, evicting the oldest non-system messages past the max
    ///
    /// Eviction preserves relative order of survivors. Returns the id of the
    /// appended message.
    pub fn append(&mut self, message: Message) -> Uuid {
        let id = message.id;
        self.messages.push(message);
        self.evict();
        id
    }

    fn evict(&mut self) {
        while self.messages.len() > self.max_messages {
            let victim = self
                .messages
                .iter()
                .position(|m| !(self.keep_system && m.is_system()));
            match victim {
                Some(index) => {
                    let removed = self.messages.remove(index);
                    tracing::trace!(id = %removed.id, role = removed.role.as_str(), "evicted message");
                }
                // Only protected system messages remain
                None => break,
            }
        }
    }

    /// Full history in model-ready order: the system message (if any) first
    #[must_use]
    pub fn history(&self) -> Vec<Message> {
        let Some(system_index) = self.messages.iter().position(Message::is_system) else {
            return self.messages.clone();
        };
        if system_index == 0 {
            return self.messages.clone();
        }
        let mut ordered = Vec::with_capacity(self.messages.len());
        ordered.push(self.messages[system_index].clone());
        for (i, message) in self.messages.iter().enumerate() {
            if i != system_index {
                ordered.push(message.clone());
            }
        }
        ordered
    }

    /// The most recent `n` messages in order
    #[must_use]
    pub fn recent(&self, n: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }

    #[must_use]
    pub fn find_by_id(&self, id: Uuid) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Export for persistence collaborators
    #[must_use]
    pub fn snapshot(&self) -> DialogueSnapshot {
        DialogueSnapshot {
            messages: self.messages.clone(),
            max_messages: self.max_messages,
            keep_system: self.keep_system,
        }
    }

    /// Restore from a previously exported snapshot
    #[must_use]
    pub fn restore(snapshot: DialogueSnapshot) -> Self {
        let mut dialogue = Self::new(snapshot.max_messages, snapshot.keep_system);
        dialogue.messages = snapshot.messages;
        dialogue.evict();
        dialogue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_returns_findable_id() {
        let mut dialogue = Dialogue::new(10, true);
        let id = dialogue.append(Message::user("hello"));
        let found = dialogue.find_by_id(id).unwrap();
        assert_eq!(found.content.as_deref(), Some("hello"));
    }

    #[test]
    fn eviction_drops_oldest_non_system_first() {
        let mut dialogue = Dialogue::new(3, true);
        dialogue.append(Message::system("sys"));
        dialogue.append(Message::user("one"));
        dialogue.append(Message::assistant("two"));
        dialogue.append(Message::user("three"));

        assert_eq!(dialogue.len(), 3);
        let contents: Vec<_> = dialogue
            .history()
            .iter()
            .filter_map(|m| m.content.clone())
            .collect();
        assert_eq!(contents, vec!["sys", "two", "three"]);
    }

    #[test]
    fn eviction_is_idempotent_under_repeated_append() {
        let mut dialogue = Dialogue::new(4, true);
        dialogue.append(Message::system("sys"));
        for i in 0..50 {
            dialogue.append(Message::user(format!("msg-{i}")));
        }
        // Length never exceeds max + system count
        assert!(dialogue.len() <= 4);
        // Order preserved for survivors
        let contents: Vec<_> = dialogue
            .recent(3)
            .iter()
            .filter_map(|m| m.content.clone())
            .collect();
        assert_eq!(contents, vec!["msg-47", "msg-48", "msg-49"]);
    }

    #[test]
    fn system_messages_survive_past_nominal_max() {
        let mut dialogue = Dialogue::new(2, true);
        dialogue.append(Message::system("a"));
        dialogue.append(Message::system("b"));
        dialogue.append(Message::user("x"));
        dialogue.append(Message::user("y"));

        let systems = dialogue
            .history()
            .iter()
            .filter(|m| m.is_system())
            .count();
        assert_eq!(systems, 2);
    }

    #[test]
    fn keep_system_disabled_evicts_system() {
        let mut dialogue = Dialogue::new(2, false);
        dialogue.append(Message::system("sys"));
        dialogue.append(Message::user("one"));
        dialogue.append(Message::user("two"));

        assert_eq!(dialogue.len(), 2);
        assert!(dialogue.history().iter().all(|m| !m.is_system()));
    }

    #[test]
    fn history_prefixes_system_message() {
        let mut dialogue = Dialogue::new(10, true);
        dialogue.append(Message::user("first"));
        dialogue.append(Message::system("sys"));
        dialogue.append(Message::user("second"));

        let history = dialogue.history();
        assert!(history[0].is_system());
        assert_eq!(history[1].content.as_deref(), Some("first"));
        assert_eq!(history[2].content.as_deref(), Some("second"));
    }

    #[test]
    fn speaker_label_carried() {
        let message = Message::user_with_speaker("hello", "Alice");
        assert_eq!(message.role, Role::User);
        assert_eq!(message.speaker.as_deref(), Some("Alice"));
    }

    #[test]
    fn snapshot_round_trips() {
        let mut dialogue = Dialogue::new(5, true);
        dialogue.append(Message::system("sys"));
        dialogue.append(Message::user("hello"));

        let json = serde_json::to_string(&dialogue.snapshot()).unwrap();
        let restored = Dialogue::restore(serde_json::from_str(&json).unwrap());
        assert_eq!(restored.len(), 2);
        assert!(restored.history()[0].is_system());
    }

    #[test]
    fn tool_message_links_call_id() {
        let message = Message::tool("call_1", "result");
        assert_eq!(message.role, Role::Tool);
        assert_eq!(message.tool_call_id.as_deref(), Some("call_1"));
    }
}
