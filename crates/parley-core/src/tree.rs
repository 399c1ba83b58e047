//! Conversation trees.
//!
//! A conversation is an arena of [`MessageNode`]s keyed by id. Nodes point at
//! their parent and list their children; [`ConversationHistory::repair_links`]
//! restores that two-way consistency after merges.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use parley_llm::{FinishReason, Usage};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{ModelCatalog, Source};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Content and metadata
// ---------------------------------------------------------------------------

/// Message content, keyed by the upstream `content_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "content_type", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        #[serde(default)]
        parts: Vec<String>,
    },
    MultimodalText {
        #[serde(default)]
        parts: Vec<Value>,
    },
    Code {
        #[serde(default)]
        language: Option<String>,
        #[serde(default)]
        text: String,
    },
    ExecutionOutput {
        #[serde(default)]
        text: String,
    },
    Stderr {
        #[serde(default)]
        text: String,
    },
    TetherBrowsingDisplay {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        summary: Option<String>,
    },
    TetherQuote {
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        domain: Option<String>,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        text: String,
    },
    SystemError {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        text: String,
    },
    /// Content of a kind this crate does not know, kept as received.
    Fallback { raw: Value },
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        MessageContent::Text {
            parts: vec![text.into()],
        }
    }

    pub fn from_upstream(raw: &Value) -> Self {
        match serde_json::from_value::<MessageContent>(raw.clone()) {
            Ok(MessageContent::Fallback { .. }) | Err(_) => {
                tracing::debug!(
                    content_type = ?raw.get("content_type"),
                    "keeping unrecognized content as fallback"
                );
                MessageContent::Fallback { raw: raw.clone() }
            }
            Ok(content) => content,
        }
    }

    /// Plain text view, used when replaying context to a stateless source.
    pub fn plain_text(&self) -> Option<String> {
        match self {
            MessageContent::Text { parts } => Some(parts.concat()),
            MessageContent::MultimodalText { parts } => Some(
                parts
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            MessageContent::Code { text, .. }
            | MessageContent::ExecutionOutput { text }
            | MessageContent::Stderr { text }
            | MessageContent::TetherQuote { text, .. }
            | MessageContent::SystemError { text, .. } => Some(text.clone()),
            MessageContent::TetherBrowsingDisplay { result, .. } => result.clone(),
            MessageContent::Fallback { .. } => None,
        }
    }
}

/// Browser-session message fields that have no place in the shared shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserMetadata {
    pub weight: Option<f64>,
    pub end_turn: Option<bool>,
    pub recipient: Option<String>,
    pub message_status: Option<String>,
    pub finish_details: Option<Value>,
    pub invoked_plugin: Option<Value>,
    pub command: Option<String>,
    pub args: Option<Value>,
    pub status: Option<String>,
    #[serde(rename = "_cite_metadata")]
    pub cite_metadata: Option<Value>,
    pub citations: Option<Vec<Value>>,
    pub attachments: Option<Vec<Value>>,
    pub is_complete: Option<bool>,
    pub aggregate_result: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum MessageMetadata {
    BrowserSession(BrowserMetadata),
    Api {
        #[serde(default)]
        usage: Option<Usage>,
        #[serde(default)]
        finish_reason: Option<FinishReason>,
    },
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageNode {
    pub id: Uuid,
    pub role: Role,
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub create_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parent: Option<Uuid>,
    #[serde(default)]
    pub children: Vec<Uuid>,
    #[serde(default)]
    pub content: Option<MessageContent>,
    #[serde(default)]
    pub metadata: Option<MessageMetadata>,
}

impl MessageNode {
    pub fn new(id: Uuid, role: Role, content: MessageContent) -> Self {
        Self {
            id,
            role,
            author_name: None,
            model: None,
            create_time: Some(Utc::now()),
            parent: None,
            children: Vec::new(),
            content: Some(content),
            metadata: None,
        }
    }

    /// A structural node without a message, like the hidden root of an
    /// upstream conversation.
    fn empty(id: Uuid) -> Self {
        Self {
            id,
            role: Role::System,
            author_name: None,
            model: None,
            create_time: None,
            parent: None,
            children: Vec::new(),
            content: None,
            metadata: None,
        }
    }

    /// Convert one upstream `message` object. Parent and children are left
    /// empty; they live outside the message in the upstream format.
    pub fn from_upstream_message(message: &Value, catalog: &ModelCatalog) -> Result<Self> {
        let obj = message
            .as_object()
            .ok_or_else(|| Error::Parse("message is not an object".into()))?;
        let id = parse_uuid(obj.get("id"), "message id")?;

        let author = obj.get("author");
        let role_raw = present(author, "role")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Parse(format!("message {id} has no author role")))?;
        let role = Role::parse(role_raw)
            .ok_or_else(|| Error::Parse(format!("message {id} has unknown role {role_raw:?}")))?;

        let meta = obj.get("metadata");
        let str_field = |v: Option<&Value>, key: &str| {
            present(v, key)
                .and_then(Value::as_str)
                .map(ToString::to_string)
        };

        let metadata = BrowserMetadata {
            weight: present(Some(message), "weight").and_then(Value::as_f64),
            end_turn: present(Some(message), "end_turn").and_then(Value::as_bool),
            recipient: str_field(Some(message), "recipient"),
            message_status: str_field(meta, "message_status"),
            finish_details: present(meta, "finish_details").cloned(),
            invoked_plugin: present(meta, "invoked_plugin").cloned(),
            command: str_field(meta, "command"),
            args: present(meta, "args").cloned(),
            status: str_field(Some(message), "status"),
            cite_metadata: present(meta, "_cite_metadata").cloned(),
            citations: present(meta, "citations").and_then(Value::as_array).cloned(),
            attachments: present(meta, "attachments")
                .and_then(Value::as_array)
                .cloned(),
            is_complete: present(meta, "is_complete").and_then(Value::as_bool),
            aggregate_result: present(meta, "aggregate_result").cloned(),
        };

        Ok(Self {
            id,
            role,
            author_name: str_field(author, "name"),
            model: str_field(meta, "model_slug").map(|code| catalog.from_code(&code)),
            create_time: present(Some(message), "create_time")
                .and_then(Value::as_f64)
                .and_then(from_epoch_secs),
            parent: None,
            children: Vec::new(),
            content: present(Some(message), "content").map(MessageContent::from_upstream),
            metadata: Some(MessageMetadata::BrowserSession(metadata)),
        })
    }

    pub fn plain_text(&self) -> Option<String> {
        self.content.as_ref().and_then(MessageContent::plain_text)
    }
}

// ---------------------------------------------------------------------------
// Histories
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationHistory {
    pub id: Uuid,
    pub source: Source,
    pub title: String,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    pub mapping: BTreeMap<Uuid, MessageNode>,
    pub current_node: Uuid,
    #[serde(default)]
    pub current_model: Option<String>,
    /// Source-specific top-level fields (moderation results, plugin ids).
    #[serde(default)]
    pub source_metadata: serde_json::Map<String, Value>,
}

const UPSTREAM_TOP_LEVEL: &[&str] = &[
    "id",
    "conversation_id",
    "title",
    "create_time",
    "update_time",
    "mapping",
    "current_node",
];

impl ConversationHistory {
    /// A new history holding a single root node.
    pub fn new(id: Uuid, source: Source, title: impl Into<String>, mut root: MessageNode) -> Self {
        let now = Utc::now();
        root.parent = None;
        let current_node = root.id;
        let current_model = root.model.clone();
        Self {
            id,
            source,
            title: title.into(),
            create_time: now,
            update_time: now,
            mapping: BTreeMap::from([(current_node, root)]),
            current_node,
            current_model,
            source_metadata: serde_json::Map::new(),
        }
    }

    /// Build a history from an upstream `conversation/{id}` payload.
    ///
    /// Entries without a message become content-less system nodes so the
    /// tree stays rooted. Unrecognized content kinds are kept as
    /// [`MessageContent::Fallback`]; only structural defects fail.
    pub fn from_upstream(id: Uuid, raw: &Value, catalog: &ModelCatalog) -> Result<Self> {
        let raw_mapping = raw
            .get("mapping")
            .and_then(Value::as_object)
            .ok_or_else(|| Error::Parse(format!("conversation {id} has no mapping")))?;
        if raw_mapping.is_empty() {
            return Err(Error::Parse(format!("conversation {id} has an empty mapping")));
        }

        let mut mapping = BTreeMap::new();
        for (key, entry) in raw_mapping {
            let node_id = Uuid::parse_str(key)
                .map_err(|_| Error::Parse(format!("node key {key:?} is not a uuid")))?;
            let mut node = match present(Some(entry), "message") {
                Some(message) => MessageNode::from_upstream_message(message, catalog)?,
                None => MessageNode::empty(node_id),
            };
            node.id = node_id;
            node.parent = match present(Some(entry), "parent") {
                Some(parent) => Some(parse_uuid(Some(parent), "parent id")?),
                None => None,
            };
            node.children = match present(Some(entry), "children") {
                Some(Value::Array(children)) => children
                    .iter()
                    .map(|c| parse_uuid(Some(c), "child id"))
                    .collect::<Result<_>>()?,
                Some(_) => {
                    return Err(Error::Parse(format!("children of {node_id} is not a list")));
                }
                None => Vec::new(),
            };
            mapping.insert(node_id, node);
        }

        let now = Utc::now();
        let epoch = |key: &str| {
            present(Some(raw), key)
                .and_then(Value::as_f64)
                .and_then(from_epoch_secs)
        };
        let current_node = match present(Some(raw), "current_node") {
            Some(v) => parse_uuid(Some(v), "current node")?,
            None => Uuid::nil(),
        };
        let source_metadata = raw
            .as_object()
            .map(|obj| {
                obj.iter()
                    .filter(|(k, _)| !UPSTREAM_TOP_LEVEL.contains(&k.as_str()))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default();

        let mut history = Self {
            id,
            source: Source::BrowserSession,
            title: present(Some(raw), "title")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            create_time: epoch("create_time").unwrap_or(now),
            update_time: epoch("update_time").unwrap_or(now),
            mapping,
            current_node,
            current_model: None,
            source_metadata,
        };
        history.repair_links();
        history.current_model = history.latest_model().map(ToString::to_string);
        Ok(history)
    }

    pub fn current(&self) -> Option<&MessageNode> {
        self.mapping.get(&self.current_node)
    }

    /// The first parentless node.
    pub fn root(&self) -> Option<Uuid> {
        self.mapping
            .values()
            .find(|n| n.parent.is_none())
            .map(|n| n.id)
    }

    pub fn latest_model(&self) -> Option<&str> {
        self.latest_model_from(self.current_node)
    }

    /// Walk parent pointers from `start` to the first node that names a model.
    pub fn latest_model_from(&self, start: Uuid) -> Option<&str> {
        self.ancestors(start)
            .find_map(|node| node.model.as_deref())
    }

    /// Nodes from `start` up to the root, `start` first.
    pub fn ancestors(&self, start: Uuid) -> impl Iterator<Item = &MessageNode> {
        let mut cursor = Some(start);
        let mut remaining = self.mapping.len();
        std::iter::from_fn(move || {
            if remaining == 0 {
                return None;
            }
            remaining -= 1;
            let node = self.mapping.get(&cursor?)?;
            cursor = node.parent;
            Some(node)
        })
    }

    /// Nodes from the root down to `id`, root first.
    pub fn path_to(&self, id: Uuid) -> Vec<&MessageNode> {
        let mut path: Vec<_> = self.ancestors(id).collect();
        path.reverse();
        path
    }

    pub fn current_path(&self) -> Vec<&MessageNode> {
        self.path_to(self.current_node)
    }

    /// Attach `node` under `parent_id` and make it the current node.
    pub fn append(&mut self, parent_id: Uuid, mut node: MessageNode) -> Result<()> {
        if self.mapping.contains_key(&node.id) {
            return Err(Error::Integrity(format!(
                "node {} already exists in conversation {}",
                node.id, self.id
            )));
        }
        let parent = self.mapping.get_mut(&parent_id).ok_or_else(|| {
            Error::Integrity(format!(
                "parent {parent_id} is not part of conversation {}",
                self.id
            ))
        })?;
        parent.children.push(node.id);

        node.parent = Some(parent_id);
        self.current_node = node.id;
        if let Some(model) = &node.model {
            self.current_model = Some(model.clone());
        }
        self.mapping.insert(node.id, node);
        Ok(())
    }

    /// Replace an existing node's payload in place, or append it under its
    /// parent. Either way it becomes the current node.
    pub fn upsert_node(&mut self, node: MessageNode) -> Result<()> {
        if let Some(existing) = self.mapping.get_mut(&node.id) {
            existing.role = node.role;
            existing.author_name = node.author_name;
            existing.content = node.content;
            existing.metadata = node.metadata;
            if node.model.is_some() {
                existing.model = node.model.clone();
            }
            self.current_node = node.id;
            if let Some(model) = node.model {
                self.current_model = Some(model);
            }
            return Ok(());
        }
        let parent = node.parent.ok_or_else(|| {
            Error::Integrity(format!("node {} has no parent to attach to", node.id))
        })?;
        self.append(parent, node)
    }

    /// Restore parent/children consistency: parents outside the mapping are
    /// cut, child lists only keep back-referencing ids, missing children are
    /// added in creation order, and a dangling current node falls back to the
    /// deepest node below the root.
    pub fn repair_links(&mut self) {
        let ids: HashSet<Uuid> = self.mapping.keys().copied().collect();

        for node in self.mapping.values_mut() {
            if let Some(parent) = node.parent
                && !ids.contains(&parent)
            {
                tracing::warn!(node = %node.id, %parent, "cutting link to missing parent");
                node.parent = None;
            }
        }

        let parent_of: BTreeMap<Uuid, Option<Uuid>> =
            self.mapping.values().map(|n| (n.id, n.parent)).collect();
        for node in self.mapping.values_mut() {
            let mut seen = HashSet::new();
            let id = node.id;
            node.children
                .retain(|c| parent_of.get(c) == Some(&Some(id)) && seen.insert(*c));
        }

        let mut missing: Vec<(Option<DateTime<Utc>>, Uuid, Uuid)> = Vec::new();
        for node in self.mapping.values() {
            if let Some(parent) = node.parent
                && !self.mapping[&parent].children.contains(&node.id)
            {
                missing.push((node.create_time, node.id, parent));
            }
        }
        missing.sort();
        for (_, child, parent) in missing {
            if let Some(parent) = self.mapping.get_mut(&parent) {
                parent.children.push(child);
            }
        }

        if !self.mapping.contains_key(&self.current_node)
            && let Some(root) = self.root()
        {
            self.current_node = self.deepest_below(root);
        }
    }

    /// Follow the newest child from `start` down to a leaf.
    fn deepest_below(&self, start: Uuid) -> Uuid {
        let mut cursor = start;
        for _ in 0..self.mapping.len() {
            match self.mapping.get(&cursor).and_then(|n| n.children.last()) {
                Some(child) => cursor = *child,
                None => break,
            }
        }
        cursor
    }

    /// Merge an upstream-authoritative tree with the local copy.
    ///
    /// Upstream nodes win. Local-only nodes are kept while their parent is
    /// part of the merged tree.
    pub fn reconcile(upstream: ConversationHistory, local: Option<ConversationHistory>) -> Self {
        let mut merged = upstream;
        if let Some(local) = local {
            if merged.current_model.is_none() {
                merged.current_model = local.current_model;
            }
            let mut pending: Vec<MessageNode> = local
                .mapping
                .into_values()
                .filter(|n| !merged.mapping.contains_key(&n.id))
                .collect();
            loop {
                let before = pending.len();
                pending.retain(|node| match node.parent {
                    Some(parent) if merged.mapping.contains_key(&parent) => {
                        merged.mapping.insert(node.id, node.clone());
                        false
                    }
                    _ => true,
                });
                if pending.is_empty() || pending.len() == before {
                    break;
                }
            }
            if !pending.is_empty() {
                tracing::warn!(
                    conversation = %merged.id,
                    dropped = pending.len(),
                    "local nodes lost their parent upstream"
                );
            }
        }

        merged.repair_links();
        if let Some(model) = merged.latest_model() {
            merged.current_model = Some(model.to_string());
        }
        merged
    }
}

fn present<'a>(value: Option<&'a Value>, key: &str) -> Option<&'a Value> {
    value?.get(key).filter(|v| !v.is_null())
}

fn parse_uuid(value: Option<&Value>, what: &str) -> Result<Uuid> {
    let raw = value
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Parse(format!("{what} is missing or not a string")))?;
    Uuid::parse_str(raw).map_err(|_| Error::Parse(format!("{what} {raw:?} is not a uuid")))
}

fn from_epoch_secs(secs: f64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros((secs * 1_000_000.0) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(id: Uuid, model: Option<&str>) -> MessageNode {
        let mut node = MessageNode::new(id, Role::Assistant, MessageContent::text("hi"));
        node.model = model.map(ToString::to_string);
        node
    }

    fn chain() -> (ConversationHistory, Uuid, Uuid, Uuid) {
        let (root, a, b) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut history =
            ConversationHistory::new(Uuid::new_v4(), Source::Api, "t", node(root, None));
        history.append(root, node(a, None)).unwrap();
        history.append(a, node(b, Some("gpt-4"))).unwrap();
        (history, root, a, b)
    }

    #[test]
    fn latest_model_walks_to_ancestors() {
        let (history, root, a, b) = chain();
        assert_eq!(history.latest_model_from(b), Some("gpt-4"));
        assert_eq!(history.latest_model_from(root), None);

        // A node below the model-carrying one inherits it.
        let mut history = history;
        let c = Uuid::new_v4();
        history.append(b, node(c, None)).unwrap();
        assert_eq!(history.latest_model_from(c), Some("gpt-4"));
        assert_eq!(history.latest_model_from(a), None);
    }

    #[test]
    fn append_links_both_directions() {
        let (history, root, a, b) = chain();
        assert_eq!(history.mapping[&root].children, vec![a]);
        assert_eq!(history.mapping[&b].parent, Some(a));
        assert_eq!(history.current_node, b);
        assert_eq!(history.current_model.as_deref(), Some("gpt-4"));
        let path: Vec<_> = history.current_path().iter().map(|n| n.id).collect();
        assert_eq!(path, vec![root, a, b]);
    }

    #[test]
    fn append_to_missing_parent_is_an_integrity_error() {
        let (mut history, ..) = chain();
        let err = history
            .append(Uuid::new_v4(), node(Uuid::new_v4(), None))
            .unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
    }

    #[test]
    fn upsert_replaces_in_place() {
        let (mut history, _, a, b) = chain();
        let mut updated = node(b, None);
        updated.content = Some(MessageContent::text("hi there"));
        history.upsert_node(updated).unwrap();

        assert_eq!(history.mapping.len(), 3);
        assert_eq!(history.mapping[&b].parent, Some(a));
        assert_eq!(history.mapping[&b].plain_text().as_deref(), Some("hi there"));
        assert_eq!(history.mapping[&b].model.as_deref(), Some("gpt-4"));
    }

    fn upstream_payload(root: Uuid, user: Uuid, reply: Uuid, odd: Uuid) -> Value {
        json!({
            "title": "Greetings",
            "create_time": 1_690_000_000.5,
            "update_time": 1_690_000_100.0,
            "current_node": reply.to_string(),
            "moderation_results": [],
            "mapping": {
                root.to_string(): { "id": root.to_string(), "message": null, "parent": null, "children": [user.to_string()] },
                user.to_string(): {
                    "id": user.to_string(),
                    "message": {
                        "id": user.to_string(),
                        "author": { "role": "user" },
                        "create_time": 1_690_000_001.0,
                        "content": { "content_type": "text", "parts": ["Hello"] },
                        "metadata": {}
                    },
                    "parent": root.to_string(),
                    "children": [reply.to_string(), odd.to_string()]
                },
                reply.to_string(): {
                    "id": reply.to_string(),
                    "message": {
                        "id": reply.to_string(),
                        "author": { "role": "assistant" },
                        "content": { "content_type": "text", "parts": ["Hi!"] },
                        "end_turn": true,
                        "weight": 1.0,
                        "metadata": { "model_slug": "text-davinci-002-render-sha", "finish_details": { "type": "stop" } }
                    },
                    "parent": user.to_string(),
                    "children": []
                },
                odd.to_string(): {
                    "id": odd.to_string(),
                    "message": {
                        "id": odd.to_string(),
                        "author": { "role": "tool", "name": "widget" },
                        "content": { "content_type": "hologram", "frames": 3 },
                        "metadata": {}
                    },
                    "parent": user.to_string(),
                    "children": []
                }
            }
        })
    }

    #[test]
    fn from_upstream_builds_tagged_nodes() {
        let (root, user, reply, odd) = (
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
        );
        let raw = upstream_payload(root, user, reply, odd);
        let id = Uuid::new_v4();
        let history =
            ConversationHistory::from_upstream(id, &raw, &ModelCatalog::browser_session_default())
                .unwrap();

        assert_eq!(history.id, id);
        assert_eq!(history.title, "Greetings");
        assert_eq!(history.mapping.len(), 4);
        assert_eq!(history.root(), Some(root));
        assert!(history.mapping[&root].content.is_none());
        assert_eq!(history.current_model.as_deref(), Some("gpt-3.5"));
        assert!(history.source_metadata.contains_key("moderation_results"));

        let reply_node = &history.mapping[&reply];
        assert_eq!(reply_node.plain_text().as_deref(), Some("Hi!"));
        match &reply_node.metadata {
            Some(MessageMetadata::BrowserSession(meta)) => {
                assert_eq!(meta.end_turn, Some(true));
                assert_eq!(meta.finish_details, Some(json!({ "type": "stop" })));
            }
            other => panic!("unexpected metadata {other:?}"),
        }

        let odd_node = &history.mapping[&odd];
        assert_eq!(odd_node.author_name.as_deref(), Some("widget"));
        match &odd_node.content {
            Some(MessageContent::Fallback { raw }) => assert_eq!(raw["frames"], 3),
            other => panic!("unexpected content {other:?}"),
        }
    }

    #[test]
    fn from_upstream_rejects_structural_defects() {
        let catalog = ModelCatalog::browser_session_default();
        let bad_key = json!({ "mapping": { "not-a-uuid": { "message": null } } });
        assert!(matches!(
            ConversationHistory::from_upstream(Uuid::new_v4(), &bad_key, &catalog),
            Err(Error::Parse(_))
        ));
        let no_mapping = json!({ "title": "x" });
        assert!(matches!(
            ConversationHistory::from_upstream(Uuid::new_v4(), &no_mapping, &catalog),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn repair_links_restores_back_references() {
        let (mut history, root, a, b) = chain();
        history.mapping.get_mut(&root).unwrap().children.clear();
        history.mapping.get_mut(&b).unwrap().children.push(Uuid::new_v4());
        let orphan = Uuid::new_v4();
        let mut orphan_node = node(orphan, None);
        orphan_node.parent = Some(Uuid::new_v4());
        history.mapping.insert(orphan, orphan_node);
        history.current_node = Uuid::new_v4();

        history.repair_links();
        assert_eq!(history.mapping[&root].children, vec![a]);
        assert!(history.mapping[&b].children.is_empty());
        assert_eq!(history.mapping[&orphan].parent, None);
        assert!(history.mapping.contains_key(&history.current_node));
    }

    #[test]
    fn reconcile_prefers_upstream_and_keeps_attached_local_nodes() {
        let (root, user, reply, odd) = (
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
        );
        let catalog = ModelCatalog::browser_session_default();
        let id = Uuid::new_v4();
        let upstream =
            ConversationHistory::from_upstream(id, &upstream_payload(root, user, reply, odd), &catalog)
                .unwrap();

        let mut local = upstream.clone();
        local
            .mapping
            .get_mut(&reply)
            .unwrap()
            .content = Some(MessageContent::text("stale"));
        let follow_up = Uuid::new_v4();
        local
            .append(reply, MessageNode::new(follow_up, Role::User, MessageContent::text("More")))
            .unwrap();
        let stray = Uuid::new_v4();
        let mut stray_node = node(stray, None);
        stray_node.parent = Some(Uuid::new_v4());
        local.mapping.insert(stray, stray_node);

        let merged = ConversationHistory::reconcile(upstream, Some(local));
        assert_eq!(merged.mapping[&reply].plain_text().as_deref(), Some("Hi!"));
        assert!(merged.mapping.contains_key(&follow_up));
        assert_eq!(merged.mapping[&reply].children, vec![follow_up]);
        assert!(!merged.mapping.contains_key(&stray));
        assert_eq!(merged.current_node, reply);
    }

    #[test]
    fn content_serializes_with_content_type_tag() {
        let value = serde_json::to_value(MessageContent::text("x")).unwrap();
        assert_eq!(value, json!({ "content_type": "text", "parts": ["x"] }));
    }
}
