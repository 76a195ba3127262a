//! Queued mutations.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Kind of remote entity a mutation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
  Post,
  Comment,
  Message,
  Friend,
  Like,
  Reaction,
}

impl EntityKind {
  pub const ALL: [EntityKind; 6] = [
    EntityKind::Post,
    EntityKind::Comment,
    EntityKind::Message,
    EntityKind::Friend,
    EntityKind::Like,
    EntityKind::Reaction,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Post => "post",
      Self::Comment => "comment",
      Self::Message => "message",
      Self::Friend => "friend",
      Self::Like => "like",
      Self::Reaction => "reaction",
    }
  }

  /// REST collection name.
  pub fn collection(&self) -> &'static str {
    match self {
      Self::Post => "posts",
      Self::Comment => "comments",
      Self::Message => "messages",
      Self::Friend => "friends",
      Self::Like => "likes",
      Self::Reaction => "reactions",
    }
  }
}

impl fmt::Display for EntityKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for EntityKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let lower = s.trim().to_lowercase();
    Self::ALL
      .into_iter()
      .find(|kind| kind.as_str() == lower)
      .ok_or_else(|| format!("unknown entity: {}", s))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
  Create,
  Update,
  Delete,
}

impl OperationType {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Create => "create",
      Self::Update => "update",
      Self::Delete => "delete",
    }
  }
}

impl fmt::Display for OperationType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for OperationType {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "create" => Ok(Self::Create),
      "update" => Ok(Self::Update),
      "delete" => Ok(Self::Delete),
      _ => Err(format!("unknown operation: {}", s)),
    }
  }
}

/// Persisted delivery state. In-flight and backing-off are runtime-only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
  #[default]
  Queued,
  /// Held until its conflict is resolved
  Conflict,
  /// Out of automatic retries
  Exhausted,
}

/// A local mutation waiting to be delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueItem {
  pub id: String,
  #[serde(rename = "type")]
  pub op: OperationType,
  pub entity: EntityKind,
  pub entity_id: String,
  pub data: Value,
  /// Creation time, epoch milliseconds
  pub timestamp: i64,
  pub retry_count: u32,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_error: Option<String>,
  #[serde(default)]
  pub status: ItemStatus,
  /// Overwrite the remote copy; set once a conflict was resolved for the local side
  #[serde(default)]
  pub force: bool,
}

impl SyncQueueItem {
  pub fn new(
    entity: EntityKind,
    entity_id: impl Into<String>,
    op: OperationType,
    data: Value,
    timestamp: i64,
  ) -> Self {
    let entity_id = entity_id.into();
    Self {
      id: format!("{}-{}-{}-{}", entity, entity_id, op, timestamp),
      op,
      entity,
      entity_id,
      data,
      timestamp,
      retry_count: 0,
      last_error: None,
      status: ItemStatus::Queued,
      force: false,
    }
  }

  /// Whether this item mutates the same target in the same way.
  pub fn same_target(&self, entity: EntityKind, entity_id: &str, op: OperationType) -> bool {
    self.entity == entity && self.entity_id == entity_id && self.op == op
  }

  /// Queued and never attempted.
  pub fn is_pending(&self) -> bool {
    self.status == ItemStatus::Queued && self.retry_count == 0
  }

  /// Key used to look up a per-entity resolver.
  pub fn resolver_key(&self) -> String {
    format!("{}-{}", self.entity, self.entity_id)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_item_id_and_defaults() {
    let item = SyncQueueItem::new(
      EntityKind::Like,
      "42",
      OperationType::Create,
      json!({"post_id": 42}),
      1_000,
    );
    assert_eq!(item.id, "like-42-create-1000");
    assert!(item.is_pending());
    assert_eq!(item.resolver_key(), "like-42");
    assert!(item.same_target(EntityKind::Like, "42", OperationType::Create));
    assert!(!item.same_target(EntityKind::Like, "42", OperationType::Delete));
  }

  #[test]
  fn test_serialized_shape() {
    let item = SyncQueueItem::new(EntityKind::Post, "p1", OperationType::Update, json!({}), 5);
    let value = serde_json::to_value(&item).unwrap();
    assert_eq!(value["type"], "update");
    assert_eq!(value["entity"], "post");
    assert_eq!(value["status"], "queued");
    assert!(value.get("last_error").is_none());
  }

  #[test]
  fn test_older_records_without_status_load() {
    let item: SyncQueueItem = serde_json::from_value(json!({
      "id": "post-1-create-1",
      "type": "create",
      "entity": "post",
      "entity_id": "1",
      "data": null,
      "timestamp": 1,
      "retry_count": 2
    }))
    .unwrap();
    assert_eq!(item.status, ItemStatus::Queued);
    assert!(!item.force);
    assert!(!item.is_pending());
  }

  #[test]
  fn test_parse_names() {
    assert_eq!("Reaction".parse::<EntityKind>(), Ok(EntityKind::Reaction));
    assert_eq!("delete".parse::<OperationType>(), Ok(OperationType::Delete));
    assert!("story".parse::<EntityKind>().is_err());
  }
}
