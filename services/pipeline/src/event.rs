//! Lifecycle events for posts and comments.
//!
//! Every state transition in the pipeline is recorded as an immutable
//! [`Event`] appended to the event topic. Consumers replay these events to
//! rebuild the read model; a "transformed" event is always a new value that
//! copies the identity fields of its source, never a mutation.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised when an event fails its structural checks
#[derive(Error, Debug)]
pub enum EventError {
    #[error("comment id {comment_id} set on {media_type:?} event for post {post_id}")]
    CommentOnNonText {
        media_type: MediaType,
        post_id: Uuid,
        comment_id: Uuid,
    },
}

/// Kind of content an event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaType {
    Image,
    Text,
}

/// Lifecycle transition recorded by an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventAction {
    Submitted,
    Resized,
    Processed,
    Validated,
    Refused,
    Deleted,
}

/// Immutable fact describing a lifecycle transition of a post or comment.
///
/// Wire format is a flat JSON object:
/// `{"mediaType": "Image", "action": "Submitted", "postId": "...",
/// "commentId": null, "data": "..."}`. `data` carries the raw comment text
/// for `Text` events and the blob identifier for `Image` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub media_type: MediaType,
    pub action: EventAction,
    pub post_id: Uuid,
    #[serde(default)]
    pub comment_id: Option<Uuid>,
    #[serde(default)]
    pub data: String,
}

impl Event {
    /// Event recorded when an image post is accepted for publication
    pub fn submitted_post(post_id: Uuid, image_id: Uuid) -> Self {
        Self {
            media_type: MediaType::Image,
            action: EventAction::Submitted,
            post_id,
            comment_id: None,
            data: image_id.to_string(),
        }
    }

    /// Event recorded when a text comment is accepted for publication
    pub fn submitted_comment(post_id: Uuid, comment_id: Uuid, text: impl Into<String>) -> Self {
        Self {
            media_type: MediaType::Text,
            action: EventAction::Submitted,
            post_id,
            comment_id: Some(comment_id),
            data: text.into(),
        }
    }

    /// Event recorded when the resize worker finishes transforming an image
    pub fn image_processed(post_id: Uuid, image_id: Uuid) -> Self {
        Self {
            media_type: MediaType::Image,
            action: EventAction::Processed,
            post_id,
            comment_id: None,
            data: image_id.to_string(),
        }
    }

    /// Event recording a safety verdict.
    ///
    /// The action follows the verdict and the media type follows the
    /// presence of a comment id: verdicts on comments are `Text`, verdicts
    /// on posts are `Image`.
    pub fn verdict(
        post_id: Uuid,
        comment_id: Option<Uuid>,
        data: impl Into<String>,
        approved: bool,
    ) -> Self {
        Self {
            media_type: if comment_id.is_some() {
                MediaType::Text
            } else {
                MediaType::Image
            },
            action: if approved {
                EventAction::Validated
            } else {
                EventAction::Refused
            },
            post_id,
            comment_id,
            data: data.into(),
        }
    }

    /// Event recorded when a post is removed
    pub fn post_deleted(post_id: Uuid) -> Self {
        Self {
            media_type: MediaType::Image,
            action: EventAction::Deleted,
            post_id,
            comment_id: None,
            data: String::new(),
        }
    }

    /// Event recorded when a comment is removed
    pub fn comment_deleted(post_id: Uuid, comment_id: Uuid) -> Self {
        Self {
            media_type: MediaType::Text,
            action: EventAction::Deleted,
            post_id,
            comment_id: Some(comment_id),
            data: String::new(),
        }
    }

    /// Derive a new event from an existing one, keeping its identity fields.
    ///
    /// The source is untouched; `post_id`, `comment_id` and `data` are
    /// copied while `media_type` and `action` are replaced.
    pub fn transformed(&self, media_type: MediaType, action: EventAction) -> Self {
        Self {
            media_type,
            action,
            post_id: self.post_id,
            comment_id: self.comment_id,
            data: self.data.clone(),
        }
    }

    /// Check the structural invariant: a comment id may only appear on
    /// `Text` events.
    pub fn check(&self) -> Result<(), EventError> {
        match self.comment_id {
            Some(comment_id) if self.media_type != MediaType::Text => {
                Err(EventError::CommentOnNonText {
                    media_type: self.media_type,
                    post_id: self.post_id,
                    comment_id,
                })
            }
            _ => Ok(()),
        }
    }

    /// Partitioning key: all events of one post land on one partition, so
    /// per-post order is preserved on the bus.
    pub fn partition_key(&self) -> String {
        self.post_id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post_id() -> Uuid {
        Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap()
    }

    fn comment_id() -> Uuid {
        Uuid::parse_str("6fa459ea-ee8a-3ca4-894e-db77e160355e").unwrap()
    }

    #[test]
    fn test_wire_format() {
        let event = Event::submitted_post(post_id(), comment_id());

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["mediaType"], "Image");
        assert_eq!(json["action"], "Submitted");
        assert_eq!(json["postId"], post_id().to_string());
        assert_eq!(json["commentId"], serde_json::Value::Null);
        assert_eq!(json["data"], comment_id().to_string());
    }

    #[test]
    fn test_decode_wire_format() {
        let json = r#"{
            "mediaType": "Text",
            "action": "Validated",
            "postId": "550e8400-e29b-41d4-a716-446655440000",
            "commentId": "6fa459ea-ee8a-3ca4-894e-db77e160355e",
            "data": "nice post"
        }"#;

        let event: Event = serde_json::from_str(json).unwrap();
        assert_eq!(event.media_type, MediaType::Text);
        assert_eq!(event.action, EventAction::Validated);
        assert_eq!(event.comment_id, Some(comment_id()));
        assert_eq!(event.data, "nice post");
        assert!(event.check().is_ok());
    }

    #[test]
    fn test_comment_id_requires_text() {
        let mut event = Event::submitted_comment(post_id(), comment_id(), "hello");
        assert!(event.check().is_ok());

        event.media_type = MediaType::Image;
        assert!(event.check().is_err());
    }

    #[test]
    fn test_verdict_media_type_follows_comment_id() {
        let comment = Event::verdict(post_id(), Some(comment_id()), "text", true);
        assert_eq!(comment.media_type, MediaType::Text);
        assert_eq!(comment.action, EventAction::Validated);

        let post = Event::verdict(post_id(), None, "blob", false);
        assert_eq!(post.media_type, MediaType::Image);
        assert_eq!(post.action, EventAction::Refused);
        assert!(post.check().is_ok());
    }

    #[test]
    fn test_transformed_copies_identity() {
        let source = Event::submitted_comment(post_id(), comment_id(), "hello");
        let derived = source.transformed(MediaType::Text, EventAction::Refused);

        assert_eq!(derived.post_id, source.post_id);
        assert_eq!(derived.comment_id, source.comment_id);
        assert_eq!(derived.data, source.data);
        assert_eq!(derived.action, EventAction::Refused);
        // the source keeps its original action
        assert_eq!(source.action, EventAction::Submitted);
    }

    #[test]
    fn test_partition_key_is_post_id() {
        let event = Event::submitted_post(post_id(), comment_id());
        assert_eq!(event.partition_key(), post_id().to_string());
    }
}
