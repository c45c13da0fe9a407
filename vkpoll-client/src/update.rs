//! High-level update types produced from raw long-poll tuples.
//!
//! Every [`RawUpdate`] is classified into zero or more [`Update`] values by
//! [`classify`]. Anything without a dedicated variant is kept as
//! [`Update::Other`].

use chrono::{DateTime, Utc};
use serde_json::Value;
use vkpoll_proto::{CHAT_ID_OFFSET, Params, RawUpdate, event, flags, value_as_i64};

// ─── IncomingMessage ─────────────────────────────────────────────────────────

/// A new message in a dialog or group chat.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub id:          i64,
    /// See [`vkpoll_proto::flags`].
    pub flags:       i64,
    /// Conversation id as sent by the server (`CHAT_ID_OFFSET + chat_id` for chats).
    pub peer_id:     i64,
    /// The user who wrote the message.
    pub author_id:   i64,
    /// Set when the message was posted in a group chat.
    pub chat_id:     Option<i64>,
    /// Unix seconds.
    pub timestamp:   i64,
    pub text:        String,
    /// Long-poll attachment map (`attach1_type`, `fwd`, `source_act`, …).
    pub attachments: Params,
    /// Client-side de-duplication token.
    pub random_id:   Option<i64>,
}

impl IncomingMessage {
    /// `true` if the message was sent by this account.
    pub fn outgoing(&self) -> bool {
        self.flags & flags::OUTBOX != 0
    }

    pub fn is_chat(&self) -> bool {
        self.chat_id.is_some()
    }

    /// Where replies (and typing indicators) for this message should go.
    pub fn reply_peer(&self) -> i64 {
        match self.chat_id {
            Some(chat) => CHAT_ID_OFFSET + chat,
            None       => self.author_id,
        }
    }

    pub fn date(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.timestamp, 0)
    }

    /// Chat or message title, if the server sent one.
    pub fn title(&self) -> Option<&str> {
        self.attachments.get("title").and_then(Value::as_str)
    }

    pub fn has_forwards(&self) -> bool {
        self.attachments.contains_key("fwd")
    }

    /// What the message mostly consists of; see [`MessageKind`].
    pub fn kind(&self) -> MessageKind {
        MessageKind::of(&self.attachments)
    }
}

// ─── MessageKind ──────────────────────────────────────────────────────────────

/// Attachment-based message classification, in dispatch priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Voice,
    Sticker,
    Gif,
    Audio,
    Video,
    Document,
    WallPost,
    Photo,
    Link,
    PlainText,
}

impl MessageKind {
    /// Classify an attachment map. The first matching rule wins:
    /// voice, sticker, gif, audio, video, document, wall post, photo, link.
    /// No (recognised) attachment means plain text.
    pub fn of(attachments: &Params) -> Self {
        // (attachN_type, attachN_kind)
        let pairs: Vec<(&str, Option<&str>)> = attachments
            .iter()
            .filter_map(|(key, value)| {
                let prefix = key.strip_prefix("attach")?.strip_suffix("_type")?;
                let kind = attachments
                    .get(&format!("attach{prefix}_kind"))
                    .and_then(Value::as_str);
                Some((value.as_str()?, kind))
            })
            .collect();

        let has_type = |t: &str| pairs.iter().any(|(ty, _)| *ty == t);

        if pairs.iter().any(|(_, kind)| *kind == Some("audiomsg")) {
            Self::Voice
        } else if has_type("sticker") {
            Self::Sticker
        } else if pairs.iter().any(|(ty, kind)| *ty == "doc" && *kind == Some("gif")) {
            Self::Gif
        } else if has_type("audio") {
            Self::Audio
        } else if has_type("video") {
            Self::Video
        } else if has_type("doc") {
            Self::Document
        } else if has_type("wall") {
            Self::WallPost
        } else if has_type("photo") {
            Self::Photo
        } else if has_type("link") {
            Self::Link
        } else {
            Self::PlainText
        }
    }
}

// ─── Typing ───────────────────────────────────────────────────────────────────

/// A user started typing.
#[derive(Debug, Clone, PartialEq)]
pub struct TypingNotification {
    pub user_id: i64,
    /// Set when the user is typing in a group chat.
    pub chat_id: Option<i64>,
}

// ─── Chat service events ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Joined,
    Left,
}

/// Someone was added to or removed from a chat.
#[derive(Debug, Clone, PartialEq)]
pub struct MembershipChange {
    pub kind:    Membership,
    /// Who performed the action.
    pub actor:   i64,
    /// Who was added or removed.
    pub subject: i64,
    pub chat_id: i64,
}

/// A chat was created or renamed.
#[derive(Debug, Clone, PartialEq)]
pub struct TitleChange {
    pub actor:     i64,
    pub chat_id:   i64,
    /// `None` on creation.
    pub old_title: Option<String>,
    pub new_title: String,
    pub created:   bool,
}

/// A chat photo was set or removed.
#[derive(Debug, Clone, PartialEq)]
pub struct PhotoChange {
    pub actor:      i64,
    pub chat_id:    i64,
    /// The service message announcing the change; fetch it to get the photo.
    pub message_id: i64,
    pub removed:    bool,
}

// ─── Update ───────────────────────────────────────────────────────────────────

/// A classified long-poll event.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    NewMessage(IncomingMessage),
    Typing(TypingNotification),
    ChatMembershipChanged(MembershipChange),
    ChatTitleChanged(TitleChange),
    ChatPhotoChanged(PhotoChange),
    /// Any event without a dedicated variant.
    Other(RawUpdate),
}

// ─── Classifier ──────────────────────────────────────────────────────────────

/// `true` for a new-message tuple flagged as sent by this account.
pub fn is_outgoing_message(raw: &RawUpdate) -> bool {
    raw.event_type() == Some(event::NEW_MESSAGE)
        && raw.int(2).is_some_and(|f| f & flags::OUTBOX != 0)
}

/// Turn one raw tuple into high-level updates.
///
/// Outgoing messages yield nothing. A group-chat message with a service
/// action yields the message followed by the chat event. Tuples that are
/// too short to read become [`Update::Other`].
pub fn classify(raw: &RawUpdate) -> Vec<Update> {
    match raw.event_type() {
        Some(event::NEW_MESSAGE) => {
            if is_outgoing_message(raw) {
                return vec![];
            }
            match parse_message(raw) {
                Some(msg) => {
                    let chat_event = chat_event(&msg);
                    let mut out = vec![Update::NewMessage(msg)];
                    out.extend(chat_event);
                    out
                }
                None => {
                    tracing::debug!("[vkpoll] short message tuple: {:?}", raw.0);
                    vec![Update::Other(raw.clone())]
                }
            }
        }
        Some(event::USER_TYPING) => match raw.int(1) {
            Some(user_id) => vec![Update::Typing(TypingNotification { user_id, chat_id: None })],
            None => vec![Update::Other(raw.clone())],
        },
        Some(event::USER_TYPING_IN_CHAT) => match raw.int(1) {
            Some(user_id) => vec![Update::Typing(TypingNotification { user_id, chat_id: raw.int(2) })],
            None => vec![Update::Other(raw.clone())],
        },
        _ => vec![Update::Other(raw.clone())],
    }
}

/// `[4, id, flags, peer_id, timestamp, text, attachments?, random_id?]`
fn parse_message(raw: &RawUpdate) -> Option<IncomingMessage> {
    let id      = raw.int(1)?;
    let flags   = raw.int(2)?;
    let peer_id = raw.int(3)?;

    let attachments = raw.get(6).map(attachment_map).unwrap_or_default();

    let (author_id, chat_id) = if peer_id > CHAT_ID_OFFSET {
        let author = attachments.get("from").and_then(value_as_i64).unwrap_or(peer_id);
        (author, Some(peer_id - CHAT_ID_OFFSET))
    } else {
        (peer_id, None)
    };

    Some(IncomingMessage {
        id,
        flags,
        peer_id,
        author_id,
        chat_id,
        timestamp: raw.int(4).unwrap_or(0),
        text:      raw.text(5).unwrap_or_default().to_owned(),
        attachments,
        random_id: raw.int(7),
    })
}

/// Attachment maps arrive as objects, occasionally as JSON text. Anything
/// else counts as no attachments.
fn attachment_map(v: &Value) -> Params {
    match v {
        Value::Object(map) => map.clone(),
        Value::String(s) if s.trim_start().starts_with('{') => {
            match serde_json::from_str::<Value>(s) {
                Ok(Value::Object(map)) => map,
                _ => Params::new(),
            }
        }
        _ => Params::new(),
    }
}

fn chat_event(msg: &IncomingMessage) -> Option<Update> {
    let chat_id = msg.chat_id?;
    let a = &msg.attachments;
    let act = a.get("source_act")?.as_str()?;
    let actor = a.get("from").and_then(value_as_i64)?;
    let text = |k: &str| a.get(k).and_then(Value::as_str).map(str::to_owned);
    let member = || a.get("source_mid").and_then(value_as_i64);

    let update = match act {
        "chat_create" => Update::ChatTitleChanged(TitleChange {
            actor, chat_id, old_title: None, new_title: text("source_text")?, created: true,
        }),
        "chat_title_update" => Update::ChatTitleChanged(TitleChange {
            actor, chat_id,
            old_title: text("source_old_text"),
            new_title: text("source_text")?,
            created:   false,
        }),
        "chat_photo_update" => Update::ChatPhotoChanged(PhotoChange {
            actor, chat_id, message_id: msg.id, removed: false,
        }),
        "chat_photo_remove" => Update::ChatPhotoChanged(PhotoChange {
            actor, chat_id, message_id: msg.id, removed: true,
        }),
        "chat_invite_user" => Update::ChatMembershipChanged(MembershipChange {
            kind: Membership::Joined, actor, subject: member()?, chat_id,
        }),
        "chat_kick_user" => Update::ChatMembershipChanged(MembershipChange {
            kind: Membership::Left, actor, subject: member()?, chat_id,
        }),
        other => {
            tracing::debug!("[vkpoll] unhandled source_act {other:?}");
            return None;
        }
    };
    Some(update)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(v: Value) -> RawUpdate {
        RawUpdate(v.as_array().unwrap().clone())
    }

    #[test]
    fn direct_message() {
        let u = classify(&raw(json!([4, 55, 0, 12345, 1690000000, "hi", {}, 999])));
        let [Update::NewMessage(m)] = u.as_slice() else { panic!("{u:?}") };
        assert_eq!(m.id, 55);
        assert_eq!(m.peer_id, 12345);
        assert_eq!(m.author_id, 12345);
        assert_eq!(m.chat_id, None);
        assert_eq!(m.text, "hi");
        assert_eq!(m.random_id, Some(999));
        assert_eq!(m.kind(), MessageKind::PlainText);
        assert_eq!(m.reply_peer(), 12345);
        assert_eq!(m.date().map(|d| d.timestamp()), Some(1690000000));
    }

    #[test]
    fn outgoing_is_dropped() {
        assert!(classify(&raw(json!([4, 1, 2 | 1, 5, 0, "me", {}]))).is_empty());
        assert!(classify(&raw(json!([4, 1, 35, 5, 0, "me", {}]))).is_empty());
    }

    #[test]
    fn chat_message_uses_from() {
        let u = classify(&raw(json!([4, 7, 1, 2000000003, 0, "yo", {"from": "77", "title": "Team"}])));
        let [Update::NewMessage(m)] = u.as_slice() else { panic!("{u:?}") };
        assert_eq!(m.chat_id, Some(3));
        assert_eq!(m.author_id, 77);
        assert_eq!(m.peer_id, 2000000003);
        assert_eq!(m.reply_peer(), 2000000003);
        assert_eq!(m.title(), Some("Team"));
    }

    #[test]
    fn chat_service_actions() {
        let msg = |extra: Value| {
            let mut a = json!({"from": "10"});
            a.as_object_mut().unwrap().extend(extra.as_object().unwrap().clone());
            raw(json!([4, 9, 0, 2000000005, 0, "", a]))
        };

        let u = classify(&msg(json!({"source_act": "chat_invite_user", "source_mid": "20"})));
        assert_eq!(u[1], Update::ChatMembershipChanged(MembershipChange {
            kind: Membership::Joined, actor: 10, subject: 20, chat_id: 5,
        }));

        let u = classify(&msg(json!({"source_act": "chat_title_update", "source_old_text": "a", "source_text": "b"})));
        assert_eq!(u[1], Update::ChatTitleChanged(TitleChange {
            actor: 10, chat_id: 5, old_title: Some("a".into()), new_title: "b".into(), created: false,
        }));

        let u = classify(&msg(json!({"source_act": "chat_photo_remove"})));
        assert_eq!(u[1], Update::ChatPhotoChanged(PhotoChange {
            actor: 10, chat_id: 5, message_id: 9, removed: true,
        }));

        let u = classify(&msg(json!({"source_act": "chat_kick_user"})));
        assert_eq!(u.len(), 1, "kick without source_mid yields only the message");
    }

    #[test]
    fn kind_priority() {
        let kind = |a: Value| MessageKind::of(a.as_object().unwrap());
        assert_eq!(kind(json!({})), MessageKind::PlainText);
        assert_eq!(kind(json!({"attach1_type": "photo"})), MessageKind::Photo);
        assert_eq!(kind(json!({"attach1_type": "photo", "attach2_type": "video"})), MessageKind::Video);
        assert_eq!(kind(json!({"attach1_type": "doc", "attach1_kind": "audiomsg"})), MessageKind::Voice);
        assert_eq!(kind(json!({"attach1_type": "doc", "attach1_kind": "gif"})), MessageKind::Gif);
        assert_eq!(kind(json!({"attach1_type": "doc"})), MessageKind::Document);
        assert_eq!(kind(json!({"attach1_type": "sticker", "attach2_type": "photo"})), MessageKind::Sticker);
        assert_eq!(kind(json!({"attach1_type": "link"})), MessageKind::Link);
        assert_eq!(kind(json!({"attach1_type": "wall", "attach2_type": "photo"})), MessageKind::WallPost);
        assert_eq!(kind(json!({"attach1_type": "geo"})), MessageKind::PlainText);
    }

    #[test]
    fn malformed_attachments_degrade_to_plain_text() {
        for bad in [json!("not json"), json!("{broken"), json!(17), json!([1, 2])] {
            let u = classify(&raw(json!([4, 1, 0, 5, 0, "t", bad])));
            let [Update::NewMessage(m)] = u.as_slice() else { panic!("{u:?}") };
            assert_eq!(m.kind(), MessageKind::PlainText);
        }
        let u = classify(&raw(json!([4, 1, 0, 5, 0, "t", "{\"attach1_type\":\"photo\"}"])));
        let [Update::NewMessage(m)] = u.as_slice() else { panic!("{u:?}") };
        assert_eq!(m.kind(), MessageKind::Photo);
    }

    #[test]
    fn typing_and_other() {
        assert_eq!(
            classify(&raw(json!([61, 42, 1]))),
            vec![Update::Typing(TypingNotification { user_id: 42, chat_id: None })],
        );
        assert_eq!(
            classify(&raw(json!([62, 42, 3]))),
            vec![Update::Typing(TypingNotification { user_id: 42, chat_id: Some(3) })],
        );
        assert!(matches!(classify(&raw(json!([8, -42, 0]))).as_slice(), [Update::Other(_)]));
        assert!(matches!(classify(&raw(json!([4, "x"]))).as_slice(), [Update::Other(_)]));
    }
}
