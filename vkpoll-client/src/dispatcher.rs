//! Handler registry and the update dispatcher.
//!
//! Each kind of event has at most one handler; registering a second one
//! replaces the first. New messages go through a precedence waterfall so
//! that at most one message handler fires per message:
//!
//! 1. the first command whose predicate matches,
//! 2. [`MessageHandlerKind::Forwarded`] if the message has forwards,
//! 3. the handler for [`IncomingMessage::kind`],
//! 4. [`MessageHandlerKind::Chat`] for group-chat messages,
//! 5. [`MessageHandlerKind::Any`].
//!
//! A step without a registered handler falls through to the next one. The
//! "every message" handler fires in addition, after the waterfall.
//!
//! Handler panics are caught and logged; one bad handler never stops the
//! dispatch workers.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};

use tokio::task::JoinHandle;
use vkpoll_proto::RawUpdate;

use crate::queue::UpdateQueue;
use crate::typing::TypingIndicator;
use crate::update::{
    IncomingMessage, Membership, MembershipChange, MessageKind, PhotoChange, TitleChange,
    TypingNotification, Update, classify, is_outgoing_message,
};

type MessageFn    = Arc<dyn Fn(&IncomingMessage) + Send + Sync>;
type PredicateFn  = Arc<dyn Fn(&IncomingMessage) -> bool + Send + Sync>;
type TypingFn     = Arc<dyn Fn(&TypingNotification) + Send + Sync>;
type MembershipFn = Arc<dyn Fn(&MembershipChange) + Send + Sync>;
type TitleFn      = Arc<dyn Fn(&TitleChange) + Send + Sync>;
type PhotoFn      = Arc<dyn Fn(&PhotoChange) + Send + Sync>;
type RawFn        = Arc<dyn Fn(&RawUpdate) + Send + Sync>;

// ─── MessageHandlerKind ──────────────────────────────────────────────────────

/// Slot a message handler is registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageHandlerKind {
    /// Fallback for messages no other handler took.
    Any,
    /// Group-chat messages no other handler took.
    Chat,
    /// Messages carrying forwarded messages.
    Forwarded,
    /// Messages of one attachment kind.
    Attachment(MessageKind),
}

impl From<MessageKind> for MessageHandlerKind {
    fn from(k: MessageKind) -> Self { Self::Attachment(k) }
}

// ─── HandlerRegistry ─────────────────────────────────────────────────────────

#[derive(Clone)]
struct Command {
    matches: PredicateFn,
    handler: MessageFn,
}

#[derive(Clone, Default)]
struct Handlers {
    message:            HashMap<MessageHandlerKind, MessageFn>,
    every_message:      Option<MessageFn>,
    commands:           Vec<Command>,
    typing:             Option<TypingFn>,
    chat_join:          Option<MembershipFn>,
    chat_leave:         Option<MembershipFn>,
    chat_created:       Option<TitleFn>,
    chat_title_changed: Option<TitleFn>,
    chat_photo_changed: Option<PhotoFn>,
    chat_photo_removed: Option<PhotoFn>,
    every_update:       Option<RawFn>,
}

impl Handlers {
    fn is_empty(&self) -> bool {
        self.message.is_empty()
            && self.every_message.is_none()
            && self.commands.is_empty()
            && self.typing.is_none()
            && self.chat_join.is_none()
            && self.chat_leave.is_none()
            && self.chat_created.is_none()
            && self.chat_title_changed.is_none()
            && self.chat_photo_changed.is_none()
            && self.chat_photo_removed.is_none()
            && self.every_update.is_none()
    }
}

/// Registered callbacks, safe to modify while dispatch is running.
///
/// Readers take a snapshot, so a handler may itself register handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<Arc<Handlers>>,
}

impl HandlerRegistry {
    pub fn new() -> Self { Self::default() }

    fn snapshot(&self) -> Arc<Handlers> {
        self.handlers.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn update(&self, f: impl FnOnce(&mut Handlers)) {
        let mut guard = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        f(Arc::make_mut(&mut *guard));
    }

    /// `true` if nothing at all is registered.
    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Register the handler for one waterfall slot.
    pub fn on_message<F>(&self, kind: impl Into<MessageHandlerKind>, f: F)
    where
        F: Fn(&IncomingMessage) + Send + Sync + 'static,
    {
        let kind = kind.into();
        self.update(|h| { h.message.insert(kind, Arc::new(f)); });
    }

    /// Fires for every incoming message, whatever else handled it.
    pub fn on_every_message<F>(&self, f: F)
    where
        F: Fn(&IncomingMessage) + Send + Sync + 'static,
    {
        self.update(|h| h.every_message = Some(Arc::new(f)));
    }

    /// Fires when the message text contains any of `triggers`, ignoring case.
    ///
    /// Commands are tried in registration order before any other message
    /// handler.
    pub fn on_command<I, S, F>(&self, triggers: I, f: F)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: Fn(&IncomingMessage) + Send + Sync + 'static,
    {
        let needles: Vec<String> = triggers
            .into_iter()
            .map(|t| t.as_ref().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        self.on_command_matching(
            move |m| {
                let text = m.text.to_lowercase();
                needles.iter().any(|n| text.contains(n.as_str()))
            },
            f,
        );
    }

    /// Like [`HandlerRegistry::on_command`] with an arbitrary predicate.
    pub fn on_command_matching<P, F>(&self, predicate: P, f: F)
    where
        P: Fn(&IncomingMessage) -> bool + Send + Sync + 'static,
        F: Fn(&IncomingMessage) + Send + Sync + 'static,
    {
        let cmd = Command { matches: Arc::new(predicate), handler: Arc::new(f) };
        self.update(|h| h.commands.push(cmd));
    }

    pub fn on_typing<F>(&self, f: F)
    where
        F: Fn(&TypingNotification) + Send + Sync + 'static,
    {
        self.update(|h| h.typing = Some(Arc::new(f)));
    }

    /// A user was added to a chat.
    pub fn on_chat_join<F>(&self, f: F)
    where
        F: Fn(&MembershipChange) + Send + Sync + 'static,
    {
        self.update(|h| h.chat_join = Some(Arc::new(f)));
    }

    /// A user left or was removed from a chat.
    pub fn on_chat_leave<F>(&self, f: F)
    where
        F: Fn(&MembershipChange) + Send + Sync + 'static,
    {
        self.update(|h| h.chat_leave = Some(Arc::new(f)));
    }

    pub fn on_chat_created<F>(&self, f: F)
    where
        F: Fn(&TitleChange) + Send + Sync + 'static,
    {
        self.update(|h| h.chat_created = Some(Arc::new(f)));
    }

    pub fn on_chat_title_changed<F>(&self, f: F)
    where
        F: Fn(&TitleChange) + Send + Sync + 'static,
    {
        self.update(|h| h.chat_title_changed = Some(Arc::new(f)));
    }

    pub fn on_chat_photo_changed<F>(&self, f: F)
    where
        F: Fn(&PhotoChange) + Send + Sync + 'static,
    {
        self.update(|h| h.chat_photo_changed = Some(Arc::new(f)));
    }

    pub fn on_chat_photo_removed<F>(&self, f: F)
    where
        F: Fn(&PhotoChange) + Send + Sync + 'static,
    {
        self.update(|h| h.chat_photo_removed = Some(Arc::new(f)));
    }

    /// Fires for every update except outgoing messages, before classification.
    pub fn on_every_update<F>(&self, f: F)
    where
        F: Fn(&RawUpdate) + Send + Sync + 'static,
    {
        self.update(|h| h.every_update = Some(Arc::new(f)));
    }
}

// ─── UpdateDispatcher ────────────────────────────────────────────────────────

/// Classifies raw updates and runs the registered handlers.
pub struct UpdateDispatcher {
    registry: Arc<HandlerRegistry>,
    typing:   Option<Arc<TypingIndicator>>,
}

impl UpdateDispatcher {
    pub fn new(registry: Arc<HandlerRegistry>, typing: Option<Arc<TypingIndicator>>) -> Self {
        Self { registry, typing }
    }

    /// Handle one update. Returns how many handlers ran.
    pub fn dispatch(&self, raw: &RawUpdate) -> usize {
        if is_outgoing_message(raw) {
            tracing::trace!("[vkpoll] skipping outgoing message");
            return 0;
        }
        let h = self.registry.snapshot();
        let mut fired = 0;

        if let Some(f) = &h.every_update {
            fired += run("every-update", || f(raw));
        }

        for update in classify(raw) {
            fired += match &update {
                Update::NewMessage(m) => self.dispatch_message(&h, m),
                Update::Typing(t) => call(&h.typing, "typing", t),
                Update::ChatMembershipChanged(c) => match c.kind {
                    Membership::Joined => call(&h.chat_join, "chat-join", c),
                    Membership::Left   => call(&h.chat_leave, "chat-leave", c),
                },
                Update::ChatTitleChanged(c) if c.created => call(&h.chat_created, "chat-created", c),
                Update::ChatTitleChanged(c) => call(&h.chat_title_changed, "chat-title", c),
                Update::ChatPhotoChanged(c) if c.removed => call(&h.chat_photo_removed, "chat-photo-removed", c),
                Update::ChatPhotoChanged(c) => call(&h.chat_photo_changed, "chat-photo", c),
                Update::Other(_) => 0,
            };
        }
        fired
    }

    fn dispatch_message(&self, h: &Handlers, m: &IncomingMessage) -> usize {
        let mut fired = 0;
        if let Some(f) = select_message_handler(h, m) {
            fired += run("message", || f(m));
        }
        if let Some(f) = &h.every_message {
            fired += run("every-message", || f(m));
        }
        if fired > 0 {
            if let Some(typing) = &self.typing {
                typing.signal(m.reply_peer());
            }
        }
        fired
    }

    /// Start `workers` tasks that drain `queue` until it is closed.
    pub fn spawn_workers(self: &Arc<Self>, queue: Arc<UpdateQueue>, workers: usize) -> Vec<JoinHandle<()>> {
        (0..workers.max(1))
            .map(|id| {
                let this  = self.clone();
                let queue = queue.clone();
                tokio::spawn(async move {
                    while let Some(raw) = queue.next().await {
                        this.dispatch(&raw);
                    }
                    tracing::debug!("[vkpoll] dispatch worker {id} finished");
                })
            })
            .collect()
    }
}

/// Pick the single message handler the waterfall lands on.
fn select_message_handler<'h>(h: &'h Handlers, m: &IncomingMessage) -> Option<&'h MessageFn> {
    if let Some(cmd) = h.commands.iter().find(|c| (c.matches)(m)) {
        return Some(&cmd.handler);
    }
    let slot = |k| h.message.get(&k);
    (if m.has_forwards() { slot(MessageHandlerKind::Forwarded) } else { None })
        .or_else(|| slot(MessageHandlerKind::Attachment(m.kind())))
        .or_else(|| if m.is_chat() { slot(MessageHandlerKind::Chat) } else { None })
        .or_else(|| slot(MessageHandlerKind::Any))
}

fn call<T: ?Sized>(slot: &Option<Arc<dyn Fn(&T) + Send + Sync>>, what: &str, arg: &T) -> usize {
    match slot {
        Some(f) => run(what, || f(arg)),
        None => 0,
    }
}

fn run(what: &str, f: impl FnOnce()) -> usize {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        tracing::error!("[vkpoll] {what} handler panicked: {}", panic_message(payload.as_ref()));
    }
    1
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload.downcast_ref::<&str>().copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic>")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use std::sync::Mutex;

    fn raw(v: Value) -> RawUpdate {
        RawUpdate(v.as_array().unwrap().clone())
    }

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Box<dyn Fn(&IncomingMessage) + Send + Sync>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log2 = log.clone();
        let make = move |tag: &'static str| {
            let log = log2.clone();
            Box::new(move |_: &IncomingMessage| log.lock().unwrap().push(tag)) as Box<dyn Fn(&IncomingMessage) + Send + Sync>
        };
        (log, make)
    }

    fn dispatcher(reg: &Arc<HandlerRegistry>) -> UpdateDispatcher {
        UpdateDispatcher::new(reg.clone(), None)
    }

    #[test]
    fn command_beats_plain_text() {
        let reg = Arc::new(HandlerRegistry::new());
        let (log, make) = recorder();
        reg.on_command(["HELLO"], make("command"));
        reg.on_message(MessageKind::PlainText, make("plain"));
        reg.on_every_message(make("every"));

        dispatcher(&reg).dispatch(&raw(json!([4, 1, 0, 5, 0, "say hello now", {}])));
        assert_eq!(*log.lock().unwrap(), vec!["command", "every"]);
    }

    #[test]
    fn first_matching_command_wins() {
        let reg = Arc::new(HandlerRegistry::new());
        let (log, make) = recorder();
        reg.on_command(["ping"], make("first"));
        reg.on_command(["ping", "pong"], make("second"));
        dispatcher(&reg).dispatch(&raw(json!([4, 1, 0, 5, 0, "ping", {}])));
        assert_eq!(*log.lock().unwrap(), vec!["first"]);
    }

    #[test]
    fn waterfall_falls_through_missing_slots() {
        let reg = Arc::new(HandlerRegistry::new());
        let (log, make) = recorder();
        reg.on_message(MessageHandlerKind::Any, make("any"));
        reg.on_message(MessageHandlerKind::Chat, make("chat"));
        reg.on_message(MessageKind::Photo, make("photo"));
        let d = dispatcher(&reg);

        d.dispatch(&raw(json!([4, 1, 0, 5, 0, "", {"fwd": "5_1", "attach1_type": "photo"}])));
        d.dispatch(&raw(json!([4, 2, 0, 5, 0, "", {"attach1_type": "video"}])));
        d.dispatch(&raw(json!([4, 3, 0, 2000000001, 0, "", {"from": "5"}])));
        assert_eq!(*log.lock().unwrap(), vec!["photo", "any", "chat"]);
    }

    #[test]
    fn forwarded_slot_precedes_attachments() {
        let reg = Arc::new(HandlerRegistry::new());
        let (log, make) = recorder();
        reg.on_message(MessageHandlerKind::Forwarded, make("fwd"));
        reg.on_message(MessageKind::Photo, make("photo"));
        dispatcher(&reg).dispatch(&raw(json!([4, 1, 0, 5, 0, "", {"fwd": "5_1", "attach1_type": "photo"}])));
        assert_eq!(*log.lock().unwrap(), vec!["fwd"]);
    }

    #[test]
    fn outgoing_never_reaches_handlers() {
        let reg = Arc::new(HandlerRegistry::new());
        let (log, make) = recorder();
        reg.on_message(MessageHandlerKind::Any, make("any"));
        reg.on_every_message(make("every"));
        reg.on_command(["x"], make("cmd"));
        let raw_seen = Arc::new(Mutex::new(0));
        let r2 = raw_seen.clone();
        reg.on_every_update(move |_| *r2.lock().unwrap() += 1);

        let fired = dispatcher(&reg).dispatch(&raw(json!([4, 1, 2, 5, 0, "x", {}])));
        assert_eq!(fired, 0);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(*raw_seen.lock().unwrap(), 0);
    }

    #[test]
    fn panicking_handler_is_contained() {
        let reg = Arc::new(HandlerRegistry::new());
        let (log, make) = recorder();
        reg.on_message(MessageHandlerKind::Any, |_| panic!("boom"));
        reg.on_every_message(make("every"));
        let fired = dispatcher(&reg).dispatch(&raw(json!([4, 1, 0, 5, 0, "x", {}])));
        assert_eq!(fired, 2);
        assert_eq!(*log.lock().unwrap(), vec!["every"]);
    }

    #[test]
    fn last_registration_wins() {
        let reg = Arc::new(HandlerRegistry::new());
        let (log, make) = recorder();
        reg.on_message(MessageHandlerKind::Any, make("old"));
        reg.on_message(MessageHandlerKind::Any, make("new"));
        dispatcher(&reg).dispatch(&raw(json!([4, 1, 0, 5, 0, "x", {}])));
        assert_eq!(*log.lock().unwrap(), vec!["new"]);
    }

    #[test]
    fn chat_events_reach_typed_handlers() {
        let reg = Arc::new(HandlerRegistry::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        reg.on_chat_join(move |c| s.lock().unwrap().push((c.actor, c.subject, c.chat_id)));
        let s = seen.clone();
        reg.on_chat_leave(move |c| s.lock().unwrap().push((c.actor, c.subject, -c.chat_id)));

        let d = dispatcher(&reg);
        d.dispatch(&raw(json!([4, 1, 0, 2000000007, 0, "", {"from": "1", "source_act": "chat_invite_user", "source_mid": "2"}])));
        d.dispatch(&raw(json!([4, 2, 0, 2000000007, 0, "", {"from": "3", "source_act": "chat_kick_user", "source_mid": "3"}])));
        assert_eq!(*seen.lock().unwrap(), vec![(1, 2, 7), (3, 3, -7)]);
    }

    #[test]
    fn typing_and_other_updates() {
        let reg = Arc::new(HandlerRegistry::new());
        let typed = Arc::new(Mutex::new(None));
        let t = typed.clone();
        reg.on_typing(move |n| *t.lock().unwrap() = Some(n.user_id));
        let every = Arc::new(Mutex::new(0));
        let e = every.clone();
        reg.on_every_update(move |_| *e.lock().unwrap() += 1);

        let d = dispatcher(&reg);
        assert_eq!(d.dispatch(&raw(json!([61, 42, 1]))), 2);
        assert_eq!(d.dispatch(&raw(json!([80, 3, 0]))), 1);
        assert_eq!(*typed.lock().unwrap(), Some(42));
        assert_eq!(*every.lock().unwrap(), 2);
    }

    #[test]
    fn empty_registry() {
        let reg = HandlerRegistry::new();
        assert!(reg.is_empty());
        reg.on_typing(|_| {});
        assert!(!reg.is_empty());
    }

    #[test]
    fn handler_may_register_during_dispatch() {
        let reg = Arc::new(HandlerRegistry::new());
        let r2 = reg.clone();
        reg.on_message(MessageHandlerKind::Any, move |_| r2.on_typing(|_| {}));
        dispatcher(&reg).dispatch(&raw(json!([4, 1, 0, 5, 0, "x", {}])));
        assert!(reg.snapshot().typing.is_some());
    }
}
