//! # vkpoll — VK long-poll bot library
//!
//! `vkpoll` wires two focused sub-crates together for convenience:
//!
//! | Sub-crate       | Role                                                          |
//! |-----------------|---------------------------------------------------------------|
//! | `vkpoll-proto`  | Wire types, event codes and the `execute` code writer         |
//! | `vkpoll-client` | Long-poll session, update dispatch, rate-limited batch calls  |
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use vkpoll::{Client, Config, MessageHandlerKind};
//!
//! # async fn run() -> Result<(), vkpoll::SessionError> {
//! let client = Client::connect(Config {
//!     access_token: std::env::var("VK_TOKEN").unwrap_or_default(),
//!     typing_indicator: true,
//!     ..Default::default()
//! }).await?;
//!
//! client.handlers().on_message(MessageHandlerKind::Any, |msg| {
//!     println!("{}: {}", msg.author_id, msg.text);
//! });
//! client.start_polling();
//! # Ok(()) }
//! ```
//!
//! ## Building a batch by hand
//!
//! ```rust
//! use vkpoll::proto::{MethodCall, serialize::execute_code};
//!
//! let code = execute_code(&[MethodCall::new("users.get").with("user_ids", 1)]);
//! assert_eq!(code, r#"return [API.users.get({"user_ids":1})];"#);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Re-export of [`vkpoll_proto`]: wire types, constants and code writer.
pub use vkpoll_proto as proto;

/// Re-export of [`vkpoll_client`]: transport, session, dispatch and executor.
pub use vkpoll_client as client;

// ─── Convenience re-exports ───────────────────────────────────────────────────

pub use vkpoll_proto::{CHAT_ID_OFFSET, MethodCall, Params, RawUpdate};

pub use vkpoll_client::{
    Client, Config, FixedDelay, HandlerRegistry, IncomingMessage, InvocationError,
    MessageHandlerKind, MessageKind, NoRetries, RetryPolicy, RpcError, SessionError, Update,
};
