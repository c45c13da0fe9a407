mod common;

use std::sync::Arc;

use common::{HANDSHAKE_OK, MockTransport, Reply};
use vkpoll_client::{
    ApiEndpoint, InvocationError, LongPollSettings, PollFailure, SessionError, SessionManager,
};
use vkpoll_proto::Params;

fn manager(mock: &Arc<MockTransport>, need_pts: bool) -> SessionManager {
    let endpoint = ApiEndpoint {
        access_token:   "tok".into(),
        api_version:    "5.131".into(),
        base_url:       "https://api.test/method".into(),
        default_params: Params::new(),
    };
    SessionManager::new(mock.clone(), endpoint, LongPollSettings {
        wait: 25, mode: 162, version: 3, need_pts,
    })
}

// ── negotiate ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn negotiate_reads_handshake() {
    let mock = Arc::new(MockTransport::new().handshake(Reply::body(HANDSHAKE_OK)));
    let s = manager(&mock, true).negotiate(3).await.unwrap();

    assert_eq!((s.key.as_str(), s.server.as_str(), s.ts, s.pts), ("K", "S", 100, Some(7)));
    assert_eq!((s.wait, s.mode, s.version, s.max_version), (25, 162, 3, None));

    let reqs = mock.posts_to("messages.getLongPollServer");
    assert_eq!(reqs.len(), 1);
    assert_eq!(reqs[0].url, "https://api.test/method/messages.getLongPollServer");
    assert_eq!(reqs[0].param("need_pts"), Some("1"));
    assert_eq!(reqs[0].param("lp_version"), Some("3"));
    assert_eq!(reqs[0].param("access_token"), Some("tok"));
    assert_eq!(reqs[0].param("v"), Some("5.131"));
}

#[tokio::test]
async fn negotiate_requires_pts_only_when_asked() {
    let body = r#"{"response":{"key":"K","server":"S","ts":"100"}}"#;

    let mock = Arc::new(MockTransport::new().handshake(Reply::body(body)));
    let s = manager(&mock, false).negotiate(3).await.unwrap();
    assert_eq!((s.ts, s.pts), (100, None));

    let mock = Arc::new(MockTransport::new().handshake(Reply::body(body)));
    let err = manager(&mock, true).negotiate(3).await.unwrap_err();
    assert!(matches!(err, SessionError::NegotiationFailed(InvocationError::MalformedResponse(_))));
}

#[tokio::test]
async fn negotiate_fails_on_missing_fields_and_api_errors() {
    let mock = Arc::new(MockTransport::new()
        .handshake(Reply::body(r#"{"response":{"server":"S","ts":1}}"#))
        .handshake(Reply::body(r#"{"error":{"error_code":5,"error_msg":"User authorization failed"}}"#))
        .handshake(Reply::body("not json")));
    let m = manager(&mock, false);

    assert!(matches!(m.negotiate(3).await.unwrap_err().cause(), InvocationError::MalformedResponse(_)));
    match m.negotiate(3).await.unwrap_err().cause() {
        InvocationError::Rpc(e) => {
            assert_eq!(e.code, 5);
            assert!(e.is_auth_failure());
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(m.negotiate(3).await.unwrap_err().cause(), InvocationError::MalformedResponse(_)));
}

// ── recover ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn history_expired_keeps_key_and_server() {
    let mock = Arc::new(MockTransport::new().handshake(Reply::body(HANDSHAKE_OK)));
    let m = manager(&mock, true);
    let before = m.negotiate(3).await.unwrap();

    let after = m.recover(&before, &PollFailure::HistoryExpired { ts: Some(500) }).await.unwrap();
    assert_eq!(after.ts, 500);
    assert_eq!(after.key, before.key);
    assert_eq!(after.server, before.server);
    assert_eq!(mock.requests().len(), 1, "no renegotiation for code 1");
}

#[tokio::test]
async fn invalidated_session_is_renegotiated() {
    let mock = Arc::new(MockTransport::new().handshake(Reply::body(HANDSHAKE_OK)));
    let m = manager(&mock, true);
    let before = m.negotiate(3).await.unwrap();

    for failure in [
        PollFailure::SessionInvalidated { code: 2 },
        PollFailure::SessionInvalidated { code: 3 },
        PollFailure::Unknown { code: 42 },
        PollFailure::HistoryExpired { ts: None },
    ] {
        let after = m.recover(&before, &failure).await.unwrap();
        assert_eq!(after.key, "K-fresh", "{failure}");
        assert_eq!(after.server, "S2");
        assert_eq!(after.ts, 1000);
    }
    assert_eq!(mock.posts_to("messages.getLongPollServer").len(), 5);
}

#[tokio::test]
async fn version_mismatch_renegotiates_with_max_version() {
    let mock = Arc::new(MockTransport::new().handshake(Reply::body(HANDSHAKE_OK)));
    let m = manager(&mock, true);
    let mut before = m.negotiate(3).await.unwrap();
    before.version = 10;

    let after = m.recover(&before, &PollFailure::VersionMismatch { max_version: Some(3) }).await.unwrap();
    assert_eq!(after.version, 3);
    assert_eq!(after.max_version, Some(3));

    let last = mock.posts_to("messages.getLongPollServer").pop().unwrap();
    assert_eq!(last.param("lp_version"), Some("3"));
}

#[tokio::test]
async fn failed_renegotiation_surfaces_the_cause() {
    let mock = Arc::new(MockTransport::new()
        .handshake(Reply::body(HANDSHAKE_OK))
        .handshake(Reply::Fail(vkpoll_client::TransportError::Timeout)));
    let m = manager(&mock, true);
    let before = m.negotiate(3).await.unwrap();

    let err = m.recover(&before, &PollFailure::SessionInvalidated { code: 2 }).await.unwrap_err();
    assert!(err.cause().is_transient());
}
