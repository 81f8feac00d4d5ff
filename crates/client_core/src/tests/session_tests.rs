use super::*;
use crate::{
    realtime::ConnectionState,
    test_support::{auth_user, server_error, to_json, FakeConnector, Harness},
    transport::TransportError,
    NoticeLevel,
};
use serde_json::json;
use shared::domain::UserId;

fn login_request(password: &str) -> LoginRequest {
    LoginRequest {
        email: "ada@example.com".to_string(),
        password: password.to_string(),
    }
}

#[tokio::test]
async fn gate_reports_checking_before_the_first_check() {
    let harness = Harness::new();
    assert!(harness.session.is_checking_auth());
    assert_eq!(harness.session.gate(), SessionGate::Checking);
}

#[tokio::test]
async fn check_session_success_sets_identity_and_connects() {
    let harness = Harness::new();
    harness
        .api
        .reply(Method::Get, "/auth/check", Ok(to_json(&auth_user("u1"))));

    let user = harness.session.check_session().await.expect("identity");

    assert_eq!(user.id.as_str(), "u1");
    assert_eq!(harness.session.auth_user(), Some(auth_user("u1")));
    assert!(!harness.session.is_checking_auth());
    assert_eq!(harness.session.auth_checks_completed(), 1);
    assert_eq!(harness.session.gate(), SessionGate::SignedIn(auth_user("u1")));
    assert_eq!(harness.connector.opened(), vec![UserId::from("u1")]);
    assert_eq!(harness.connection.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn check_session_failure_clears_identity_and_completes_once_per_call() {
    let harness = Harness::new();
    harness.api.reply(
        Method::Get,
        "/auth/check",
        Err(server_error(401, "Unauthorized - No Token Provided")),
    );

    assert!(harness.session.check_session().await.is_none());
    assert_eq!(harness.session.auth_checks_completed(), 1);
    assert!(!harness.session.is_checking_auth());
    assert_eq!(harness.session.gate(), SessionGate::SignedOut);

    // No reply queued: a network failure takes the same path.
    assert!(harness.session.check_session().await.is_none());
    assert_eq!(harness.session.auth_checks_completed(), 2);
    assert!(harness.session.auth_user().is_none());
    assert!(harness.connector.opened().is_empty());
}

#[tokio::test]
async fn failed_recheck_tears_down_the_existing_connection() {
    let harness = Harness::new();
    harness
        .api
        .reply(Method::Get, "/auth/check", Ok(to_json(&auth_user("u1"))));
    harness.session.check_session().await;
    assert_eq!(harness.connection.state(), ConnectionState::Connected);

    harness.session.check_session().await;

    assert!(harness.session.auth_user().is_none());
    assert_eq!(harness.connection.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn identity_without_id_is_kept_but_never_connected() {
    let harness = Harness::new();
    let mut user = auth_user("u1");
    user.id = UserId::from("");
    harness.api.reply(Method::Get, "/auth/check", Ok(to_json(&user)));

    harness.session.check_session().await;

    assert_eq!(harness.session.auth_user(), Some(user));
    assert!(harness.connector.opened().is_empty());
    assert_eq!(harness.connection.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn login_with_valid_credentials_connects_with_identity() {
    let mut harness = Harness::new();
    harness
        .api
        .reply(Method::Post, "/auth/login", Ok(to_json(&auth_user("u1"))));

    let user = harness
        .session
        .login(login_request("secret1"))
        .await
        .expect("login");

    assert_eq!(user.id.as_str(), "u1");
    assert!(!harness.session.is_logging_in());
    assert_eq!(harness.connector.opened(), vec![UserId::from("u1")]);

    let events = harness.drain_events();
    let states: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            ClientEvent::ConnectionStateChanged(state) => Some(*state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![ConnectionState::Connecting, ConnectionState::Connected]
    );
    assert!(events.iter().any(|event| matches!(
        event,
        ClientEvent::Notice(notice) if notice.text == "Logged in successfully"
    )));

    let request = &harness.api.requests()[0];
    assert_eq!(
        request.body,
        Some(json!({ "email": "ada@example.com", "password": "secret1" }))
    );
}

#[tokio::test]
async fn login_with_wrong_password_surfaces_server_message() {
    let mut harness = Harness::new();
    harness.api.reply(
        Method::Post,
        "/auth/login",
        Err(server_error(400, "Invalid credentials")),
    );

    let err = harness
        .session
        .login(login_request("wrong"))
        .await
        .expect_err("login should fail");

    assert!(matches!(err, ClientError::Api(TransportError::Server { status: 400, .. })));
    assert!(harness.session.auth_user().is_none());
    assert!(!harness.session.is_logging_in());
    assert!(harness.connector.opened().is_empty());
    assert_eq!(
        harness.drain_notices(),
        vec![Notice::error("Invalid credentials")]
    );
}

#[tokio::test]
async fn login_transport_failure_uses_fallback_text() {
    let mut harness = Harness::new();

    assert!(harness.session.login(login_request("secret1")).await.is_err());

    assert_eq!(harness.drain_notices(), vec![Notice::error("Login failed")]);
}

#[tokio::test]
async fn login_failure_leaves_existing_session_untouched() {
    let harness = Harness::new();
    harness
        .api
        .reply(Method::Get, "/auth/check", Ok(to_json(&auth_user("u1"))));
    harness.session.check_session().await;

    let _ = harness.session.login(login_request("wrong")).await;

    assert_eq!(harness.session.auth_user(), Some(auth_user("u1")));
    assert_eq!(harness.connection.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn signup_validation_blocks_the_request() {
    let mut harness = Harness::new();

    let err = harness
        .session
        .signup(SignupRequest {
            full_name: String::new(),
            email: "not-an-email".to_string(),
            password: "123".to_string(),
        })
        .await
        .expect_err("invalid form");

    let ClientError::InvalidSignup(fields) = err else {
        panic!("expected field errors");
    };
    assert_eq!(fields.len(), 3);
    assert!(harness.api.requests().is_empty());
    assert!(!harness.session.is_signing_up());
    assert_eq!(
        harness.drain_notices(),
        vec![Notice::error("Please fix the errors in the form")]
    );
}

#[tokio::test]
async fn signup_success_creates_session() {
    let mut harness = Harness::new();
    harness
        .api
        .reply(Method::Post, "/auth/signup", Ok(to_json(&auth_user("new"))));

    harness
        .session
        .signup(SignupRequest {
            full_name: "Ada Lovelace".to_string(),
            email: "ada@example.com".to_string(),
            password: "secret1".to_string(),
        })
        .await
        .expect("signup");

    assert_eq!(
        harness.api.requests()[0].body,
        Some(json!({
            "fullName": "Ada Lovelace",
            "email": "ada@example.com",
            "password": "secret1"
        }))
    );
    assert_eq!(harness.connector.opened(), vec![UserId::from("new")]);
    let notices = harness.drain_notices();
    assert_eq!(notices[0].level, NoticeLevel::Success);
    assert_eq!(notices[0].text, "Account created successfully");
}

#[tokio::test]
async fn connection_failure_does_not_touch_the_session() {
    let mut harness = Harness::with_connector(FakeConnector::refusing());
    harness
        .api
        .reply(Method::Post, "/auth/login", Ok(to_json(&auth_user("u1"))));

    harness
        .session
        .login(login_request("secret1"))
        .await
        .expect("login");

    assert_eq!(harness.session.auth_user(), Some(auth_user("u1")));
    assert_eq!(harness.connection.state(), ConnectionState::Disconnected);
    assert!(harness
        .drain_notices()
        .iter()
        .all(|notice| notice.level == NoticeLevel::Success));
}

#[tokio::test]
async fn logout_tears_down_connection_and_session() {
    let mut harness = Harness::new();
    harness
        .api
        .reply(Method::Post, "/auth/login", Ok(to_json(&auth_user("u1"))));
    harness
        .api
        .reply(Method::Post, "/auth/logout", Ok(json!({ "message": "Logged out" })));
    harness.session.login(login_request("secret1")).await.expect("login");
    harness.drain_events();

    harness.session.logout().await.expect("logout");

    assert!(harness.session.auth_user().is_none());
    assert_eq!(harness.connection.state(), ConnectionState::Disconnected);
    assert!(harness.connection.current().is_none());
    assert_eq!(
        harness.drain_notices(),
        vec![Notice::success("Logged out successfully")]
    );
}

#[tokio::test]
async fn logout_failure_still_tears_down() {
    let mut harness = Harness::new();
    harness
        .api
        .reply(Method::Post, "/auth/login", Ok(to_json(&auth_user("u1"))));
    harness.session.login(login_request("secret1")).await.expect("login");
    harness.drain_events();

    let err = harness.session.logout().await.expect_err("no reply queued");

    assert!(matches!(err, ClientError::Api(TransportError::Network(_))));
    assert!(harness.session.auth_user().is_none());
    assert_eq!(harness.connection.state(), ConnectionState::Disconnected);
    assert_eq!(harness.drain_notices(), vec![Notice::error("Logout failed")]);
}

#[tokio::test]
async fn update_profile_replaces_identity_snapshot() {
    let harness = Harness::new();
    harness
        .api
        .reply(Method::Get, "/auth/check", Ok(to_json(&auth_user("u1"))));
    harness.session.check_session().await;

    let mut updated = auth_user("u1");
    updated.profile_pic = "https://cdn.example.com/u1.png".to_string();
    harness
        .api
        .reply(Method::Put, "/auth/update-profile", Ok(to_json(&updated)));

    harness
        .session
        .update_profile(UpdateProfileRequest {
            profile_pic: Some("aGVsbG8=".to_string()),
            ..Default::default()
        })
        .await
        .expect("update");

    assert_eq!(harness.session.auth_user(), Some(updated));
    assert!(!harness.session.is_updating_profile());
    assert_eq!(
        harness.api.requests()[1].body,
        Some(json!({ "profilePic": "aGVsbG8=" }))
    );
    // Same identity: no second channel.
    assert_eq!(harness.connector.opened().len(), 1);
}

#[tokio::test]
async fn update_profile_failure_keeps_snapshot_and_clears_flag() {
    let mut harness = Harness::new();
    harness
        .api
        .reply(Method::Get, "/auth/check", Ok(to_json(&auth_user("u1"))));
    harness.session.check_session().await;
    harness.api.reply(
        Method::Put,
        "/auth/update-profile",
        Err(TransportError::Server {
            status: 500,
            message: None,
        }),
    );
    harness.drain_events();

    assert!(harness
        .session
        .update_profile(UpdateProfileRequest {
            full_name: Some("Ada".to_string()),
            ..Default::default()
        })
        .await
        .is_err());

    assert_eq!(harness.session.auth_user(), Some(auth_user("u1")));
    assert!(!harness.session.is_updating_profile());
    assert_eq!(
        harness.drain_notices(),
        vec![Notice::error("Failed to update profile")]
    );
}
