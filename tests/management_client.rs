mod common;

use common::{FakePeer, FakeServer, STEP_TIMEOUT};
use libovpnctl::error::{OvpnError, OvpnResult};
use libovpnctl::vpn::protocol::{OvpnState, PasswordKind, ProtocolEvent, AUTHENTICATION_FAILURE_MESSAGE};
use libovpnctl::vpn::{CredentialProvider, Credentials, ManagementClient, ManagementSettings};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

fn settings(port: u16) -> ManagementSettings {
    let mut settings = ManagementSettings::new("127.0.0.1", port, "pw1");
    settings.credential_settle = Duration::from_millis(10);
    settings.shutdown_wait = Duration::from_millis(500);
    settings.shutdown_poll = Duration::from_millis(10);
    settings
}

async fn connected(
    credentials: Option<Arc<dyn CredentialProvider>>,
) -> (ManagementClient, UnboundedReceiver<ProtocolEvent>, FakePeer) {
    let server = FakeServer::bind().await;
    let (client, rx) = ManagementClient::new(settings(server.port), credentials);
    let (peer, result) = tokio::join!(server.accept(), client.connect());
    result.unwrap();
    (client, rx, peer)
}

async fn next_event(rx: &mut UnboundedReceiver<ProtocolEvent>) -> ProtocolEvent {
    tokio::time::timeout(STEP_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_password_prompt_without_newline_is_answered() {
    let (_client, _rx, mut peer) = connected(None).await;

    peer.send_raw("ENTER PASSWORD:").await;
    assert_eq!(peer.next_command().await.as_deref(), Some("pw1"));
}

#[tokio::test]
async fn test_state_line_raises_state_changed() {
    let (_client, mut rx, mut peer) = connected(None).await;

    peer.send(">STATE:1700000000,CONNECTED,SUCCESS,10.8.0.2,203.0.113.5").await;

    match next_event(&mut rx).await {
        ProtocolEvent::StateChanged(args) => {
            assert_eq!(args.state, OvpnState::Connected);
            assert_eq!(args.local_ip.as_deref(), Some("10.8.0.2"));
            assert_eq!(args.remote_ip.as_deref(), Some("203.0.113.5"));
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_connected_with_errors_drops_session() {
    let (client, mut rx, mut peer) = connected(None).await;

    peer.send(">STATE:1700000000,CONNECTED,ERROR,10.8.0.2,203.0.113.5").await;

    assert_eq!(next_event(&mut rx).await, ProtocolEvent::ConnectedWithErrors);
    assert_eq!(next_event(&mut rx).await, ProtocolEvent::Disconnected);
    peer.expect_closed().await;
    assert!(!client.is_connected());
    assert!(client.received_exit_notification());
}

#[tokio::test]
async fn test_reconnecting_closes_transport() {
    let (_client, mut rx, mut peer) = connected(None).await;

    peer.send(">STATE:1700000000,RECONNECTING,ping-restart,,").await;

    match next_event(&mut rx).await {
        ProtocolEvent::StateChanged(args) => assert_eq!(args.state, OvpnState::Reconnecting),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(next_event(&mut rx).await, ProtocolEvent::Disconnected);
    peer.expect_closed().await;
}

#[tokio::test]
async fn test_hold_and_success_handling() {
    let (client, mut rx, mut peer) = connected(None).await;

    peer.send(">HOLD:Waiting for hold release:0").await;
    assert_eq!(next_event(&mut rx).await, ProtocolEvent::HoldRequested);
    assert!(client.is_waiting_for_hold_release());

    peer.send("SUCCESS: hold release succeeded").await;
    assert_eq!(next_event(&mut rx).await, ProtocolEvent::HoldReleaseSucceeded);
    assert_eq!(next_event(&mut rx).await, ProtocolEvent::Success("hold release succeeded".to_string()));
    assert!(!client.is_waiting_for_hold_release());

    peer.send("SUCCESS: bytecount interval changed").await;
    assert_eq!(next_event(&mut rx).await, ProtocolEvent::Success("bytecount interval changed".to_string()));
    peer.send(">INFO:OpenVPN Management Interface Version 5").await;
    assert_eq!(next_event(&mut rx).await, ProtocolEvent::Info("OpenVPN Management Interface Version 5".to_string()));
}

#[tokio::test]
async fn test_malformed_lines_are_skipped() {
    let (client, mut rx, mut peer) = connected(None).await;

    peer.send(">BYTECOUNT:lots,many").await;
    peer.send("some banner text").await;
    peer.send(">BYTECOUNT:1024,2048").await;

    match next_event(&mut rx).await {
        ProtocolEvent::ByteCount(counts) => {
            assert_eq!(counts.bytes_in, 1024);
            assert_eq!(counts.bytes_out, 2048);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(client.last_bandwidth_update().is_some());
}

#[tokio::test]
async fn test_fatal_and_log_payloads() {
    let (_client, mut rx, mut peer) = connected(None).await;

    peer.send(">LOG:1700000000,W,WARNING: cipher, auth and compression are set").await;
    match next_event(&mut rx).await {
        ProtocolEvent::Log(args) => assert_eq!(args.message, "WARNING: cipher, auth and compression are set"),
        other => panic!("unexpected event {:?}", other),
    }

    peer.send(">FATAL:Cannot open TUN/TAP dev /dev/net/tun: No such file").await;
    assert_eq!(next_event(&mut rx).await, ProtocolEvent::Fatal("No such file".to_string()));
}

#[tokio::test]
async fn test_auth_request_sends_password_then_username() {
    let provider = || -> OvpnResult<Credentials> { Ok(Credentials::new("alice", "s3cret pass")) };
    let (_client, mut rx, mut peer) = connected(Some(Arc::new(provider))).await;

    peer.send(">PASSWORD:Need 'Auth' username/password").await;

    match next_event(&mut rx).await {
        ProtocolEvent::PasswordRequest(request) => assert_eq!(request.kind, PasswordKind::UsernamePassword),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(peer.next_command().await.as_deref(), Some("password Auth \"s3cret\\ pass\""));
    assert_eq!(peer.next_command().await.as_deref(), Some("username Auth \"alice\""));
}

#[tokio::test]
async fn test_missing_credentials_surface_as_fatal() {
    let provider = || -> OvpnResult<Credentials> { Err(OvpnError::ServiceError("keyring locked".to_string())) };
    let (_client, mut rx, mut peer) = connected(Some(Arc::new(provider))).await;

    peer.send(">PASSWORD:Need 'Auth' username/password").await;

    assert!(matches!(next_event(&mut rx).await, ProtocolEvent::PasswordRequest(_)));
    match next_event(&mut rx).await {
        ProtocolEvent::Fatal(message) => {
            assert!(message.starts_with("Failed to retrieve login credentials"));
            assert!(message.contains("keyring locked"));
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_verification_failed() {
    let (_client, mut rx, mut peer) = connected(None).await;

    peer.send(">PASSWORD:Verification Failed: 'Auth'").await;

    match next_event(&mut rx).await {
        ProtocolEvent::PasswordRequest(request) => {
            assert_eq!(request.kind, PasswordKind::VerificationFailed);
            assert_eq!(request.payload, AUTHENTICATION_FAILURE_MESSAGE);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_commands_are_sent_in_order() {
    let (client, _rx, mut peer) = connected(None).await;

    client.set_state(true);
    client.set_byte_count(1);
    client.set_log(true);
    client.set_echo(false);
    client.set_hold(false);
    client.release_hold();
    client.set_private_key("key pass");

    for expected in [
        "state on",
        "bytecount 1",
        "log on",
        "echo off",
        "hold off",
        "hold release",
        "password \"Private Key\" \"key\\ pass\"",
    ] {
        assert_eq!(peer.next_command().await.as_deref(), Some(expected));
    }
}

#[tokio::test]
async fn test_double_dispose_sends_one_sigterm() {
    let (client, mut rx, mut peer) = connected(None).await;

    let peer_side = async {
        peer.expect_command("signal SIGTERM").await;
        peer.send(">STATE:1700000000,EXITING,SIGTERM,,").await;
        peer.expect_closed().await;
    };
    tokio::join!(client.dispose(), peer_side);
    client.dispose().await;

    assert!(client.received_exit_notification());
    assert!(!client.is_connected());
    assert_eq!(next_event(&mut rx).await, ProtocolEvent::Disconnected);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_dispose_gives_up_after_bound() {
    let (client, mut rx, _peer) = connected(None).await;

    let started = std::time::Instant::now();
    client.dispose().await;

    assert!(started.elapsed() >= Duration::from_millis(500));
    assert_eq!(next_event(&mut rx).await, ProtocolEvent::Disconnected);
}

#[tokio::test]
async fn test_peer_close_raises_disconnected_once() {
    let (client, mut rx, peer) = connected(None).await;

    drop(peer);

    assert_eq!(next_event(&mut rx).await, ProtocolEvent::Disconnected);
    assert!(client.received_exit_notification());

    client.dispose().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}
