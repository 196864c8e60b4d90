// Integration tests for `DeviceSession` against a fake device.
#![allow(clippy::unwrap_used)]

mod support;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::broadcast;

use shellyctl_core::{
    CoreError, DeviceSession, Discovery, DiscoveryConfig, FleetConfig, SaveOutcome, SessionEvent,
    SessionState, UploadConfig,
};
use support::{FakeDevice, eventually, next_matching};

// ── Helpers ─────────────────────────────────────────────────────────

fn session_with(device: &FakeDevice, config: FleetConfig) -> (DeviceSession, Discovery) {
    let discovery = Discovery::new(DiscoveryConfig::default());
    let session =
        DeviceSession::new(device.identifier(), Arc::new(config), discovery.clone()).unwrap();
    (session, discovery)
}

async fn ready_session(device: &FakeDevice) -> (DeviceSession, broadcast::Receiver<SessionEvent>) {
    let (session, _) = session_with(device, FleetConfig::default());
    let events = session.subscribe();
    session.start();
    tokio::time::timeout(support::GUARD, session.wait_ready())
        .await
        .unwrap()
        .unwrap();
    (session, events)
}

fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

async fn wait_changed(events: &mut broadcast::Receiver<SessionEvent>) {
    next_matching(events, |e| (*e == SessionEvent::Changed).then_some(())).await;
}

// ── Lifecycle ───────────────────────────────────────────────────────

#[tokio::test]
async fn connects_syncs_and_reports_ready_once() {
    let device = FakeDevice::start().await;
    device
        .with_script(1, "blink", "print('on');")
        .with_script(2, "broken", "let x;");
    device.fail_getcode(2);

    let (session, _) = session_with(&device, FleetConfig::default());
    let mut events = session.subscribe();
    session.start();

    let mut script_events = 0;
    next_matching(&mut events, |e| match e {
        SessionEvent::ScriptChanged(_) => {
            script_events += 1;
            None
        }
        SessionEvent::Ready => Some(()),
        _ => None,
    })
    .await;
    assert_eq!(script_events, 2);

    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(session.display_name(), "Kitchen");
    assert!(session.uses_control_channel());

    let scripts = session.scripts();
    assert_eq!(scripts.len(), 2);
    assert_eq!(scripts[0].code.as_deref(), Some("print('on');"));
    assert_eq!(scripts[1].name, "broken");
    assert_eq!(scripts[1].code, None);
    assert_eq!(session.script_code(2).unwrap(), None);

    let calls = device.calls();
    assert_eq!(calls[0], "sys.setconfig");
    assert_eq!(calls[1], "script.list");
}

#[tokio::test]
async fn authorization_failure_bans_and_destroys() {
    let device = FakeDevice::start().await;
    device.require_auth();

    let (session, discovery) = session_with(&device, FleetConfig::default());
    let mut events = session.subscribe();
    session.start();

    let err = tokio::time::timeout(support::GUARD, session.wait_ready())
        .await
        .unwrap()
        .unwrap_err();
    assert!(err.is_unauthorized());
    assert!(discovery.is_banned(device.identifier()));
    assert_eq!(session.state(), SessionState::Destroyed);
    next_matching(&mut events, |e| (*e == SessionEvent::Closed).then_some(())).await;

    // No sync was attempted.
    assert_eq!(device.call_count("script.list"), 0);
}

#[tokio::test]
async fn unreachable_device_is_destroyed_without_ban() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let identifier = listener.local_addr().unwrap().to_string();
    drop(listener);

    let discovery = Discovery::new(DiscoveryConfig::default());
    let session =
        DeviceSession::new(&identifier, Arc::new(FleetConfig::default()), discovery.clone())
            .unwrap();
    session.start();

    let err = session.wait_ready().await.unwrap_err();
    assert!(err.is_connection());
    assert!(!discovery.is_banned(&identifier));
}

#[tokio::test]
async fn failed_listing_errors_then_recovers_on_resync() {
    let device = FakeDevice::start().await;
    device.with_script(1, "blink", "");
    device.fail_list(true);

    let (session, _) = session_with(&device, FleetConfig::default());
    let mut events = session.subscribe();
    session.start();

    let err = session.wait_ready().await.unwrap_err();
    assert!(matches!(err, CoreError::Device { .. }));
    assert_eq!(session.state(), SessionState::Errored);
    let message = next_matching(&mut events, |e| match e {
        SessionEvent::ErrorMessage(m) => Some(m.clone()),
        _ => None,
    })
    .await;
    assert!(message.contains("script.list exploded"));

    device.fail_list(false);
    session.resync().await.unwrap();
    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(session.scripts().len(), 1);
    next_matching(&mut events, |e| (*e == SessionEvent::Ready).then_some(())).await;
}

#[tokio::test]
async fn device_closing_the_channel_destroys_the_session() {
    let device = FakeDevice::start().await;
    let (session, mut events) = ready_session(&device).await;

    device.drop_control_channels();

    next_matching(&mut events, |e| (*e == SessionEvent::Closed).then_some(())).await;
    assert_eq!(session.state(), SessionState::Destroyed);
    assert!(matches!(
        session.resync().await,
        Err(CoreError::SessionDestroyed { .. })
    ));
}

// ── Notifications ───────────────────────────────────────────────────

#[tokio::test]
async fn script_notification_triggers_one_resync() {
    let device = FakeDevice::start().await;
    device.with_script(1, "blink", "");
    let (session, mut events) = ready_session(&device).await;

    device.notify(json!({
        "src": "shellyplus1-fake",
        "method": "NotifyStatus",
        "params": { "ts": 1.0, "switch:0": { "output": true } }
    }));
    device.with_script(2, "added", "print(2);");
    device.notify(json!({
        "src": "shellyplus1-fake",
        "method": "NotifyStatus",
        "params": { "ts": 2.0, "script:2": { "running": true } }
    }));

    wait_changed(&mut events).await;
    assert_eq!(device.call_count("script.list"), 2);
    assert_eq!(session.script(2).unwrap().code.as_deref(), Some("print(2);"));
}

#[tokio::test]
async fn config_changed_event_on_script_triggers_resync() {
    let device = FakeDevice::start().await;
    device.with_script(1, "blink", "");
    let (session, mut events) = ready_session(&device).await;

    device.with_script(1, "renamed elsewhere", "");
    device.notify(json!({
        "method": "NotifyEvent",
        "params": { "events": [{ "component": "script:1", "event": "config_changed" }] }
    }));

    wait_changed(&mut events).await;
    assert_eq!(session.script(1).unwrap().name, "renamed elsewhere");
}

#[tokio::test]
async fn resync_rebuilds_the_cache_from_scratch() {
    let device = FakeDevice::start().await;
    device.with_script(1, "a", "1").with_script(2, "b", "2");
    let (session, mut events) = ready_session(&device).await;

    drain(&mut events);

    let (first, second) = tokio::join!(session.resync(), session.resync());
    first.unwrap();
    second.unwrap();
    assert_eq!(session.scripts().len(), 2);

    let seen = drain(&mut events);
    let changed = seen.iter().filter(|e| **e == SessionEvent::Changed).count();
    let listed = seen
        .iter()
        .filter(|e| matches!(e, SessionEvent::ScriptChanged(_)))
        .count();
    assert_eq!(changed, 2);
    assert_eq!(listed, 4);
}

#[tokio::test]
async fn concurrent_resyncs_never_mix_two_listings() {
    let device = FakeDevice::start().await;
    device.with_script(1, "a", "1").with_script(2, "b", "2");
    let (session, mut events) = ready_session(&device).await;
    drain(&mut events);
    device.delay_getcode(Duration::from_millis(100));

    let first = tokio::spawn({
        let session = session.clone();
        async move { session.resync().await }
    });
    eventually(|| device.call_count("script.list") == 2).await;

    // The listing changes while the first resync is still fetching code.
    device.remove_script(1);
    device.remove_script(2);
    device.with_script(3, "c", "3");
    let second = tokio::spawn({
        let session = session.clone();
        async move { session.resync().await }
    });

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    let ids: Vec<u32> = session.scripts().iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![3]);
    assert_eq!(session.script_code(3).unwrap().as_deref(), Some("3"));

    let listed: Vec<u32> = drain(&mut events)
        .iter()
        .filter_map(|e| match e {
            SessionEvent::ScriptChanged(script) => Some(script.id),
            _ => None,
        })
        .collect();
    assert_eq!(listed, vec![1, 2, 3]);
}

#[tokio::test]
async fn channel_lost_mid_sync_emits_nothing_after_closed() {
    let device = FakeDevice::start().await;
    device.with_script(1, "a", "1").with_script(2, "b", "2");
    device.drop_on_next_getcode();

    let (session, _) = session_with(&device, FleetConfig::default());
    let mut events = session.subscribe();
    session.start();

    let mut seen = Vec::new();
    next_matching(&mut events, |e| {
        seen.push(e.clone());
        (*e == SessionEvent::Closed).then_some(())
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(drain(&mut events).is_empty());

    let listed: Vec<u32> = seen
        .iter()
        .filter_map(|e| match e {
            SessionEvent::ScriptChanged(script) => Some(script.id),
            _ => None,
        })
        .collect();
    assert_eq!(listed, vec![1, 2]);
    assert!(!seen.contains(&SessionEvent::Ready));
    assert!(session.scripts().is_empty());
    assert_eq!(session.state(), SessionState::Destroyed);
}

// ── Script operations ───────────────────────────────────────────────

#[tokio::test]
async fn create_uploads_through_partial_acceptance() {
    let device = FakeDevice::start().await;
    device.cap_putcode(500);
    let (session, _) = ready_session(&device).await;

    let code: String = ('a'..='z').cycle().take(1200).collect();
    let id = session.create_script("long", &code).await.unwrap();

    assert_eq!(device.script(id).unwrap().code, code);
    assert_eq!(session.script_code(id).unwrap().as_deref(), Some(code.as_str()));
    assert!(device.call_count("script.putcode") >= 3);
}

#[tokio::test]
async fn save_falls_back_to_recreating_after_timeout() {
    let device = FakeDevice::start().await;
    device.with_script(1, "stuck", "old");
    device.stall_putcode(1);

    let config = FleetConfig {
        upload: UploadConfig {
            save_timeout: Duration::from_millis(200),
            ..UploadConfig::default()
        },
        ..FleetConfig::default()
    };
    let (session, _) = session_with(&device, config);
    session.start();
    session.wait_ready().await.unwrap();

    let outcome = session.save_script(1, "stuck", "new code").await.unwrap();
    assert_eq!(outcome, SaveOutcome::Recreated { id: 2 });
    assert_eq!(device.script(2).unwrap().code, "new code");
    assert_eq!(device.script(1).unwrap().code, "old");
}

#[tokio::test]
async fn save_uploads_in_place_when_the_device_answers() {
    let device = FakeDevice::start().await;
    device.with_script(3, "main", "old");
    let (session, _) = ready_session(&device).await;

    let outcome = session.save_script(3, "main", "new").await.unwrap();
    assert!(matches!(outcome, SaveOutcome::Uploaded(report) if report.writes == 1));
    assert_eq!(session.script_code(3).unwrap().as_deref(), Some("new"));
}

#[tokio::test]
async fn script_operations_reach_the_device() {
    let device = FakeDevice::start().await;
    device.with_script(1, "blink", "print(1);");
    let (session, _) = ready_session(&device).await;

    assert!(!session.start_script(1).await.unwrap());
    assert!(device.script(1).unwrap().running);
    assert!(session.stop_script(1).await.unwrap());

    assert!(!session.enable_script(1).await.unwrap());
    assert!(session.script(1).unwrap().enabled);
    assert!(device.script(1).unwrap().enable);

    session.rename_script(1, "blinker").await.unwrap();
    assert_eq!(session.script(1).unwrap().name, "blinker");

    assert_eq!(session.eval_script(1, "1+1").await.unwrap(), "evaluated 1+1");

    session.delete_script(1).await.unwrap();
    assert!(session.script(1).is_none());
    assert!(device.script(1).is_none());
}

#[tokio::test]
async fn device_errors_surface_with_their_text() {
    let device = FakeDevice::start().await;
    device.with_script(1, "blink", "");
    let (session, _) = ready_session(&device).await;

    let err = session.upload_script(7, "x").await.unwrap_err();
    assert_eq!(err.to_string(), "Argument 'id', value 7 not found!");

    let err = session.start_script(9).await.unwrap_err();
    assert!(matches!(err, CoreError::ScriptNotFound { id: 9, .. }));
    assert_eq!(device.call_count("script.start"), 0);
}

// ── Debug log ───────────────────────────────────────────────────────

#[tokio::test]
async fn debug_log_lines_are_buffered_and_announced() {
    let device = FakeDevice::start().await;
    let (session, mut events) = ready_session(&device).await;

    session.open_debug_log().unwrap();
    eventually(|| device.debug_active() == 1).await;
    assert!(session.is_debug_log_open());

    device.log(1_700_000_000.5, -1, "hello from print");
    device.log(1_700_000_001.0, 2, "shelly_notification:163 Status change");

    let entry = next_matching(&mut events, |e| match e {
        SessionEvent::DebugMessage(entry) if entry.level == 2 => Some(entry.clone()),
        _ => None,
    })
    .await;
    assert_eq!(entry.message, "shelly_notification:163 Status change");
    assert_eq!(session.log_entries().len(), 2);

    let visible = session.visible_log_entries();
    assert_eq!(visible.len(), 1);
    assert!(visible[0].is_print());

    assert!(session.close_debug_log());
    eventually(|| device.debug_active() == 0).await;
    assert!(!session.close_debug_log());
}

#[tokio::test]
async fn destroy_closes_the_debug_log() {
    let device = FakeDevice::start().await;
    let (session, _) = ready_session(&device).await;

    session.open_debug_log().unwrap();
    eventually(|| device.debug_active() == 1).await;

    session.destroy();
    eventually(|| device.debug_active() == 0).await;
    assert!(!session.is_debug_log_open());
    assert!(session.open_debug_log().is_err());
}
