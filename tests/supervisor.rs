mod common;

use common::{ids, plugin_client, plugin_config, wait_for_devices, FakeKubelet, WAIT};
use deviceplugin::api;
use deviceplugin::{Device, Error, Handlers, PluginSession, Supervisor};
use std::sync::Arc;
use tempfile::tempdir;
use tokio::sync::{mpsc, watch};

async fn next_session(
    sessions: &mut watch::Receiver<Option<Arc<PluginSession>>>,
    previous: Option<&Arc<PluginSession>>,
) -> Arc<PluginSession> {
    let current = tokio::time::timeout(
        WAIT,
        sessions.wait_for(|session| match (session, previous) {
            (Some(session), Some(previous)) => !Arc::ptr_eq(session, previous),
            (Some(_), None) => true,
            (None, _) => false,
        }),
    )
    .await
    .expect("no new session")
    .unwrap();
    current.clone().unwrap()
}

#[tokio::test]
async fn test_control_restarts_and_exits() {
    let dir = tempdir().unwrap();
    let mut kubelet = FakeKubelet::start(dir.path());
    let (control, control_rx) = mpsc::channel(1);

    let supervisor = Supervisor::new(plugin_config(dir.path()), Handlers::new())
        .without_kubelet_watch()
        .with_control(control_rx);
    let mut sessions = supervisor.sessions();
    let run = tokio::spawn(supervisor.run());

    kubelet.next_registration().await;
    let first = next_session(&mut sessions, None).await;

    control.send(true).await.unwrap();
    kubelet.next_registration().await;
    let second = next_session(&mut sessions, Some(&first)).await;
    assert!(second.socket_path().exists());

    control.send(false).await.unwrap();
    tokio::time::timeout(WAIT, run).await.unwrap().unwrap().unwrap();
    assert!(!second.socket_path().exists());
}

#[tokio::test]
async fn test_closed_control_channel_exits() {
    let dir = tempdir().unwrap();
    let mut kubelet = FakeKubelet::start(dir.path());
    let (control, control_rx) = mpsc::channel::<bool>(1);

    let run = tokio::spawn(
        Supervisor::new(plugin_config(dir.path()), Handlers::new())
            .without_kubelet_watch()
            .with_control(control_rx)
            .run(),
    );
    kubelet.next_registration().await;

    drop(control);
    tokio::time::timeout(WAIT, run).await.unwrap().unwrap().unwrap();
    assert!(!plugin_config(dir.path()).socket_path().exists());
}

#[tokio::test]
async fn test_kubelet_restart_triggers_reregistration() {
    let dir = tempdir().unwrap();
    let mut kubelet = FakeKubelet::start(dir.path());
    let (control, control_rx) = mpsc::channel(1);

    let supervisor = Supervisor::new(plugin_config(dir.path()), Handlers::new()).with_control(control_rx);
    let mut sessions = supervisor.sessions();
    let run = tokio::spawn(supervisor.run());

    kubelet.next_registration().await;
    let first = next_session(&mut sessions, None).await;

    kubelet.restart().await;
    let request = kubelet.next_registration().await;
    assert_eq!(request.endpoint, "dir.sock");
    next_session(&mut sessions, Some(&first)).await;

    control.send(false).await.unwrap();
    tokio::time::timeout(WAIT, run).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_device_feed_is_replayed_after_restart() {
    let dir = tempdir().unwrap();
    let mut kubelet = FakeKubelet::start(dir.path());
    let (control, control_rx) = mpsc::channel(1);
    let (updates, updates_rx) = mpsc::channel(1);

    let supervisor = Supervisor::new(plugin_config(dir.path()), Handlers::new())
        .without_kubelet_watch()
        .with_updates(updates_rx)
        .with_control(control_rx);
    let mut sessions = supervisor.sessions();
    let run = tokio::spawn(supervisor.run());

    kubelet.next_registration().await;
    let first = next_session(&mut sessions, None).await;
    updates
        .send(vec![Device::healthy("dev-a"), Device::unhealthy("dev-b")])
        .await
        .unwrap();

    let mut client = plugin_client(first.socket_path()).await;
    let mut stream = client.list_and_watch(api::Empty {}).await.unwrap().into_inner();
    wait_for_devices(&mut stream, |devices| devices.len() == 2).await;

    control.send(true).await.unwrap();
    kubelet.next_registration().await;
    let second = next_session(&mut sessions, Some(&first)).await;

    let mut client = plugin_client(second.socket_path()).await;
    let mut stream = client.list_and_watch(api::Empty {}).await.unwrap().into_inner();
    let devices = wait_for_devices(&mut stream, |_| true).await;
    assert_eq!(ids(&devices), vec!["dev-a", "dev-b"]);
    assert_eq!(devices[1].health, api::UNHEALTHY);

    control.send(false).await.unwrap();
    tokio::time::timeout(WAIT, run).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_start_failure_ends_run() {
    let dir = tempdir().unwrap();
    let (_control, control_rx) = mpsc::channel(1);

    let result = tokio::time::timeout(
        WAIT,
        Supervisor::new(plugin_config(dir.path()), Handlers::new())
            .without_kubelet_watch()
            .with_control(control_rx)
            .run(),
    )
    .await
    .unwrap();
    assert!(matches!(result, Err(Error::Registration(_))));
    assert!(!plugin_config(dir.path()).socket_path().exists());
}

#[tokio::test]
async fn test_run_without_triggers_is_rejected() {
    let dir = tempdir().unwrap();
    let err = Supervisor::new(plugin_config(dir.path()), Handlers::new())
        .without_kubelet_watch()
        .run()
        .await
        .unwrap_err();
    assert!(err.is_config());
}

#[tokio::test]
async fn test_run_helper_feeds_devices() {
    let dir = tempdir().unwrap();
    let mut kubelet = FakeKubelet::start(dir.path());
    let (control, control_rx) = mpsc::channel(1);
    let (updates, updates_rx) = mpsc::channel(1);
    let config = plugin_config(dir.path());
    let socket = config.socket_path();

    let run = tokio::spawn(deviceplugin::run(config, Handlers::new(), updates_rx, Some(control_rx)));
    kubelet.next_registration().await;
    updates.send(vec![Device::healthy("dev-a")]).await.unwrap();

    let mut client = plugin_client(&socket).await;
    let mut stream = client.list_and_watch(api::Empty {}).await.unwrap().into_inner();
    let devices = wait_for_devices(&mut stream, |devices| devices.len() == 1).await;
    assert_eq!(ids(&devices), vec!["dev-a"]);

    control.send(false).await.unwrap();
    tokio::time::timeout(WAIT, run).await.unwrap().unwrap().unwrap();
}
