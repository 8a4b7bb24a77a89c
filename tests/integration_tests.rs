//! Integration tests for the Binix launcher
//!
//! These drive the launcher on its own thread through the public handle, with
//! the simulated binder standing in for the host's service facility.

use binix_launcher::process::{
    EventSink, LaunchCallback, LauncherHandle, SimulatedBinder, SimulatedDevice,
};
use binix_launcher::utils::CapacityOverride;
use binix_launcher::{
    AllocatorKey, CreationParams, DEFAULT_PARAMS_ID, Dispatch, LaunchedProcess, Launcher,
    LauncherConfig, LauncherError, LauncherThread, Result as LaunchResult, SpawnRequest,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use tokio::sync::oneshot;
use tokio_test::{assert_err, assert_ok};

const HOST: &str = "org.binix.browser";
const EXTERNAL: &str = "org.external.apk";

fn launcher_with(sandboxed_capacity: usize) -> (LauncherThread<SimulatedBinder>, SimulatedDevice) {
    let config = LauncherConfig {
        sandboxed_capacity,
        ..LauncherConfig::default()
    };
    LauncherThread::simulated(config).unwrap()
}

fn host() -> AllocatorKey {
    AllocatorKey::sandboxed(HOST)
}

/// Submit without waiting for setup; the receiver yields the final outcome
async fn submit(
    handle: &LauncherHandle<SimulatedBinder>,
    request: SpawnRequest,
) -> (LaunchResult<Dispatch>, oneshot::Receiver<LaunchResult<LaunchedProcess>>) {
    let (tx, rx) = oneshot::channel();
    let request = request.with_callback(move |outcome| {
        let _ = tx.send(outcome);
    });
    let dispatch = handle.run(move |l| l.launch(request)).await.unwrap();
    (dispatch, rx)
}

#[tokio::test]
async fn test_launch_within_capacity() {
    let (launcher, device) = launcher_with(3);
    let results = launcher
        .launch_all((0..3).map(|n| SpawnRequest::new(host()).with_child_process_id(n)))
        .await;

    let mut slots: Vec<usize> = results
        .into_iter()
        .map(|r| assert_ok!(r).service_number())
        .collect();
    slots.sort();
    assert_eq!(slots, vec![0, 1, 2]);
    assert_eq!(device.setups_received().len(), 3);

    let connected = launcher.run(|l| l.connected_services_count()).await.unwrap();
    assert_eq!(connected, 3);
}

#[tokio::test]
async fn test_full_pool_queues_until_crash() {
    let (launcher, device) = launcher_with(1);
    let first = assert_ok!(launcher.launch(SpawnRequest::new(host())).await);

    let (dispatch, second) = submit(&launcher, SpawnRequest::new(host())).await;
    assert_eq!(dispatch, Ok(Dispatch::Queued { pending: 1 }));
    let pending = launcher.run(|l| l.pending_spawns_count(&host())).await.unwrap();
    assert_eq!(pending, 1);

    assert!(device.crash_pid(first.pid));
    let replayed = assert_ok!(second.await.unwrap());
    assert_eq!(replayed.service_number(), 0);
    assert_ne!(replayed.connection, first.connection);
    assert_ne!(replayed.pid, first.pid);

    let (pending, allocated) = launcher
        .run(|l| (l.pending_spawns_count(&host()), l.allocated_connections_count(&host())))
        .await
        .unwrap();
    assert_eq!((pending, allocated), (0, 1));
}

#[tokio::test]
async fn test_bind_failure_reported() {
    let (launcher, device) = launcher_with(2);
    device.uninstall(EXTERNAL);
    let key = AllocatorKey::sandboxed(EXTERNAL);

    let err = assert_err!(launcher.launch(SpawnRequest::new(key.clone())).await);
    assert!(matches!(err, LauncherError::BindFailure { .. }));
    assert!(err.is_retryable());

    let allocated = launcher
        .run(move |l| l.allocated_connections_count(&key))
        .await
        .unwrap();
    assert_eq!(allocated, 0);
}

#[tokio::test]
async fn test_crash_before_setup() {
    let (launcher, device) = launcher_with(2);
    device.set_auto_setup(false);

    let (dispatch, outcome) = submit(&launcher, SpawnRequest::new(host())).await;
    let id = dispatch.unwrap().connection().cloned().unwrap();
    assert!(device.crash(&id));

    let err = assert_err!(outcome.await.unwrap());
    assert!(matches!(err, LauncherError::Crashed { pid: 0, .. }));
    let allocated = launcher
        .run(|l| l.allocated_connections_count(&host()))
        .await
        .unwrap();
    assert_eq!(allocated, 0);
}

#[tokio::test]
async fn test_stop_before_setup() {
    let (launcher, device) = launcher_with(2);
    device.set_auto_setup(false);

    let (dispatch, outcome) = submit(&launcher, SpawnRequest::new(host())).await;
    let id = dispatch.unwrap().connection().cloned().unwrap();
    let stopped = launcher
        .run(move |l| l.stop_connection(&id))
        .await
        .unwrap();
    assert!(stopped);

    let err = assert_err!(outcome.await.unwrap());
    assert!(matches!(err, LauncherError::Stopped { pid: 0, .. }));
    assert!(!err.is_retryable());
    assert!(device.live_connections().is_empty());
}

#[tokio::test]
async fn test_pending_spawns_fifo() {
    let (launcher, device) = launcher_with(1);
    let first = assert_ok!(
        launcher
            .launch(SpawnRequest::new(host()).with_child_process_id(0))
            .await
    );

    let mut waiting = Vec::new();
    for n in 1..=2 {
        let (_, rx) = submit(&launcher, SpawnRequest::new(host()).with_child_process_id(n)).await;
        waiting.push(rx);
    }

    let mut pid = first.pid;
    for rx in waiting {
        device.crash_pid(pid);
        pid = assert_ok!(rx.await.unwrap()).pid;
    }

    let order: Vec<i32> = device
        .setups_received()
        .iter()
        .map(|(_, bundle)| bundle.child_process_id)
        .collect();
    assert_eq!(order, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_external_package_has_own_pool() {
    let config = LauncherConfig {
        capacity_overrides: vec![CapacityOverride {
            package: EXTERNAL.to_string(),
            sandboxed: true,
            capacity: 1,
        }],
        ..LauncherConfig::default()
    };
    let (launcher, _device) = LauncherThread::simulated(config).unwrap();
    let external = AllocatorKey::sandboxed(EXTERNAL);

    let launched = assert_ok!(launcher.launch(SpawnRequest::new(external.clone())).await);
    assert_eq!(launched.service_number(), 0);
    let (dispatch, _queued) = submit(&launcher, SpawnRequest::new(external.clone())).await;
    assert!(dispatch.unwrap().is_queued());

    let tab = assert_ok!(launcher.launch(SpawnRequest::new(host())).await);
    assert_eq!(tab.service_number(), 0);

    let array = launcher
        .run(move |l| l.connection_array(&external))
        .await
        .unwrap();
    assert_eq!(array.len(), 1);
    assert!(array[0].as_ref().unwrap().is_external);
}

#[tokio::test]
async fn test_cross_process_conflict_retries_next_slot() {
    let (launcher, device) = launcher_with(4);
    device.hold_slot_elsewhere(HOST, 0);
    let params_id = launcher
        .run(|l| {
            l.params_mut()
                .register(CreationParams::new(HOST).bind_to_caller_check(true))
        })
        .await
        .unwrap();

    let (tx, rx) = oneshot::channel::<LaunchResult<LaunchedProcess>>();
    launcher
        .post(move |l| {
            let callback: LaunchCallback = Box::new(move |outcome| {
                let _ = tx.send(outcome);
            });
            let _ = l.start(params_id, true, Vec::new(), Vec::new(), 7, Some(callback));
        })
        .unwrap();

    let launched = assert_ok!(rx.await.unwrap());
    assert_eq!(launched.service_number(), 1);
    let array = launcher.run(|l| l.connection_array(&host())).await.unwrap();
    assert!(array[0].as_ref().unwrap().conflicted);
}

#[tokio::test]
async fn test_warm_up_serves_default_params() {
    let (launcher, _device) = launcher_with(4);
    let spare = launcher.run(|l| l.warm_up()).await.unwrap().unwrap().unwrap();

    let (tx, rx) = oneshot::channel::<LaunchResult<LaunchedProcess>>();
    launcher
        .post(move |l| {
            let callback: LaunchCallback = Box::new(move |outcome| {
                let _ = tx.send(outcome);
            });
            let _ = l.start(DEFAULT_PARAMS_ID, true, Vec::new(), Vec::new(), 1, Some(callback));
        })
        .unwrap();

    let launched = assert_ok!(rx.await.unwrap());
    assert_eq!(launched.connection, spare);
    let allocated = launcher
        .run(|l| l.allocated_connections_count(&host()))
        .await
        .unwrap();
    assert_eq!(allocated, 1);
}

#[tokio::test]
async fn test_stop_by_pid() {
    let (launcher, device) = launcher_with(2);
    let launched = assert_ok!(launcher.launch(SpawnRequest::new(host())).await);
    let pid = launched.pid;

    assert!(launcher.run(move |l| l.stop(pid)).await.unwrap());
    assert!(!launcher.run(move |l| l.stop(pid)).await.unwrap());
    assert!(device.live_connections().is_empty());

    let id = launched.connection.clone();
    let last = launcher.run(move |l| l.last_known_pid(&id)).await.unwrap();
    assert_eq!(last, Some(pid));
}

#[tokio::test]
async fn test_blocking_on_launcher_thread_rejected() {
    let (launcher, _device) = launcher_with(1);
    let inner = launcher.handle();
    let result = launcher
        .run(move |_| {
            assert!(inner.is_launcher_thread());
            inner.run_blocking(|l| l.connected_services_count())
        })
        .await
        .unwrap();
    assert_eq!(result, Err(LauncherError::BlockingOnLauncherThread));
}

#[tokio::test]
async fn test_shutdown_fails_waiting_spawns() {
    let (launcher, device) = launcher_with(1);
    device.set_auto_setup(false);
    let (_, first) = submit(&launcher, SpawnRequest::new(host())).await;
    let (_, queued) = submit(&launcher, SpawnRequest::new(host())).await;
    let handle = launcher.handle();

    launcher.shutdown();
    assert_eq!(first.await.unwrap(), Err(LauncherError::LauncherShutDown));
    assert_eq!(queued.await.unwrap(), Err(LauncherError::LauncherShutDown));
    assert!(device.live_connections().is_empty());

    let err = assert_err!(handle.launch(SpawnRequest::new(host())).await);
    assert_eq!(err, LauncherError::LauncherShutDown);
}

#[test]
fn test_config_file_round_trip() {
    let path = std::env::temp_dir().join(format!("binix-launcher-{}.json", std::process::id()));
    let json = r#"{"host_package": "org.binix.shell", "sandboxed_capacity": 2}"#;
    std::fs::write(&path, json).unwrap();
    let config = LauncherConfig::from_file(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(config.host_package, "org.binix.shell");
    assert_eq!(config.capacity_for("org.binix.shell", true), 2);
    assert_eq!(config.max_conflict_retries, LauncherConfig::default().max_conflict_retries);
}

proptest! {
    /// Every submitted spawn is either holding a slot or waiting for one
    #[test]
    fn test_spawns_never_exceed_capacity(capacity in 1usize..5, spawns in 0usize..12) {
        let config = LauncherConfig {
            sandboxed_capacity: capacity,
            ..LauncherConfig::default()
        };
        let (sink, events) = EventSink::channel();
        let device = SimulatedDevice::new(sink);
        let mut launcher = Launcher::new(config, device.binder());

        for _ in 0..spawns {
            launcher.launch(SpawnRequest::new(host())).unwrap();
        }
        while let Ok(event) = events.try_recv() {
            launcher.handle_event(event);
        }

        let allocated = launcher.allocated_connections_count(&host());
        let pending = launcher.pending_spawns_count(&host());
        prop_assert!(allocated <= capacity);
        prop_assert_eq!(allocated + pending, spawns);
        prop_assert_eq!(launcher.connected_services_count(), allocated);
    }
}
