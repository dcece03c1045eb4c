mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use common::{
    Call, Launch, MockProvider, RecordingRunner, fast_poll, lifecycle, names, record,
    remote_settings, settings,
};
use sparkfleet_core::{
    CloudAdapter, ExistingClusterPolicy, FleetError, InstanceRecord, InstanceState, Lifecycle,
    MarketType, Role,
};
use tokio::net::TcpListener;

async fn ssh_listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

fn master_record(name: &str, id: &str) -> InstanceRecord {
    InstanceRecord {
        provider: "mock".to_string(),
        name: name.to_string(),
        id: id.to_string(),
        role: Role::Master,
        instance_type: "gpu_1x_a10".to_string(),
        market_type: MarketType::OnDemand,
        key_name: "fleet".to_string(),
        username: "ubuntu".to_string(),
        public_ipv4_address: "127.0.0.1".to_string(),
        ssh_port: 22,
    }
}

#[tokio::test]
async fn test_build_absorbs_provider_errors() {
    let dir = tempfile::tempdir().unwrap();
    let (_listener, port) = ssh_listener().await;
    let provider = Arc::new(MockProvider::scripted(&[
        Launch::Succeed,
        Launch::Succeed,
        Launch::Fail,
        Launch::Succeed,
        Launch::Fail,
    ]));
    // One master plus four workers: five launches, two of which fail.
    let lifecycle = lifecycle(settings(dir.path(), port, 4), provider.clone());

    lifecycle.build(&names(&["alpha"]), ExistingClusterPolicy::Skip).await.unwrap();

    assert_eq!(provider.launches(), 5);
    let records = lifecycle.registry().read_all("alpha").await.unwrap();
    assert_eq!(records.len(), 3);
    for record in &records {
        assert_eq!(record.provider, "mock");
        assert_eq!(record.public_ipv4_address, "127.0.0.1");
        assert_eq!(record.ssh_port, port);
    }
}

#[tokio::test]
async fn test_capacity_exhaustion_aborts_cluster_build() {
    let dir = tempfile::tempdir().unwrap();
    let (_listener, port) = ssh_listener().await;
    // The master group takes the first launch; the third launch overall is
    // the second of the five workers.
    let provider = Arc::new(MockProvider::scripted(&[
        Launch::Succeed,
        Launch::Succeed,
        Launch::Quota,
    ]));
    let lifecycle = lifecycle(settings(dir.path(), port, 5), provider.clone());
    let cluster = lifecycle.settings().cluster("alpha").unwrap().clone();

    let err = lifecycle
        .build_cluster(&cluster, ExistingClusterPolicy::Skip)
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::CapacityExceeded { ref cluster, .. } if cluster == "alpha"));
}

#[tokio::test]
async fn test_capacity_exhaustion_fails_the_phase() {
    let dir = tempfile::tempdir().unwrap();
    let (_listener, port) = ssh_listener().await;
    let provider = Arc::new(MockProvider::scripted(&[Launch::Quota]));
    let lifecycle = lifecycle(settings(dir.path(), port, 0), provider);

    let err = lifecycle
        .build(&names(&["alpha"]), ExistingClusterPolicy::Skip)
        .await
        .unwrap_err();
    match err {
        FleetError::PhaseFailed { phase, failures } => {
            assert_eq!(phase, "build");
            assert_eq!(failures.len(), 1);
            assert!(matches!(failures[0].error, FleetError::CapacityExceeded { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_existing_cluster_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let (_listener, port) = ssh_listener().await;
    let provider = Arc::new(MockProvider::new());
    let lifecycle = lifecycle(settings(dir.path(), port, 1), provider.clone());

    lifecycle.build(&names(&["alpha"]), ExistingClusterPolicy::Skip).await.unwrap();
    assert_eq!(provider.launches(), 2);

    lifecycle.build(&names(&["alpha"]), ExistingClusterPolicy::Skip).await.unwrap();
    lifecycle.build(&names(&["alpha"]), ExistingClusterPolicy::Keep).await.unwrap();
    assert_eq!(provider.launches(), 2);
    assert_eq!(provider.termination_requests(), 0);
    assert_eq!(lifecycle.registry().read_all("alpha").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_replace_rebuilds_from_scratch() {
    let dir = tempfile::tempdir().unwrap();
    let (_listener, port) = ssh_listener().await;
    let provider = Arc::new(MockProvider::new());
    let lifecycle = lifecycle(settings(dir.path(), port, 1), provider.clone());

    lifecycle.build(&names(&["alpha"]), ExistingClusterPolicy::Skip).await.unwrap();
    let old: Vec<String> = lifecycle
        .registry()
        .read_all("alpha")
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();

    lifecycle.build(&names(&["alpha"]), ExistingClusterPolicy::Replace).await.unwrap();

    assert_eq!(provider.termination_requests(), 1);
    for id in &old {
        assert_eq!(provider.state(id), Some(InstanceState::Terminated));
    }
    let new = lifecycle.registry().read_all("alpha").await.unwrap();
    assert_eq!(new.len(), 2);
    assert!(new.iter().all(|r| !old.contains(&r.id)));
}

#[tokio::test]
async fn test_first_running_master_skips_terminated() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MockProvider::new());
    provider.set_state("i-old", InstanceState::Terminated);
    provider.set_state("i-new", InstanceState::Running);
    let lifecycle = lifecycle(settings(dir.path(), 22, 0), provider);

    let registry = lifecycle.registry();
    registry.append("alpha", &master_record("alpha-master-0", "i-old")).await.unwrap();
    registry.append("alpha", &master_record("alpha-master-1", "i-new")).await.unwrap();

    let master = lifecycle.get_first_running_master("alpha").await.unwrap();
    assert_eq!(master.name, "alpha-master-1");
}

#[tokio::test]
async fn test_no_running_master() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MockProvider::new());
    let lifecycle = lifecycle(settings(dir.path(), 22, 0), provider);

    // The provider has never heard of this instance.
    lifecycle
        .registry()
        .append("alpha", &master_record("alpha-master-0", "i-gone"))
        .await
        .unwrap();

    let err = lifecycle.get_first_running_master("alpha").await.unwrap_err();
    assert!(matches!(err, FleetError::NoRunningMaster(ref c) if c == "alpha"));
}

#[tokio::test]
async fn test_terminate_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let (_listener, port) = ssh_listener().await;
    let provider = Arc::new(MockProvider::new());
    let lifecycle = lifecycle(settings(dir.path(), port, 2), provider.clone());

    lifecycle.build(&names(&["alpha"]), ExistingClusterPolicy::Skip).await.unwrap();

    lifecycle.terminate(&names(&["alpha"]), false).await.unwrap();
    assert_eq!(provider.termination_requests(), 1);
    assert!(lifecycle.registry().exists("alpha"));

    lifecycle.terminate(&names(&["alpha"]), false).await.unwrap();
    assert_eq!(provider.termination_requests(), 1);

    lifecycle.terminate(&names(&["alpha"]), true).await.unwrap();
    assert!(!lifecycle.registry().exists("alpha"));
    lifecycle.terminate(&names(&["alpha"]), true).await.unwrap();
    assert_eq!(provider.termination_requests(), 1);
}

#[tokio::test]
async fn test_configure_requires_a_built_cluster() {
    let dir = tempfile::tempdir().unwrap();
    let lifecycle = lifecycle(settings(dir.path(), 22, 1), Arc::new(MockProvider::new()));

    let err = lifecycle.configure(&names(&["alpha"])).await.unwrap_err();
    match err {
        FleetError::PhaseFailed { failures, .. } => {
            assert!(matches!(failures[0].error, FleetError::ClusterNotBuilt(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_missing_key_fails_before_remote_commands() {
    let dir = tempfile::tempdir().unwrap();
    let (_listener, port) = ssh_listener().await;
    let lifecycle = lifecycle(settings(dir.path(), port, 1), Arc::new(MockProvider::new()));
    lifecycle.build(&names(&["alpha"]), ExistingClusterPolicy::Skip).await.unwrap();

    // No key folder exists, so every member fails on key resolution.
    let err = lifecycle.configure(&names(&["alpha"])).await.unwrap_err();
    match err {
        FleetError::PhaseFailed { failures, .. } => match &failures[0].error {
            FleetError::MembersFailed {
                failed,
                total,
                source,
                ..
            } => {
                assert_eq!((*failed, *total), (2, 2));
                assert!(matches!(**source, FleetError::KeyFileMissing { .. }));
            }
            other => panic!("unexpected error: {other}"),
        },
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_unknown_cluster_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let lifecycle = lifecycle(settings(dir.path(), 22, 1), Arc::new(MockProvider::new()));
    let err = lifecycle.stop(&names(&["beta"])).await.unwrap_err();
    assert!(matches!(err, FleetError::UnknownCluster(ref c) if c == "beta"));
}

#[tokio::test]
async fn test_cluster_status_reports_live_state() {
    let dir = tempfile::tempdir().unwrap();
    let (_listener, port) = ssh_listener().await;
    let provider = Arc::new(MockProvider::new());
    let lifecycle = lifecycle(settings(dir.path(), port, 1), provider.clone());

    assert!(lifecycle.cluster_status("alpha").await.unwrap().is_empty());
    lifecycle.build(&names(&["alpha"]), ExistingClusterPolicy::Skip).await.unwrap();

    let members = lifecycle.cluster_status("alpha").await.unwrap();
    assert_eq!(members.len(), 2);
    provider.set_state(&members[0].record.id, InstanceState::Terminated);

    let members = lifecycle.cluster_status("alpha").await.unwrap();
    let states: Vec<InstanceState> = members.iter().map(|m| m.state).collect();
    assert_eq!(states, vec![InstanceState::Terminated, InstanceState::Running]);
}

#[test]
fn test_failed_build_records_every_created_instance() {
    let dir = tempfile::tempdir().unwrap();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    // worker-0 is still booting when worker-1 runs out of capacity.
    let provider = Arc::new(
        MockProvider::new()
            .with_launch("alpha-worker-0", Launch::SlowBoot(Duration::from_millis(300)))
            .with_launch("alpha-worker-1", Launch::Quota),
    );
    let lifecycle = lifecycle(settings(dir.path(), port, 2), provider.clone());

    // Dropping the runtime right after the phase returns mirrors the binary exiting.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    let result = runtime.block_on(lifecycle.build(&names(&["alpha"]), ExistingClusterPolicy::Skip));
    drop(runtime);

    assert!(matches!(result, Err(FleetError::PhaseFailed { .. })));
    let contents = std::fs::read_to_string(lifecycle.registry().path("alpha")).unwrap();
    let blocks = contents.lines().filter(|l| l.starts_with("[Instance ")).count();
    assert_eq!(provider.created().len(), 2);
    assert_eq!(blocks, provider.created().len());
}

#[tokio::test]
async fn test_role_groups_launch_concurrently() {
    let dir = tempfile::tempdir().unwrap();
    let (_listener, port) = ssh_listener().await;
    // A slow master must not hold back the worker group.
    let provider = Arc::new(
        MockProvider::new().with_launch("alpha-master-0", Launch::SlowBoot(Duration::from_millis(500))),
    );
    let lifecycle = lifecycle(settings(dir.path(), port, 1), provider.clone());

    lifecycle.build(&names(&["alpha"]), ExistingClusterPolicy::Skip).await.unwrap();

    let records = lifecycle.registry().read_all("alpha").await.unwrap();
    let order: Vec<&str> = records.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(order, ["alpha-worker-0", "alpha-master-0"]);
}

#[tokio::test]
async fn test_terminate_keeps_registry_listing_other_providers() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MockProvider::new());
    provider.set_state("i-own", InstanceState::Running);
    let lifecycle = lifecycle(settings(dir.path(), 22, 0), provider.clone());

    let registry = lifecycle.registry();
    registry.append("alpha", &master_record("alpha-master-0", "i-own")).await.unwrap();
    let mut foreign = master_record("alpha-master-1", "vm-1");
    foreign.provider = "elsewhere".to_string();
    registry.append("alpha", &foreign).await.unwrap();

    let err = lifecycle.terminate(&names(&["alpha"]), true).await.unwrap_err();
    match err {
        FleetError::PhaseFailed { failures, .. } => {
            assert!(matches!(failures[0].error, FleetError::ForeignInstances { count: 1, .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(provider.state("i-own"), Some(InstanceState::Terminated));
    assert_eq!(registry.read_all("alpha").await.unwrap().len(), 2);
}

/// A built `alpha` cluster at 10.0.0.1 (master) and 10.0.0.2-3 (workers),
/// with remote commands going to a recorder.
async fn remote_cluster(root: &std::path::Path) -> (Lifecycle, Arc<MockProvider>, Arc<RecordingRunner>) {
    let provider = Arc::new(MockProvider::new());
    let runner = Arc::new(RecordingRunner::default());
    let lifecycle = Lifecycle::with_runner(
        remote_settings(root),
        CloudAdapter::new(provider.clone(), fast_poll()),
        runner.clone(),
    );
    let members = [
        record("alpha-master-0", "i-m0", Role::Master, "10.0.0.1"),
        record("alpha-worker-0", "i-w0", Role::Worker, "10.0.0.2"),
        record("alpha-worker-1", "i-w1", Role::Worker, "10.0.0.3"),
    ];
    for member in &members {
        provider.set_state(&member.id, InstanceState::Running);
        lifecycle.registry().append("alpha", member).await.unwrap();
    }
    (lifecycle, provider, runner)
}

#[tokio::test]
async fn test_configure_runs_each_role_setup() {
    let dir = tempfile::tempdir().unwrap();
    let (lifecycle, _, runner) = remote_cluster(dir.path()).await;

    lifecycle.configure(&names(&["alpha"])).await.unwrap();

    assert_eq!(runner.calls().len(), 3);
    assert_eq!(runner.commands_on("10.0.0.1"), ["setup-master alpha-master-0"]);
    assert_eq!(runner.commands_on("10.0.0.2"), ["setup-worker alpha-worker-0 10.0.0.1"]);
    assert_eq!(runner.commands_on("10.0.0.3"), ["setup-worker alpha-worker-1 10.0.0.1"]);
}

#[tokio::test]
async fn test_start_points_workers_at_the_master() {
    let dir = tempfile::tempdir().unwrap();
    let (lifecycle, _, runner) = remote_cluster(dir.path()).await;

    lifecycle.start(&names(&["alpha"])).await.unwrap();

    let calls = runner.calls();
    assert_eq!(calls[0].host(), "10.0.0.1");
    assert_eq!(runner.commands_on("10.0.0.1"), ["start-master 10.0.0.1:7077"]);
    for host in ["10.0.0.2", "10.0.0.3"] {
        let commands = runner.commands_on(host);
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[2], "start-worker 10.0.0.1:7077 8 16384");
    }
}

#[tokio::test]
async fn test_submit_runs_only_on_first_running_master() {
    let dir = tempfile::tempdir().unwrap();
    let (lifecycle, provider, runner) = remote_cluster(dir.path()).await;
    provider.set_state("i-m0", InstanceState::Terminated);
    provider.set_state("i-m1", InstanceState::Running);
    lifecycle
        .registry()
        .append("alpha", &record("alpha-master-1", "i-m1", Role::Master, "10.0.0.4"))
        .await
        .unwrap();

    lifecycle.submit(&names(&["alpha"])).await.unwrap();

    assert_eq!(
        runner.calls(),
        [Call::Run {
            host: "10.0.0.4".to_string(),
            command: "submit --master 10.0.0.4:7077".to_string(),
        }]
    );
}

#[tokio::test]
async fn test_stop_keeps_registry_entries() {
    let dir = tempfile::tempdir().unwrap();
    let (lifecycle, provider, runner) = remote_cluster(dir.path()).await;

    lifecycle.stop(&names(&["alpha"])).await.unwrap();

    assert_eq!(runner.commands_on("10.0.0.1"), ["stop-master"]);
    assert_eq!(runner.commands_on("10.0.0.2"), ["stop-worker"]);
    assert_eq!(runner.commands_on("10.0.0.3"), ["stop-worker"]);
    assert_eq!(lifecycle.registry().read_all("alpha").await.unwrap().len(), 3);
    assert_eq!(provider.termination_requests(), 0);
}

#[tokio::test]
async fn test_execute_pushes_artifacts_to_every_member_before_submitting() {
    let dir = tempfile::tempdir().unwrap();
    let (lifecycle, _, runner) = remote_cluster(dir.path()).await;

    lifecycle.execute(&names(&["alpha"])).await.unwrap();

    let calls = runner.calls();
    let (submit, copies) = calls.split_last().unwrap();
    assert_eq!(
        *submit,
        Call::Run {
            host: "10.0.0.1".to_string(),
            command: "submit --master 10.0.0.1:7077".to_string(),
        }
    );
    let mut pushed: Vec<&str> = copies
        .iter()
        .filter_map(|call| match call {
            Call::Push { host, sources, remote_dir } => {
                assert_eq!(sources, &[PathBuf::from("job/app.py")]);
                assert_eq!(remote_dir, "~/job");
                Some(host.as_str())
            }
            Call::Run { command, .. } => {
                assert_eq!(command, "mkdir -p ~/job");
                None
            }
        })
        .collect();
    pushed.sort();
    assert_eq!(pushed, ["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
}
