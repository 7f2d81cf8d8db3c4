//! Tests against real processes
//!
//! The reaper collects every child of the test binary, so all real-process
//! scenarios live in one test.

use std::sync::Arc;
use std::time::Duration;
use tabinit::process::reap_children;
use tabinit::{
    Action, Host, IsolationProvisioner, IsolationSettings, LinuxHost, OsSpawner,
    ProcessDefinition, ProcessStatus, ProcessSupervisor, Runlevel, SupervisorConfig,
};

async fn wait_for_status(sup: &ProcessSupervisor, id: &str, status: ProcessStatus) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if sup.get(id).await.map(|e| e.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{} never reached {}", id, status));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_real_processes_exit_and_stop() {
    let sup = ProcessSupervisor::new(
        Arc::new(OsSpawner::default()),
        IsolationProvisioner::new(IsolationSettings::disabled()),
    )
    .with_grace(Duration::from_millis(500));

    // Without CAP_SYS_ADMIN the namespace request is dropped and the
    // command runs in place, so the same assertions hold either way
    let isolated = ProcessSupervisor::new(
        Arc::new(OsSpawner::default()),
        IsolationProvisioner::new(IsolationSettings {
            enabled: true,
            pid: true,
            mount: false,
            ..IsolationSettings::disabled()
        }),
    )
    .with_grace(Duration::from_millis(500));

    let reaper = {
        let sup = sup.clone();
        let isolated = isolated.clone();
        tokio::spawn(async move {
            loop {
                for status in reap_children() {
                    sup.handle_reaped(status).await;
                    isolated.handle_reaped(status).await;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
    };

    // A short-lived command is reaped and recorded
    let once = ProcessDefinition::new("once", "2", Action::Once, "exit 3");
    let pid = sup.start(&once).await.unwrap();
    wait_for_status(&sup, "once", ProcessStatus::Exited).await;
    let entry = sup.get("once").await.unwrap();
    assert_eq!(entry.last_exit.map(|s| s.pid), Some(pid));
    assert_eq!(entry.last_exit.and_then(|s| s.code), Some(3));

    // A long-running command is stopped by its termination signal
    let long = ProcessDefinition::new("long", "2", Action::Respawn, "sleep 30");
    sup.start(&long).await.unwrap();
    sup.stop("long").await.unwrap();
    wait_for_status(&sup, "long", ProcessStatus::Exited).await;
    assert!(sup.running().await.is_empty());

    // Every command of a line runs inside a fresh PID namespace, not only
    // the first one the shell forks
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let line = format!("/bin/true; /bin/echo second > {}", out.display());
    let twice = ProcessDefinition::new("twice", "2", Action::Once, &line);
    isolated.start(&twice).await.unwrap();
    wait_for_status(&isolated, "twice", ProcessStatus::Exited).await;
    let entry = isolated.get("twice").await.unwrap();
    assert_eq!(entry.last_exit.and_then(|s| s.code), Some(0));
    assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "second");

    // rc scripts run in name order with their action, one at a time
    let rc = dir.path().join("rc2.d");
    std::fs::create_dir(&rc).unwrap();
    let log = dir.path().join("rc.log");
    for name in ["S20second", "K10first", "notes"] {
        let script = format!("echo \"{} $1\" >> {}\n", name, log.display());
        std::fs::write(rc.join(name), script).unwrap();
    }
    let host = LinuxHost::new(&SupervisorConfig {
        rc_dir: dir.path().to_path_buf(),
        require_pid1: false,
        ..SupervisorConfig::default()
    });
    host.run_runlevel_scripts(&Runlevel::new("2").unwrap(), &sup)
        .await;
    assert_eq!(
        std::fs::read_to_string(&log).unwrap(),
        "K10first stop\nS20second start\n"
    );

    // A missing interpreter is a spawn failure
    let broken = ProcessSupervisor::new(
        Arc::new(OsSpawner::new("/nonexistent/sh")),
        IsolationProvisioner::new(IsolationSettings::disabled()),
    );
    assert!(broken.start(&once).await.is_err());
    assert_eq!(
        broken.get("once").await.unwrap().status,
        ProcessStatus::Failed
    );

    reaper.abort();
}
