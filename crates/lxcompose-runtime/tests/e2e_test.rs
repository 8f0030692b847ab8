//! End-to-end tests for the lxcompose runtime.
//!
//! The external runtime is replaced by a scripted command runner; every
//! other component works on a real temporary data directory.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::io::Read;
use std::sync::{Arc, Barrier};
use std::time::Duration;

use chrono::{Duration as TimeDelta, SubsecRound, Utc};
use lxcompose_common::config::{RetryPolicy, RuntimeConfig};
use lxcompose_common::error::{LxError, Result};
use lxcompose_common::types::{ContainerSpec, ContainerStatus, Interface, Network, Resources};
use lxcompose_runtime::command::{CommandOutput, CommandRunner, SpawnedProcess};
use lxcompose_runtime::logs::append_log;
use lxcompose_runtime::testing::ScriptedRunner;
use lxcompose_runtime::{
    CancelToken, LifecycleController, LogOptions, LogRetrieval, StateStore, TemplateService,
};

struct Harness {
    _dir: tempfile::TempDir,
    config: RuntimeConfig,
    runner: Arc<ScriptedRunner>,
    controller: Arc<LifecycleController>,
}

fn harness() -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = RuntimeConfig::with_data_dir(dir.path());
    config.retry = RetryPolicy {
        initial_interval: Duration::from_millis(1),
        multiplier: 2.0,
        max_interval: Duration::from_millis(5),
        max_elapsed: Duration::from_millis(50),
    };
    let runner = Arc::new(ScriptedRunner::new());
    let controller =
        Arc::new(LifecycleController::new(&config, runner.clone()).expect("controller"));
    Harness {
        _dir: dir,
        config,
        runner,
        controller,
    }
}

fn spec(name: &str) -> ContainerSpec {
    ContainerSpec {
        name: name.into(),
        image: "docker.io/library/debian:12".into(),
        resources: Resources {
            cpu_shares: Some(512),
            memory_limit: Some(256 << 20),
            ..Resources::default()
        },
        network: Network::single(Interface {
            static_ip: Some("10.0.3.10/24".into()),
            gateway: Some("10.0.3.1".into()),
            ..Interface::default()
        }),
        command: vec!["/usr/sbin/nginx".into(), "-g".into(), "daemon off;".into()],
        ..ContainerSpec::default()
    }
}

fn none() -> CancelToken {
    CancelToken::never()
}

// ── Lifecycle ────────────────────────────────────────────────────────

#[test]
fn create_then_get_returns_stopped_with_same_spec() {
    let h = harness();
    let created = h.controller.create(spec("web"), &none()).expect("create");
    assert_eq!(created.status, ContainerStatus::Stopped);

    let fetched = h.controller.get("web", &none()).expect("get");
    assert_eq!(fetched.status, ContainerStatus::Stopped);
    assert_eq!(fetched.spec, spec("web"));

    let layout = h.controller.layout();
    let config = std::fs::read_to_string(layout.config_path("web")).expect("config");
    assert!(config.starts_with("lxc.uts.name = web\n"));
    assert!(layout.container_dir("web").join("rootfs").is_dir());
    assert!(layout.container_dir("web").join("rootfs/.lxcompose/init.sh").is_file());
    assert!(!h.runner.programs().iter().any(|p| p == "lxc-start"));
}

#[test]
fn create_rejects_duplicates_and_invalid_specs() {
    let h = harness();
    let _ = h.controller.create(spec("web"), &none()).expect("create");
    let err = h.controller.create(spec("web"), &none()).unwrap_err();
    assert!(matches!(err, LxError::AlreadyExists { kind: "container", .. }));

    let mut bad = spec("bad");
    bad.network.interfaces[0].dhcp = true;
    let err = h.controller.create(bad, &none()).unwrap_err();
    assert!(matches!(err, LxError::Validation { .. }));
    assert!(!h.controller.exists("bad"));
    assert!(!h.controller.layout().container_dir("bad").exists());
}

#[test]
fn full_lifecycle_invokes_runtime_and_stamps_times() {
    let h = harness();
    let _ = h.controller.create(spec("web"), &none()).unwrap();

    let running = h.controller.start("web", &none()).unwrap();
    assert_eq!(running.status, ContainerStatus::Running);
    assert!(running.last_started_at.is_some());

    let frozen = h.controller.pause("web", &none()).unwrap();
    assert_eq!(frozen.status, ContainerStatus::Frozen);
    assert_eq!(frozen.last_started_at, running.last_started_at);

    let resumed = h.controller.resume("web", &none()).unwrap();
    assert_eq!(resumed.status, ContainerStatus::Running);

    let stopped = h.controller.stop("web", &none()).unwrap();
    assert_eq!(stopped.status, ContainerStatus::Stopped);
    assert!(stopped.last_stopped_at.is_some());

    h.controller.remove("web").unwrap();
    assert!(!h.controller.exists("web"));
    assert!(!h.controller.layout().container_dir("web").exists());

    assert_eq!(
        h.runner.programs(),
        ["lxc-start", "lxc-freeze", "lxc-unfreeze", "lxc-stop"]
    );
    let start = &h.runner.calls()[0];
    assert_eq!(&start.args[..2], ["-n", "web"]);
    assert!(start.args.contains(&"-d".to_string()));
}

#[test]
fn invalid_transitions_fail_without_mutating_the_record() {
    type Op = fn(&LifecycleController, &str) -> lxcompose_common::error::Result<()>;
    let ops: [(&str, Op); 5] = [
        ("start", |c, n| c.start(n, &none()).map(drop)),
        ("stop", |c, n| c.stop(n, &none()).map(drop)),
        ("pause", |c, n| c.pause(n, &none()).map(drop)),
        ("resume", |c, n| c.resume(n, &none()).map(drop)),
        ("remove", LifecycleController::remove),
    ];
    let valid = |op: &str, status: ContainerStatus| match status {
        ContainerStatus::Stopped => matches!(op, "start" | "remove"),
        ContainerStatus::Running => matches!(op, "stop" | "pause"),
        ContainerStatus::Frozen => matches!(op, "stop" | "resume"),
    };

    for status in [
        ContainerStatus::Stopped,
        ContainerStatus::Running,
        ContainerStatus::Frozen,
    ] {
        for (name, op) in &ops {
            if valid(name, status) {
                continue;
            }
            let h = harness();
            let _ = h.controller.create(spec("web"), &none()).unwrap();
            let before = h.controller.store().save("web", spec("web"), status).unwrap();

            let err = op(&h.controller, "web").unwrap_err();
            match err {
                LxError::InvalidState {
                    status: reported, ..
                } => assert_eq!(reported, status, "{name} from {status}"),
                other => panic!("{name} from {status}: unexpected {other}"),
            }
            assert_eq!(h.controller.store().get("web").unwrap(), before);
            assert!(h.runner.calls().is_empty(), "{name} from {status} ran a command");
        }
    }
}

#[test]
fn unknown_container_is_not_found() {
    let h = harness();
    assert!(matches!(
        h.controller.start("ghost", &none()),
        Err(LxError::NotFound { .. })
    ));
    assert!(matches!(
        h.controller.get("ghost", &none()),
        Err(LxError::NotFound { .. })
    ));
    assert!(matches!(
        h.controller.update(spec("ghost"), &none()),
        Err(LxError::NotFound { .. })
    ));
}

#[test]
fn get_reconciles_with_runtime_without_writing() {
    let h = harness();
    let _ = h.controller.create(spec("web"), &none()).unwrap();
    h.runner.push(
        "lxc-info",
        CommandOutput::ok("Name:           web\nState:          running\nPID:            4242\n"),
    );

    let fetched = h.controller.get("web", &none()).unwrap();
    assert_eq!(fetched.status, ContainerStatus::Running);
    assert_eq!(
        h.controller.store().get("web").unwrap().status,
        ContainerStatus::Stopped
    );

    h.runner.push("lxc-info", CommandOutput::ok("State: STARTING\n"));
    assert_eq!(
        h.controller.get("web", &none()).unwrap().status,
        ContainerStatus::Stopped
    );

    h.runner.push("lxc-info", CommandOutput::failed(1, "lxc-info: no such container"));
    assert_eq!(
        h.controller.get("web", &none()).unwrap().status,
        ContainerStatus::Stopped
    );
}

#[test]
fn runtime_exit_codes_are_classified() {
    let h = harness();
    let _ = h.controller.create(spec("web"), &none()).unwrap();
    let _ = h.controller.start("web", &none()).unwrap();

    h.runner.push("lxc-freeze", CommandOutput::failed(2, "not running"));
    let err = h.controller.pause("web", &none()).unwrap_err();
    assert!(matches!(err, LxError::InvalidState { operation: "pause", .. }), "{err}");

    h.runner.push("lxc-stop", CommandOutput::failed(1, "cgroup busy"));
    match h.controller.stop("web", &none()).unwrap_err() {
        LxError::Runtime {
            name, exit_code, output, ..
        } => {
            assert_eq!(name, "web");
            assert_eq!(exit_code, 1);
            assert!(output.contains("cgroup busy"));
        }
        other => panic!("unexpected {other}"),
    }
    assert_eq!(
        h.controller.store().get("web").unwrap().status,
        ContainerStatus::Running
    );
}

#[test]
fn restart_from_running_stops_then_starts() {
    let h = harness();
    let _ = h.controller.create(spec("web"), &none()).unwrap();
    let _ = h.controller.start("web", &none()).unwrap();

    let restarted = h.controller.restart("web", &none()).unwrap();
    assert_eq!(restarted.status, ContainerStatus::Running);
    assert!(restarted.last_stopped_at.is_some());
    assert_eq!(h.runner.programs(), ["lxc-start", "lxc-stop", "lxc-start"]);
}

#[test]
fn restart_from_stopped_only_starts() {
    let h = harness();
    let _ = h.controller.create(spec("web"), &none()).unwrap();
    let _ = h.controller.restart("web", &none()).unwrap();
    assert_eq!(h.runner.programs(), ["lxc-start"]);
}

#[test]
fn restart_reports_the_failing_step() {
    let h = harness();
    let _ = h.controller.create(spec("web"), &none()).unwrap();
    let _ = h.controller.start("web", &none()).unwrap();
    h.runner.push("lxc-start", CommandOutput::failed(1, "no rootfs"));

    let err = h.controller.restart("web", &none()).unwrap_err();
    assert!(
        matches!(err, LxError::Step { operation: "restart", step: "start", .. }),
        "{err}"
    );
    assert_eq!(
        h.controller.store().get("web").unwrap().status,
        ContainerStatus::Stopped
    );

    let _ = h.controller.start("web", &none()).unwrap();
    h.runner.push("lxc-stop", CommandOutput::failed(1, "timeout"));
    let err = h.controller.restart("web", &none()).unwrap_err();
    assert!(matches!(err, LxError::Step { step: "stop", .. }), "{err}");
    assert_eq!(
        h.runner.programs().iter().filter(|p| *p == "lxc-start").count(),
        3,
        "start must not run after a failed stop"
    );
}

#[test]
fn update_regenerates_config_and_keeps_status() {
    let h = harness();
    let _ = h.controller.create(spec("web"), &none()).unwrap();
    let _ = h.controller.start("web", &none()).unwrap();

    let mut changed = spec("web");
    changed.command.clear();
    changed.resources.memory_limit = Some(1 << 30);
    let updated = h.controller.update(changed.clone(), &none()).unwrap();
    assert_eq!(updated.status, ContainerStatus::Running);
    assert_eq!(updated.spec, changed);

    let layout = h.controller.layout();
    let config = std::fs::read_to_string(layout.config_path("web")).unwrap();
    assert!(config.contains("lxc.cgroup.memory.limit_in_bytes = 1073741824\n"));
    assert!(!config.contains("lxc.init.cmd"));
    assert!(!layout.container_dir("web").join("rootfs/.lxcompose").exists());
}

#[test]
fn controller_reloads_persisted_state() {
    let h = harness();
    let _ = h.controller.create(spec("web"), &none()).unwrap();
    let _ = h.controller.start("web", &none()).unwrap();

    let reopened = LifecycleController::new(&h.config, h.runner.clone()).unwrap();
    let records = reopened.list();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, ContainerStatus::Running);
}

#[test]
fn cancelled_token_aborts_the_transition() {
    let h = harness();
    let _ = h.controller.create(spec("web"), &none()).unwrap();
    let token = CancelToken::new();
    token.cancel();
    let err = h.controller.start("web", &token).unwrap_err();
    assert!(matches!(err, LxError::Cancelled { .. }), "{err}");
}

/// Runner whose `lxc-start` takes long enough for another operation to
/// interleave with it.
struct SlowStart(ScriptedRunner);

impl CommandRunner for SlowStart {
    fn run(&self, program: &str, args: &[String], cancel: &CancelToken) -> Result<CommandOutput> {
        if program == "lxc-start" {
            std::thread::sleep(Duration::from_millis(40));
        }
        self.0.run(program, args, cancel)
    }

    fn spawn(&self, program: &str, args: &[String]) -> Result<SpawnedProcess> {
        self.0.spawn(program, args)
    }
}

#[test]
fn update_racing_start_keeps_both_changes() {
    let h = harness();
    let controller =
        LifecycleController::new(&h.config, Arc::new(SlowStart(ScriptedRunner::new()))).unwrap();

    for round in 0..4 {
        let name = format!("race{round}");
        let _ = controller.create(spec(&name), &none()).unwrap();
        let mut changed = spec(&name);
        changed.image = format!("docker.io/library/alpine:3.{round}");
        let barrier = Barrier::new(2);

        std::thread::scope(|s| {
            let _ = s.spawn(|| {
                let _ = barrier.wait();
                let _ = controller.start(&name, &none()).unwrap();
            });
            let _ = s.spawn(|| {
                let _ = barrier.wait();
                std::thread::sleep(Duration::from_millis(5));
                let _ = controller.update(changed.clone(), &none()).unwrap();
            });
        });

        let record = controller.store().get(&name).unwrap();
        assert_eq!(record.status, ContainerStatus::Running, "round {round}");
        assert_eq!(record.spec, changed, "round {round}");
    }
}

// ── State Store ──────────────────────────────────────────────────────

#[test]
fn concurrent_saves_never_corrupt_records() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(dir.path(), RetryPolicy::default()).unwrap();
    let statuses = [
        ContainerStatus::Running,
        ContainerStatus::Frozen,
        ContainerStatus::Stopped,
    ];

    std::thread::scope(|s| {
        for name in ["alpha", "beta", "gamma", "delta"] {
            let store = &store;
            let _ = s.spawn(move || {
                for i in 0..60 {
                    let mut spec = spec(name);
                    spec.resources.cpu_shares = Some(i);
                    let _ = store.save(name, spec, statuses[usize::try_from(i % 3).unwrap()]).unwrap();
                    let _ = store.list();
                }
            });
        }
    });

    let reloaded = StateStore::open(dir.path(), RetryPolicy::default()).unwrap();
    let records = reloaded.list();
    assert_eq!(records.len(), 4);
    for record in records {
        assert_eq!(record.spec.name, record.name);
        assert_eq!(record.spec.resources.cpu_shares, Some(59));
        assert_eq!(record.status, statuses[59 % 3]);
        assert_eq!(record, store.get(&record.name).unwrap());
    }
}

// ── Log Retrieval ────────────────────────────────────────────────────

fn read_all(mut stream: impl Read) -> String {
    let mut out = String::new();
    let _ = stream.read_to_string(&mut out).unwrap();
    out
}

#[test]
fn logs_since_keeps_later_lines_in_order() {
    let h = harness();
    let _ = h.controller.create(spec("web"), &none()).unwrap();
    let logs = LogRetrieval::new(&h.config, h.controller.store().clone(), h.runner.clone());
    let now = Utc::now().trunc_subsecs(0);
    let path = logs.log_path("web");
    append_log(&path, now - TimeDelta::hours(2), "two hours ago").unwrap();
    append_log(&path, now - TimeDelta::hours(1), "one hour ago").unwrap();
    append_log(&path, now, "now").unwrap();

    let opts = LogOptions {
        since: Some(now - TimeDelta::minutes(90)),
        timestamps: false,
        ..LogOptions::default()
    };
    let stream = logs.get_logs("web", &opts).unwrap();
    assert!(!stream.is_following());
    assert_eq!(read_all(stream), "one hour ago\nnow\n");
}

#[test]
fn logs_tail_returns_last_lines() {
    let h = harness();
    let _ = h.controller.create(spec("web"), &none()).unwrap();
    let logs = LogRetrieval::new(&h.config, h.controller.store().clone(), h.runner.clone());
    std::fs::write(logs.log_path("web"), "first\nsecond\nthird\n").unwrap();

    let opts = LogOptions {
        tail: 2,
        ..LogOptions::default()
    };
    assert_eq!(read_all(logs.get_logs("web", &opts).unwrap()), "second\nthird\n");
    assert_eq!(
        read_all(logs.get_logs("web", &LogOptions::default()).unwrap()),
        "first\nsecond\nthird\n"
    );
}

#[test]
fn logs_for_unknown_container_fail_before_io() {
    let h = harness();
    let logs = LogRetrieval::new(&h.config, h.controller.store().clone(), h.runner.clone());
    let opts = LogOptions {
        follow: true,
        ..LogOptions::default()
    };
    assert!(matches!(
        logs.get_logs("ghost", &opts),
        Err(LxError::NotFound { .. })
    ));
    assert_eq!(h.runner.spawned(), 0);
}

#[test]
fn follow_streams_new_lines_and_close_terminates() {
    let h = harness();
    let _ = h.controller.create(spec("web"), &none()).unwrap();
    let logs = LogRetrieval::new(&h.config, h.controller.store().clone(), h.runner.clone());
    std::fs::write(logs.log_path("web"), "[2024-05-01T10:00:00Z] booted\n").unwrap();
    h.runner
        .set_follow_output("[2024-05-01T10:00:05Z] request 1\n[2024-05-01T10:00:06Z] request 2\n");

    let opts = LogOptions {
        follow: true,
        timestamps: false,
        ..LogOptions::default()
    };
    let mut stream = logs.get_logs("web", &opts).unwrap();
    assert!(stream.is_following());
    let mut out = String::new();
    let _ = stream.read_to_string(&mut out).unwrap();
    assert_eq!(out, "booted\nrequest 1\nrequest 2\n");

    stream.close().unwrap();
    assert_eq!(h.runner.spawned(), 1);
    assert_eq!(h.runner.terminated(), 1);
}

#[test]
fn dropping_a_follow_stream_terminates_the_process() {
    let h = harness();
    let _ = h.controller.create(spec("web"), &none()).unwrap();
    let logs = LogRetrieval::new(&h.config, h.controller.store().clone(), h.runner.clone());
    let opts = LogOptions {
        follow: true,
        ..LogOptions::default()
    };
    drop(logs.get_logs("web", &opts).unwrap());
    assert_eq!(h.runner.terminated(), 1);
}

// ── Templates ────────────────────────────────────────────────────────

#[test]
fn template_without_overrides_reproduces_base_spec() {
    let h = harness();
    let templates = TemplateService::new(h.controller.clone());
    let _ = h.controller.create(spec("web"), &none()).unwrap();
    let extra = h.controller.layout().container_dir("web").join("notes.txt");
    std::fs::write(&extra, "keep me").unwrap();

    let captured = templates.create_template("web", "base", "nginx base").unwrap();
    assert_eq!(captured.base_spec, spec("web"));
    assert_eq!(captured.source, "web");

    let created = templates
        .create_from_template("base", "web2", &ContainerSpec::default(), &none())
        .unwrap();
    let expected = ContainerSpec {
        name: "web2".into(),
        ..captured.base_spec.clone()
    };
    assert_eq!(created.spec, expected);
    assert_eq!(h.controller.get("web2", &none()).unwrap().spec, expected);

    let dir = h.controller.layout().container_dir("web2");
    assert_eq!(std::fs::read_to_string(dir.join("notes.txt")).unwrap(), "keep me");
    let config = std::fs::read_to_string(dir.join("config")).unwrap();
    assert!(config.starts_with("lxc.uts.name = web2\n"));
}

#[test]
fn template_single_override_changes_only_that_field() {
    let h = harness();
    let templates = TemplateService::new(h.controller.clone());
    let _ = h.controller.create(spec("web"), &none()).unwrap();
    let _ = templates.create_template("web", "base", "").unwrap();

    let overrides = ContainerSpec {
        image: "docker.io/library/debian:13".into(),
        ..ContainerSpec::default()
    };
    let created = templates
        .create_from_template("base", "web2", &overrides, &none())
        .unwrap();
    assert_eq!(
        created.spec,
        ContainerSpec {
            name: "web2".into(),
            image: "docker.io/library/debian:13".into(),
            ..spec("web")
        }
    );
}

#[test]
fn template_management_errors_and_listing() {
    let h = harness();
    let templates = TemplateService::new(h.controller.clone());
    assert!(matches!(
        templates.create_template("ghost", "base", ""),
        Err(LxError::NotFound { kind: "container", .. })
    ));

    let _ = h.controller.create(spec("web"), &none()).unwrap();
    let _ = templates.create_template("web", "base", "").unwrap();
    let _ = templates.create_template("web", "other", "").unwrap();
    assert!(matches!(
        templates.create_template("web", "base", ""),
        Err(LxError::AlreadyExists { kind: "template", .. })
    ));
    assert!(matches!(
        templates.create_from_template("base", "web", &ContainerSpec::default(), &none()),
        Err(LxError::AlreadyExists { kind: "container", .. })
    ));
    assert!(matches!(
        templates.create_from_template("nope", "web3", &ContainerSpec::default(), &none()),
        Err(LxError::NotFound { kind: "template", .. })
    ));

    let names: Vec<_> = templates
        .list_templates()
        .unwrap()
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert_eq!(names, ["base", "other"]);

    let _ = templates
        .create_from_template("base", "web2", &ContainerSpec::default(), &none())
        .unwrap();
    templates.delete_template("base").unwrap();
    assert!(matches!(
        templates.get_template("base"),
        Err(LxError::NotFound { .. })
    ));
    assert!(h.controller.exists("web2"));

    h.controller.remove("web").unwrap();
    assert!(templates.get_template("other").is_ok());
}
