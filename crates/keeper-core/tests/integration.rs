use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use keeper_core::*;

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

fn temp_dir(name: &str) -> PathBuf {
	let n = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
	let dir = std::env::temp_dir().join(format!("keeper-test-{}-{}-{}", std::process::id(), n, name));
	let _ = std::fs::create_dir_all(&dir);
	dir
}

fn sh(name: &str, script: &str) -> JobSpec {
	let mut spec = JobSpec::new(name, "/bin/sh");
	spec.args = vec!["-c".into(), script.into()];
	spec
}

fn config(min_uptime: Duration) -> SupervisorConfig {
	SupervisorConfig {
		min_uptime,
		kill_grace: Duration::from_secs(1),
		output_lines: 100,
		stats_probe: StatsProbe::Sysinfo,
		persist_dir: Some(temp_dir("persist")),
	}
}

fn supervisor(min_uptime: Duration) -> Arc<Supervisor> {
	Supervisor::new(Registry::new(), config(min_uptime))
}

async fn finished(lineage: Lineage) -> Result<LineageEnd> {
	tokio::time::timeout(Duration::from_secs(10), lineage.handle)
		.await
		.expect("lineage did not finish")
		.expect("lineage task panicked")
}

async fn eventually<F, Fut>(mut check: F)
where
	F: FnMut() -> Fut,
	Fut: std::future::Future<Output = bool>,
{
	for _ in 0..100 {
		if check().await {
			return;
		}
		tokio::time::sleep(Duration::from_millis(50)).await;
	}
	panic!("condition not reached within 5s");
}

struct SharedJobs(Mutex<Vec<JobSpec>>);

impl JobSource for SharedJobs {
	fn load(&self) -> Result<Vec<JobSpec>> {
		Ok(self.0.lock().unwrap().clone())
	}
}

fn detached_pid(reply: &str) -> i32 {
	reply
		.trim_end_matches(')')
		.rsplit(' ')
		.next()
		.unwrap()
		.parse()
		.unwrap()
}

/// Pids appended to `file` by `echo $$ >> file` in a job script.
fn recorded_pids(file: &std::path::Path) -> Vec<i32> {
	std::fs::read_to_string(file)
		.unwrap_or_default()
		.lines()
		.filter_map(|line| line.trim().parse().ok())
		.collect()
}

// --- ProcessRecord lifecycle ---

#[tokio::test]
async fn spawn_registers_alive_record() {
	let sup = supervisor(Duration::from_secs(10));
	let lineage = sup.start(Arc::new(sh("sleeper", "sleep 30")), 0).await.unwrap();

	assert!(lineage.record.pid() > 0);
	assert!(lineage.record.is_alive());
	assert_eq!(lineage.record.working_dir(), std::path::Path::new("/bin"));
	let found = sup.registry().get(lineage.record.pid()).await.unwrap();
	assert!(Arc::ptr_eq(&found, &lineage.record));

	lineage.record.terminate(Duration::from_secs(1)).unwrap();
	assert_eq!(finished(lineage).await.unwrap(), LineageEnd::Stopped);
	assert!(sup.registry().is_empty().await);
}

#[tokio::test]
async fn spawn_missing_executable_fails() {
	let sup = supervisor(Duration::from_secs(10));
	let err = sup
		.start(Arc::new(JobSpec::new("ghost", "/nonexistent/keeper-ghost")), 0)
		.await
		.err()
		.unwrap();
	assert_eq!(err.as_label(), "spawn_failed");
	assert!(err.to_string().contains("ghost"));
	assert!(sup.registry().is_empty().await);
}

#[tokio::test]
async fn env_reaches_child() {
	let sup = supervisor(Duration::from_secs(10));
	let mut spec = sh("env", "echo $KEEPER_GREETING");
	spec.env.insert("KEEPER_GREETING".into(), "hello".into());
	let lineage = sup.start(Arc::new(spec), 0).await.unwrap();
	let record = lineage.record.clone();

	assert_eq!(finished(lineage).await.unwrap(), LineageEnd::Exited);
	eventually(|| {
		let record = record.clone();
		async move { record.read_output(Stream::Stdout).await == vec!["hello"] }
	})
	.await;
}

// --- Output capture ---

#[tokio::test]
async fn output_is_captured_per_stream_in_order() {
	let sup = supervisor(Duration::from_secs(10));
	let script = "for i in 1 2 3 4 5; do echo out$i; echo err$i >&2; done";
	let lineage = sup.start(Arc::new(sh("chatty", script)), 0).await.unwrap();
	let record = lineage.record.clone();

	assert_eq!(finished(lineage).await.unwrap(), LineageEnd::Exited);
	assert!(!record.is_alive());
	assert!(sup.registry().is_empty().await);

	eventually(|| {
		let record = record.clone();
		async move { record.read_output(Stream::Stderr).await.len() == 5 }
	})
	.await;
	eventually(|| {
		let record = record.clone();
		async move { record.read_output(Stream::Stdout).await.len() == 5 }
	})
	.await;
	assert_eq!(
		record.read_output(Stream::Stdout).await,
		vec!["out1", "out2", "out3", "out4", "out5"]
	);
	assert_eq!(
		record.read_output(Stream::Stderr).await,
		vec!["err1", "err2", "err3", "err4", "err5"]
	);
}

#[tokio::test]
async fn clear_output_persists_to_dated_file() {
	let sup = supervisor(Duration::from_secs(10));
	let lineage = sup.start(Arc::new(sh("saver", "echo kept")), 0).await.unwrap();
	let record = lineage.record.clone();
	finished(lineage).await.unwrap();
	eventually(|| {
		let record = record.clone();
		async move { !record.read_output(Stream::Stdout).await.is_empty() }
	})
	.await;

	record.clear_output(Stream::Stdout, true).await;
	assert!(record.read_output(Stream::Stdout).await.is_empty());

	let dir = sup.config().persist_dir.clone().unwrap();
	let saved: Vec<_> = std::fs::read_dir(&dir).unwrap().flatten().collect();
	assert_eq!(saved.len(), 1);
	let name = saved[0].file_name().to_string_lossy().into_owned();
	assert!(name.starts_with("saver "));
	assert!(name.ends_with(".stdout.json"));
	let contents = std::fs::read_to_string(saved[0].path()).unwrap();
	assert_eq!(contents.trim(), r#"["kept"]"#);
}

// --- Supervisor loop ---

#[tokio::test]
async fn fast_crash_is_flapping_and_not_restarted() {
	let sup = supervisor(Duration::from_secs(10));
	let mut spec = sh("crasher", "exit 1");
	spec.restart = true;
	let lineage = sup.start(Arc::new(spec), 0).await.unwrap();
	let pid = lineage.record.pid();

	assert_eq!(finished(lineage).await.unwrap(), LineageEnd::Flapping);
	let records = sup.registry().list().await;
	assert_eq!(records.len(), 1);
	assert_eq!(records[0].pid(), pid);
	assert!(!records[0].is_alive());
	assert_eq!(records[0].restart_attempt(), 0);
}

#[tokio::test]
async fn crash_after_min_uptime_restarts_once_with_next_attempt() {
	let dir = temp_dir("restart-once");
	let marker = dir.join("ran-once");
	let script = format!(
		"if [ -f '{m}' ]; then exit 1; fi; touch '{m}'; sleep 0.5; exit 1",
		m = marker.display()
	);
	let sup = supervisor(Duration::from_millis(200));
	let mut spec = sh("phoenix", &script);
	spec.restart = true;
	let lineage = sup.start(Arc::new(spec), 0).await.unwrap();
	let first_pid = lineage.record.pid();

	// Second attempt exits immediately and trips the guard.
	assert_eq!(finished(lineage).await.unwrap(), LineageEnd::Flapping);
	let records = sup.registry().list().await;
	assert_eq!(records.len(), 1);
	assert_ne!(records[0].pid(), first_pid);
	assert_eq!(records[0].restart_attempt(), 1);
	assert!(!records[0].is_alive());
}

#[tokio::test]
async fn restart_spawn_failure_ends_lineage_with_error() {
	let dir = temp_dir("vanishing");
	let shell = dir.join("vanishing-sh");
	std::os::unix::fs::symlink("/bin/sh", &shell).unwrap();
	let mut spec = JobSpec::new("vanishing", shell.clone());
	spec.args = vec!["-c".into(), "sleep 0.5; exit 1".into()];
	spec.restart = true;

	let sup = supervisor(Duration::from_millis(100));
	let lineage = sup.start(Arc::new(spec), 0).await.unwrap();
	std::fs::remove_file(&shell).unwrap();

	let err = finished(lineage).await.unwrap_err();
	assert_eq!(err.as_label(), "spawn_failed");
	assert!(sup.registry().is_empty().await);
}

#[tokio::test]
async fn kill_twice_never_restarts() {
	let sup = supervisor(Duration::from_millis(0));
	let mut spec = sh("stubborn", "sleep 30");
	spec.restart = true;
	let lineage = sup.start(Arc::new(spec), 0).await.unwrap();
	let control = ControlPlane::new(sup.clone(), Arc::new(Vec::<JobSpec>::new()));
	let pid = lineage.record.pid();

	assert_eq!(control.kill(pid).await.unwrap(), format!("{} killed", pid));
	let _ = control.kill(pid).await;
	assert!(lineage.record.kill_requested());

	assert_eq!(finished(lineage).await.unwrap(), LineageEnd::Stopped);
	tokio::time::sleep(Duration::from_millis(200)).await;
	assert!(sup.registry().is_empty().await);
	assert!(control.kill(pid).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn terminate_exited_record_fails() {
	let sup = supervisor(Duration::from_secs(10));
	let lineage = sup.start(Arc::new(sh("brief", "true")), 0).await.unwrap();
	let record = lineage.record.clone();
	finished(lineage).await.unwrap();

	let err = record.terminate(Duration::from_secs(1)).unwrap_err();
	assert_eq!(err.as_label(), "termination_failed");
	assert!(record.kill_requested());
}

#[tokio::test]
async fn sigterm_ignoring_child_is_killed_after_grace() {
	let sup = supervisor(Duration::from_secs(10));
	let lineage = sup
		.start(Arc::new(sh("deaf", "trap '' TERM; while true; do sleep 0.1; done")), 0)
		.await
		.unwrap();
	tokio::time::sleep(Duration::from_millis(200)).await;

	lineage.record.terminate(Duration::from_millis(300)).unwrap();
	assert_eq!(finished(lineage).await.unwrap(), LineageEnd::Stopped);
}

// --- Detach ---

#[tokio::test]
async fn detach_removes_record_and_leaves_unsupervised_copy() {
	use nix::sys::signal::{kill, killpg, Signal};
	use nix::unistd::Pid;

	let sup = supervisor(Duration::from_millis(0));
	let mut spec = sh("loner", "sleep 30");
	spec.restart = true;
	let lineage = sup.start(Arc::new(spec), 0).await.unwrap();
	let record = lineage.record.clone();

	let copy = record.detach(sup.registry(), Duration::from_secs(1)).await.unwrap();
	assert!(record.is_detached());
	assert!(copy > 0);
	assert_ne!(copy, record.pid());

	assert_eq!(finished(lineage).await.unwrap(), LineageEnd::Detached);
	assert!(sup.registry().get(record.pid()).await.is_err());
	assert!(sup.registry().is_empty().await);
	assert!(kill(Pid::from_raw(copy as i32), None).is_ok());

	let _ = killpg(Pid::from_raw(copy as i32), Signal::SIGKILL);
}

// --- Control plane ---

fn exposed(name: &str, script: &str) -> JobSpec {
	let mut spec = sh(name, script);
	spec.stats = true;
	spec.stdout = true;
	spec.stderr = true;
	spec
}

#[tokio::test]
async fn control_reports_not_found_and_forbidden() {
	let sup = supervisor(Duration::from_secs(10));
	let control = ControlPlane::new(sup.clone(), Arc::new(vec![sh("quiet", "sleep 30")]));
	assert_eq!(control.launch_all().await.unwrap(), 1);
	let pid = control.status_by_name("quiet").await.unwrap().pid;

	assert!(control.stats(pid).await.unwrap_err().is_forbidden());
	assert!(control.read_output(pid, Stream::Stdout).await.unwrap_err().is_forbidden());
	assert!(control.read_output(pid, Stream::Stderr).await.unwrap_err().is_forbidden());
	assert!(control.stats(1).await.unwrap_err().is_not_found());

	for err in [
		control.stop_by_name("missing").await.unwrap_err(),
		control.start_by_name("missing").await.unwrap_err(),
		control.restart_by_name("missing").await.unwrap_err(),
		control.detach_by_name("missing").await.unwrap_err(),
		control.status_by_name("missing").await.unwrap_err(),
	] {
		assert_eq!(err.to_string(), NO_SUCH_PROCESS);
	}

	control.shutdown(false).await;
}

#[tokio::test]
async fn control_stats_and_output_when_exposed() {
	let sup = supervisor(Duration::from_secs(10));
	let control = ControlPlane::new(sup.clone(), Arc::new(vec![exposed("open", "echo ready; sleep 30")]));
	control.launch_all().await.unwrap();
	let pid = control.list_all().await[0].pid;

	let sample = control.stats(pid).await.unwrap();
	assert!(sample.cpu_percent >= 0.0);

	eventually(|| {
		let control = &control;
		async move { control.read_output(pid, Stream::Stdout).await.unwrap() == vec!["ready"] }
	})
	.await;
	assert_eq!(control.clear_output(pid, Stream::Stdout, false).await.unwrap(), "stdout cleared");
	assert!(control.read_output(pid, Stream::Stdout).await.unwrap().is_empty());

	control.shutdown(false).await;
}

#[tokio::test]
async fn control_start_stop_restart_by_name() {
	let sup = supervisor(Duration::from_secs(10));
	let control = ControlPlane::new(sup.clone(), Arc::new(vec![sh("api", "sleep 30")]));
	control.launch_all().await.unwrap();
	let first = control.status_by_name("api").await.unwrap();
	assert!(first.alive);
	assert_eq!(first.restart_attempt, 0);

	assert_eq!(control.start_by_name("api").await.unwrap(), "process already running");

	assert_eq!(control.restart_by_name("api").await.unwrap(), "successfully restarted");
	let second = control.status_by_name("api").await.unwrap();
	assert_ne!(second.pid, first.pid);
	assert_eq!(second.restart_attempt, 1);
	assert_eq!(control.list_all().await.len(), 1);

	assert_eq!(control.stop_by_name("api").await.unwrap(), "successfully stopped");
	assert!(control.list_all().await.is_empty());

	// Known job, no record: start launches a fresh lineage.
	assert_eq!(control.start_by_name("api").await.unwrap(), "successfully started");
	let third = control.status_by_name("api").await.unwrap();
	assert!(third.alive);

	assert_eq!(control.restart_pid(third.pid).await.unwrap(), "successfully restarted");
	control.shutdown(false).await;
	assert!(control.list_all().await.is_empty());
}

#[tokio::test]
async fn control_start_revives_flapping_job_keeping_counter() {
	let dir = temp_dir("revive");
	let marker = dir.join("crashed");
	let script = format!(
		"if [ -f '{m}' ]; then sleep 30; fi; touch '{m}'; exit 1",
		m = marker.display()
	);
	let mut spec = sh("flaky", &script);
	spec.restart = true;

	let sup = supervisor(Duration::from_secs(10));
	let control = ControlPlane::new(sup.clone(), Arc::new(vec![spec]));
	control.launch_all().await.unwrap();
	eventually(|| {
		let control = &control;
		async move { !control.status_by_name("flaky").await.unwrap().alive }
	})
	.await;

	assert_eq!(control.start_by_name("flaky").await.unwrap(), "successfully started");
	let revived = control.status_by_name("flaky").await.unwrap();
	assert!(revived.alive);
	assert_eq!(revived.restart_attempt, 0);
	assert_eq!(control.list_all().await.len(), 1);

	control.shutdown(false).await;
}

#[tokio::test]
async fn control_start_pid_revives_flapping_record() {
	let dir = temp_dir("revive-pid");
	let marker = dir.join("crashed");
	let script = format!(
		"if [ -f '{m}' ]; then sleep 30; fi; touch '{m}'; exit 1",
		m = marker.display()
	);
	let mut spec = sh("flaky", &script);
	spec.restart = true;

	let sup = supervisor(Duration::from_secs(10));
	let control = ControlPlane::new(sup.clone(), Arc::new(vec![spec]));
	control.launch_all().await.unwrap();
	eventually(|| {
		let control = &control;
		async move { !control.status_by_name("flaky").await.unwrap().alive }
	})
	.await;
	let dead = control.status_by_name("flaky").await.unwrap().pid;

	assert_eq!(control.start_pid(dead).await.unwrap(), "successfully started");
	let revived = control.status_by_name("flaky").await.unwrap();
	assert!(revived.alive);
	assert_ne!(revived.pid, dead);
	assert!(control.kill(dead).await.unwrap_err().is_not_found());

	assert_eq!(control.start_pid(revived.pid).await.unwrap(), "process already running");
	assert_eq!(control.list_all().await.len(), 1);

	control.shutdown(false).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_starts_launch_one_lineage() {
	let sup = supervisor(Duration::from_secs(10));
	let control = Arc::new(ControlPlane::new(sup.clone(), Arc::new(vec![sh("api", "sleep 30")])));

	for _ in 0..5 {
		let handles: Vec<_> = (0..8)
			.map(|_| {
				let control = Arc::clone(&control);
				tokio::spawn(async move { control.start_by_name("api").await.unwrap() })
			})
			.collect();
		let mut replies = Vec::new();
		for handle in handles {
			replies.push(handle.await.unwrap());
		}

		let started = replies.iter().filter(|r| *r == "successfully started").count();
		let running = replies.iter().filter(|r| *r == "process already running").count();
		assert_eq!((started, running), (1, 7), "{:?}", replies);

		let records = sup.registry().list().await;
		assert_eq!(records.len(), 1);
		assert!(records[0].is_alive());

		assert_eq!(control.stop_by_name("api").await.unwrap(), "successfully stopped");
		assert!(control.list_all().await.is_empty());
	}
}

#[tokio::test]
async fn control_detach_pid() {
	use nix::sys::signal::{kill, killpg, Signal};
	use nix::unistd::Pid;

	let sup = supervisor(Duration::from_secs(10));
	let mut spec = sh("loose", "sleep 30");
	spec.restart = true;
	let control = ControlPlane::new(sup.clone(), Arc::new(vec![spec]));
	control.launch_all().await.unwrap();
	let pid = control.status_by_name("loose").await.unwrap().pid;

	let reply = control.detach_pid(pid).await.unwrap();
	let copy = detached_pid(&reply);
	assert_eq!(reply, format!("successfully detached (pid {})", copy));
	assert_ne!(copy, pid as i32);
	assert!(control.list_all().await.is_empty());
	assert!(kill(Pid::from_raw(copy), None).is_ok());
	assert!(control.detach_pid(pid).await.unwrap_err().is_not_found());

	let _ = killpg(Pid::from_raw(copy), Signal::SIGKILL);
}

#[tokio::test]
async fn control_detach_by_name() {
	use nix::sys::signal::{killpg, Signal};
	use nix::unistd::Pid;

	let sup = supervisor(Duration::from_secs(10));
	let control = ControlPlane::new(sup.clone(), Arc::new(vec![sh("free", "sleep 30")]));
	control.launch_all().await.unwrap();

	let reply = control.detach_by_name("free").await.unwrap();
	assert!(reply.starts_with("successfully detached"));
	assert!(control.list_all().await.is_empty());
	assert_eq!(control.status_by_name("free").await.unwrap_err().to_string(), NO_SUCH_PROCESS);

	let _ = killpg(Pid::from_raw(detached_pid(&reply)), Signal::SIGKILL);
}

#[tokio::test]
async fn control_reload_picks_up_new_jobs() {
	let jobs = Arc::new(SharedJobs(Mutex::new(vec![sh("old", "sleep 30")])));
	let sup = supervisor(Duration::from_secs(10));
	let control = ControlPlane::new(sup.clone(), jobs.clone());
	control.launch_all().await.unwrap();
	let old_pid = control.status_by_name("old").await.unwrap().pid;

	*jobs.0.lock().unwrap() = vec![sh("new", "sleep 30")];
	assert_eq!(control.reload().await.unwrap(), "successfully reloaded");

	let names: Vec<_> = control.list_all().await.into_iter().map(|s| s.name).collect();
	assert_eq!(names, vec!["new"]);
	assert!(control.kill(old_pid).await.unwrap_err().is_not_found());

	control.shutdown(false).await;
}

#[tokio::test]
async fn control_shutdown_kills_all_and_signals() {
	let sup = supervisor(Duration::from_secs(10));
	let control = ControlPlane::new(
		sup.clone(),
		Arc::new(vec![sh("one", "sleep 30"), sh("two", "sleep 30")]),
	);
	assert_eq!(control.launch_all().await.unwrap(), 2);
	let mut shutdown = control.subscribe_shutdown();
	assert!(!*shutdown.borrow());

	let reply = control.shutdown(false).await;
	assert!(reply.starts_with("killed all"));
	assert!(control.list_all().await.is_empty());
	shutdown.changed().await.unwrap();
	assert!(*shutdown.borrow());
}

#[tokio::test]
async fn control_shutdown_detaching_drops_flapping_records() {
	use nix::sys::signal::{kill, killpg, Signal};
	use nix::unistd::Pid;

	let dir = temp_dir("shutdown-detach");
	let live_pids = dir.join("live.pids");
	let flap_pids = dir.join("flap.pids");
	let mut flap = sh("flap", &format!("echo $$ >> '{}'; exit 1", flap_pids.display()));
	flap.restart = true;
	let live = sh("live", &format!("echo $$ >> '{}'; exec sleep 30", live_pids.display()));

	let sup = supervisor(Duration::from_secs(10));
	let control = ControlPlane::new(sup.clone(), Arc::new(vec![flap, live]));
	assert_eq!(control.launch_all().await.unwrap(), 2);
	eventually(|| {
		let control = &control;
		async move { !control.status_by_name("flap").await.unwrap().alive }
	})
	.await;
	let live_record = sup.registry().find_by_name("live").await.unwrap();
	let flap_record = sup.registry().find_by_name("flap").await.unwrap();

	assert_eq!(control.shutdown(true).await, "detached all processes, shutting down");
	assert!(control.list_all().await.is_empty());
	assert!(*control.subscribe_shutdown().borrow());
	assert!(live_record.is_detached());
	assert!(!flap_record.is_detached());

	// The live job was relaunched once, unsupervised; the flapping one was not.
	eventually(|| {
		let live_pids = live_pids.clone();
		async move { recorded_pids(&live_pids).len() == 2 }
	})
	.await;
	tokio::time::sleep(Duration::from_millis(200)).await;
	assert_eq!(recorded_pids(&flap_pids).len(), 1);

	let copy = recorded_pids(&live_pids)[1];
	assert!(kill(Pid::from_raw(copy), None).is_ok());
	let _ = killpg(Pid::from_raw(copy), Signal::SIGKILL);
}

#[tokio::test]
async fn control_daemon_log() {
	let dir = temp_dir("daemon-log");
	let log = dir.join("daemon.log");
	std::fs::write(&log, "line one\nline two\n").unwrap();

	let control = ControlPlane::new(supervisor(Duration::from_secs(10)), Arc::new(Vec::<JobSpec>::new()))
		.with_log_path(&log);
	assert_eq!(control.ping(), "pong");
	assert_eq!(control.read_log().await.unwrap(), "line one\nline two\n");
	assert_eq!(control.clear_log().await.unwrap(), "log cleared");
	assert_eq!(control.read_log().await.unwrap(), "");

	let unlogged = ControlPlane::new(supervisor(Duration::from_secs(10)), Arc::new(Vec::<JobSpec>::new()));
	assert_eq!(unlogged.read_log().await.unwrap_err().as_label(), "config_error");
}
