use std::sync::atomic::{AtomicUsize, Ordering};

use pretty_assertions::assert_eq;
use serde_json::json;
use shepherd_proto::{FLUSH_CACHE, QuotaLimit, TransactionId};

use super::*;
use crate::command::{GET_PROFILING_DATA, RegistryBuilder, handler, register_builtins};
use crate::config::Config;
use crate::launcher::test_helpers::{FakeWorker, TestLauncher};
use crate::plugin::Plugin;
use crate::quota::ConfigQuotaSource;

struct Harness {
	sup: Supervisor,
	launcher: TestLauncher,
	env: Environment,
	closed: Arc<Mutex<Vec<WorkerId>>>,
}

fn harness(launcher: TestLauncher, extra: impl FnOnce(&mut RegistryBuilder)) -> Harness {
	let config = Config {
		http_unsafe_origin: "https://pad.example.org".to_owned(),
		..Config::default()
	};
	let env = Environment::new(&config, 2);

	let closed = Arc::new(Mutex::new(Vec::new()));
	let seen = Arc::clone(&closed);
	let plugins: PluginSet = [Plugin::new("audit").on_worker_closed(move |_, pid| {
		seen.lock().push(pid);
		Ok(())
	})]
	.into_iter()
	.collect();

	let mut builder = RegistryBuilder::new();
	register_builtins(&mut builder, &env, Arc::new(ConfigQuotaSource::new("/nonexistent/shepherd.toml")));
	extra(&mut builder);

	let sup = Supervisor::start(SupervisorParts {
		env: env.clone(),
		registry: Arc::new(builder.build()),
		plugins: Arc::new(plugins),
		launcher: Arc::new(launcher.clone()),
		relaunch: RelaunchConfig::default(),
	});
	Harness { sup, launcher, env, closed }
}

async fn settle() {
	for _ in 0..32 {
		tokio::task::yield_now().await;
	}
}

fn invoke(worker: &FakeWorker, txid: &str, command: &str, payload: Option<Value>) {
	worker.send(WorkerMessage::Invoke(Invoke {
		txid: txid.into(),
		pid: worker.pid,
		command: command.to_owned(),
		payload,
	}));
}

async fn pool_of_two(h: &Harness) -> (Arc<FakeWorker>, Arc<FakeWorker>) {
	h.sup.launch_pool(2).await.unwrap();
	(h.launcher.worker(0), h.launcher.worker(1))
}

#[tokio::test(start_paused = true)]
async fn startup_waits_for_every_worker_online() {
	let h = harness(TestLauncher::new().manual_online(), |_| {});
	let sup = h.sup.clone();
	let pool = tokio::spawn(async move { sup.launch_pool(2).await });
	settle().await;
	assert_eq!(h.launcher.launches(), 2);

	h.launcher.worker(0).online();
	settle().await;
	assert!(!pool.is_finished(), "one worker is still launching");

	h.launcher.worker(1).online();
	let pids = pool.await.unwrap().unwrap();
	assert_eq!(pids, vec![h.launcher.worker(0).pid, h.launcher.worker(1).pid]);
	assert!(h.sup.workers().iter().all(|w| w.status == SlotStatus::Online));
}

#[tokio::test(start_paused = true)]
async fn profiling_reply_goes_to_the_originating_worker_only() {
	let h = harness(TestLauncher::new(), |_| {});
	let (a, b) = pool_of_two(&h).await;
	h.env.record_bytes_written(4096);

	invoke(&a, "t1", GET_PROFILING_DATA, Some(json!({})));
	let reply = a.recv().await.unwrap();
	assert_eq!(
		reply,
		PrimaryMessage::Reply {
			txid: "t1".into(),
			pid: a.pid,
			error: None,
			value: Some(json!(4096)),
		}
	);

	settle().await;
	assert!(b.try_recv().is_none());
}

#[tokio::test(start_paused = true)]
async fn reply_is_written_once_even_if_handler_answers_twice() {
	let h = harness(TestLauncher::new(), |builder| {
		builder.register(
			"TWICE",
			handler(|_, reply: Reply| {
				reply.ok(json!("first"));
				reply.ok(json!("second"));
			}),
		);
	});
	let (a, _b) = pool_of_two(&h).await;

	invoke(&a, "t1", "TWICE", Some(json!(null)));
	let Some(PrimaryMessage::Reply { value, .. }) = a.recv().await else {
		panic!("expected a reply");
	};
	assert_eq!(value, Some(json!("first")));
	settle().await;
	assert!(a.try_recv().is_none());
}

#[tokio::test(start_paused = true)]
async fn unknown_command_is_answered_with_an_error() {
	let h = harness(TestLauncher::new(), |_| {});
	let (a, _b) = pool_of_two(&h).await;

	invoke(&a, "t9", "NO_SUCH_THING", Some(json!({})));
	let Some(PrimaryMessage::Reply { txid, error, value, .. }) = a.recv().await else {
		panic!("expected a reply");
	};
	assert_eq!(txid, TransactionId::from("t9"));
	assert_eq!(error.unwrap().code.as_deref(), Some("UNHANDLED_COMMAND"));
	assert_eq!(value, None);
}

#[tokio::test(start_paused = true)]
async fn invoke_without_payload_is_ignored() {
	let h = harness(TestLauncher::new(), |_| {});
	let (a, _b) = pool_of_two(&h).await;

	invoke(&a, "t1", GET_PROFILING_DATA, None);
	settle().await;
	assert!(a.try_recv().is_none());
	assert_eq!(h.sup.workers()[0].pending, 0);
}

#[tokio::test(start_paused = true)]
async fn panicking_handler_fails_the_transaction() {
	let h = harness(TestLauncher::new(), |builder| {
		builder.register("EXPLODE", handler(|_, _reply: Reply| panic!("handler bug")));
	});
	let (a, _b) = pool_of_two(&h).await;

	invoke(&a, "t1", "EXPLODE", Some(json!({})));
	let Some(PrimaryMessage::Reply { error, .. }) = a.recv().await else {
		panic!("expected a reply");
	};
	let error = error.unwrap();
	assert_eq!(error.code.as_deref(), Some("HANDLER_PANIC"));
	assert!(error.message.contains("handler bug"));
}

#[tokio::test(start_paused = true)]
async fn duplicate_outstanding_txid_is_ignored() {
	let calls = Arc::new(AtomicUsize::new(0));
	let held = Arc::new(Mutex::new(Vec::new()));
	let (c, hd) = (Arc::clone(&calls), Arc::clone(&held));
	let h = harness(TestLauncher::new(), move |builder| {
		builder.register(
			"HOLD",
			handler(move |_, reply: Reply| {
				c.fetch_add(1, Ordering::SeqCst);
				hd.lock().push(reply);
			}),
		);
	});
	let (a, _b) = pool_of_two(&h).await;

	invoke(&a, "t1", "HOLD", Some(json!({})));
	invoke(&a, "t1", "HOLD", Some(json!({})));
	settle().await;
	assert_eq!(calls.load(Ordering::SeqCst), 1);
	assert_eq!(h.sup.workers()[0].pending, 1);

	let reply = held.lock().pop().unwrap();
	reply.done();
	assert!(matches!(a.recv().await, Some(PrimaryMessage::Reply { .. })));
	assert_eq!(h.sup.workers()[0].pending, 0);
}

#[tokio::test(start_paused = true)]
async fn broadcast_reaches_online_workers_with_fresh_ids() {
	let h = harness(TestLauncher::new().manual_online(), |_| {});
	let sup = h.sup.clone();
	let pool = tokio::spawn(async move { sup.launch_pool(2).await });
	settle().await;
	h.launcher.worker(0).online();
	h.launcher.worker(1).online();
	pool.await.unwrap().unwrap();

	// A third worker that has not come online yet is skipped.
	h.sup.launch_worker(Box::new(|_: WorkerId| {})).unwrap();
	let (a, b, c) = (h.launcher.worker(0), h.launcher.worker(1), h.launcher.worker(2));

	let key = h.env.fresh_key();
	let addressed = h.sup.broadcast(FLUSH_CACHE, json!(key));
	assert_eq!(addressed, vec![a.pid, b.pid]);

	let mut txids = Vec::new();
	for worker in [&a, &b] {
		let Some(PrimaryMessage::Event { txid, command, payload }) = worker.recv().await else {
			panic!("expected an event");
		};
		assert_eq!(command, FLUSH_CACHE);
		assert_eq!(payload, json!(key));
		txids.push(txid);
	}
	assert_ne!(txids[0], txids[1]);
	settle().await;
	assert!(c.try_recv().is_none());
}

#[tokio::test(start_paused = true)]
async fn clean_exit_is_not_relaunched() {
	let h = harness(TestLauncher::new(), |_| {});
	let (a, _b) = pool_of_two(&h).await;

	a.exit(WorkerExit::success());
	settle().await;

	assert_eq!(h.launcher.launches(), 2);
	assert_eq!(h.sup.workers().len(), 1);
	assert_eq!(*h.closed.lock(), vec![a.pid]);
}

#[tokio::test(start_paused = true)]
async fn killed_worker_is_replaced_with_a_fresh_snapshot() {
	let h = harness(TestLauncher::new(), |_| {});
	let (a, b) = pool_of_two(&h).await;
	let seeded = a.snapshot.clone();

	let mut limits = BTreeMap::new();
	limits.insert("alice".to_owned(), QuotaLimit { limit: 1, plan: "p".to_owned(), note: None });
	h.env.set_limits(limits);

	a.exit(WorkerExit::signal(9));
	settle().await;

	assert_eq!(h.launcher.launches(), 3, "exactly one relaunch");
	let c = h.launcher.worker(2);
	assert!(c.snapshot.version > seeded.version);
	assert!(c.snapshot.limits.contains_key("alice"));
	assert_eq!(*h.closed.lock(), vec![a.pid]);

	let pids: Vec<_> = h.sup.workers().iter().map(|w| w.pid).collect();
	assert_eq!(pids, vec![b.pid, c.pid]);
}

#[tokio::test(start_paused = true)]
async fn crash_drops_pending_transactions() {
	let held = Arc::new(Mutex::new(Vec::new()));
	let hd = Arc::clone(&held);
	let h = harness(TestLauncher::new(), move |builder| {
		builder.register("HOLD", handler(move |_, reply: Reply| hd.lock().push(reply)));
	});
	let (a, _b) = pool_of_two(&h).await;

	invoke(&a, "t1", "HOLD", Some(json!({})));
	settle().await;
	a.exit(WorkerExit::code(1));
	settle().await;

	let reply = held.lock().pop().unwrap();
	reply.done();
	settle().await;

	let c = h.launcher.worker(2);
	assert!(c.try_recv().is_none(), "late reply must not reach the replacement");
}

#[tokio::test(start_paused = true)]
async fn crash_before_online_relaunches_after_delay_and_completes_startup() {
	let h = harness(TestLauncher::new().manual_online(), |_| {});
	let sup = h.sup.clone();
	let pool = tokio::spawn(async move { sup.launch_pool(1).await });
	settle().await;

	h.launcher.worker(0).exit(WorkerExit::code(1));
	settle().await;
	assert_eq!(h.launcher.launches(), 1, "relaunch waits for the crash delay");

	tokio::time::sleep(RelaunchConfig::default().startup_crash_delay()).await;
	settle().await;
	assert_eq!(h.launcher.launches(), 2);

	let replacement = h.launcher.worker(1);
	replacement.online();
	assert_eq!(pool.await.unwrap().unwrap(), vec![replacement.pid]);
}

#[tokio::test(start_paused = true)]
async fn failed_relaunch_is_retried() {
	let h = harness(TestLauncher::new(), |_| {});
	let (a, _b) = pool_of_two(&h).await;

	h.launcher.fail_next(1);
	a.exit(WorkerExit::signal(9));
	settle().await;
	assert_eq!(h.launcher.launches(), 2);

	tokio::time::sleep(RelaunchConfig::default().startup_crash_delay()).await;
	settle().await;
	assert_eq!(h.launcher.launches(), 3);
	assert_eq!(h.sup.workers().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_inputs_without_relaunch() {
	let h = harness(TestLauncher::new(), |_| {});
	pool_of_two(&h).await;

	let killed = h.sup.shutdown(Duration::from_secs(1)).await;
	assert_eq!(killed, 0);
	assert!(h.sup.workers().is_empty());
	assert_eq!(h.launcher.launches(), 2);
	assert_eq!(h.closed.lock().len(), 2);
	assert!(matches!(h.sup.launch_worker(Box::new(|_: WorkerId| {})), Err(LaunchError::ShuttingDown)));
}

#[tokio::test(start_paused = true)]
async fn shutdown_kills_workers_that_ignore_close() {
	let h = harness(TestLauncher::new().ignore_close(), |_| {});
	pool_of_two(&h).await;

	let killed = h.sup.shutdown(Duration::from_secs(1)).await;
	assert_eq!(killed, 2);
	assert!(h.sup.workers().is_empty());
	assert_eq!(h.launcher.launches(), 2, "killed workers are not relaunched");
}
