use serde_json::json;
use shepherd_primary::command::LOG;
use shepherd_worker::{WorkerLink, WorkerState, serve, snapshot_from_env};

/// Worker entry point. Returns when the primary closes stdin.
pub async fn run() -> anyhow::Result<()> {
	let snapshot = snapshot_from_env()?;
	let (link, events) = WorkerLink::stdio();
	let pid = link.pid();
	tracing::info!(%pid, env_version = snapshot.version, "worker.start");
	link.online()?;

	let announce = link.clone();
	tokio::spawn(async move {
		let record = json!({
			"level": "info",
			"tag": "HTTP_WORKER_READY",
			"info": { "pid": pid.0 },
		});
		if let Err(error) = announce.invoke(LOG, record).await {
			tracing::debug!(%error, "worker.announce.failed");
		}
	});

	let state = serve(events, WorkerState::new(snapshot)).await;
	tracing::info!(%pid, env_version = state.snapshot().version, flushes = state.flushes(), "worker.stop");
	Ok(())
}
