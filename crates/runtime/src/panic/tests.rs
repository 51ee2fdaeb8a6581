use pretty_assertions::assert_eq;

use super::*;

#[tokio::test]
async fn handler_panic_message_survives_join() {
	let handle = tokio::spawn(async { panic!("quota file vanished") });
	let err = handle.await.unwrap_err();
	assert_eq!(join_error_panic_message(err).as_deref(), Some("quota file vanished"));
}

#[tokio::test]
async fn formatted_panic_message_survives_join() {
	let handle = tokio::spawn(async {
		let pid = 1001;
		panic!("worker {pid} sent garbage")
	});
	let err = handle.await.unwrap_err();
	assert_eq!(join_error_panic_message(err).as_deref(), Some("worker 1001 sent garbage"));
}

#[tokio::test]
async fn aborted_handler_is_not_a_panic() {
	let handle = tokio::spawn(std::future::pending::<()>());
	handle.abort();
	let err = handle.await.unwrap_err();
	assert_eq!(join_error_panic_message(err), None);
}

#[test]
fn plugin_hook_payloads_are_readable() {
	let payload = std::panic::catch_unwind::<_, ()>(|| panic!("hook failed")).unwrap_err();
	assert_eq!(panic_message(&*payload), "hook failed");

	let payload = std::panic::catch_unwind(|| std::panic::panic_any(7_u8)).unwrap_err();
	assert_eq!(panic_message(&*payload), "non-string panic payload");
}
