use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::time::Duration;

use serde_json::json;
use tether_rpc::{AnyResponse, ChannelTransport, JsonValue, Message};
use tokio::sync::oneshot;

use super::*;
use crate::host::Host;

#[test]
fn default_error_handler_tolerates_three_errors() {
	let handler = DefaultErrorHandler::new();
	let err = Error::Protocol("boom".into());
	assert_eq!(handler.error(&err, None, 1), ErrorAction::Continue);
	assert_eq!(handler.error(&err, None, 3), ErrorAction::Continue);
	assert_eq!(handler.error(&err, None, 4), ErrorAction::Shutdown);
}

#[test]
fn five_closes_inside_the_window_stop_restarts() {
	let handler = DefaultErrorHandler::new();
	let base = Instant::now();
	for i in 0..4 {
		assert_eq!(
			handler.closed_at(base + Duration::from_secs(i * 10)),
			CloseAction::Restart,
			"close {i} restarts"
		);
	}
	// Fifth close 60 s after the first: storm.
	assert_eq!(handler.closed_at(base + Duration::from_secs(60)), CloseAction::DoNotRestart);
}

#[test]
fn old_closes_age_out_of_the_window() {
	let handler = DefaultErrorHandler::new();
	let base = Instant::now();
	for i in 0..4 {
		handler.closed_at(base + Duration::from_secs(i));
	}
	// Fifth close past the window: the oldest is forgotten instead.
	assert_eq!(
		handler.closed_at(base + Duration::from_secs(4 * 60)),
		CloseAction::Restart
	);
	// And the next close within the (shifted) window storms.
	assert_eq!(
		handler.closed_at(base + Duration::from_secs(4 * 60 + 1)),
		CloseAction::DoNotRestart
	);
}

/// Factory producing in-process scripted servers; each connection can be
/// killed to simulate a crash, or muted on `shutdown` to simulate a hung
/// server.
#[derive(Default)]
struct FakeFactory {
	connects: AtomicUsize,
	kills: Mutex<Vec<oneshot::Sender<()>>>,
	mute_shutdown: Arc<AtomicBool>,
}

impl FakeFactory {
	fn connect_count(&self) -> usize {
		self.connects.load(Ordering::SeqCst)
	}

	fn kill_latest(&self) {
		if let Some(kill) = self.kills.lock().pop() {
			let _ = kill.send(());
		}
	}
}

async fn run_scripted_server(
	mut transport: ChannelTransport,
	mut kill: oneshot::Receiver<()>,
	mute_shutdown: Arc<AtomicBool>,
) {
	use tether_rpc::MessageTransport;
	loop {
		tokio::select! {
			_ = &mut kill => break,
			inbound = transport.recv() => match inbound {
				Ok(Some(Message::Request(req))) => {
					if req.method == "shutdown" && mute_shutdown.load(Ordering::SeqCst) {
						// Hung server: swallow the request.
						continue;
					}
					let response = match req.method.as_str() {
						"initialize" => AnyResponse::new_ok(req.id, json!({"capabilities": {}})),
						_ => AnyResponse::new_ok(req.id, JsonValue::Null),
					};
					if transport.send(Message::Response(response)).await.is_err() {
						break;
					}
				}
				Ok(Some(_)) => {}
				_ => break,
			},
		}
	}
}

#[async_trait]
impl StreamFactory for FakeFactory {
	async fn connect(&self) -> Result<Box<dyn MessageTransport + Send>> {
		self.connects.fetch_add(1, Ordering::SeqCst);
		let (near, far) = ChannelTransport::pair();
		let (kill_tx, kill_rx) = oneshot::channel();
		self.kills.lock().push(kill_tx);
		tokio::spawn(run_scripted_server(far, kill_rx, self.mute_shutdown.clone()));
		Ok(Box::new(near))
	}
}

#[derive(Default)]
struct RecordingHost {
	errors: Mutex<Vec<String>>,
}

#[async_trait]
impl Host for RecordingHost {
	fn show_message(&self, typ: MessageType, message: String) {
		if typ == MessageType::ERROR {
			self.errors.lock().push(message);
		}
	}
}

struct Rig {
	supervisor: LanguageClient,
	factory: Arc<FakeFactory>,
	host: Arc<RecordingHost>,
}

fn rig() -> Rig {
	let factory = Arc::new(FakeFactory::default());
	let host = Arc::new(RecordingHost::default());
	let services = crate::client::ClientServices {
		host: host.clone(),
		..Default::default()
	};
	let supervisor = LanguageClient::new(factory.clone(), services, crate::client::ClientOptions::default());
	Rig {
		supervisor,
		factory,
		host,
	}
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
	for _ in 0..500 {
		if cond() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(5)).await;
	}
	panic!("condition not reached in time");
}

#[tokio::test]
async fn start_runs_the_handshake_and_reaches_running() {
	let r = rig();
	assert_eq!(r.supervisor.state(), ConnectionState::Initial);
	r.supervisor.start().await.unwrap();
	assert_eq!(r.supervisor.state(), ConnectionState::Running);
	assert_eq!(r.factory.connect_count(), 1);
	assert!(r.supervisor.client().is_some());
}

#[tokio::test]
async fn start_twice_is_rejected() {
	let r = rig();
	r.supervisor.start().await.unwrap();
	assert!(r.supervisor.start().await.is_err());
}

#[tokio::test]
async fn crash_triggers_a_supervised_restart() {
	let r = rig();
	r.supervisor.start().await.unwrap();

	r.factory.kill_latest();
	wait_until(|| r.factory.connect_count() == 2).await;
	wait_until(|| r.supervisor.state() == ConnectionState::Running).await;
}

#[tokio::test]
async fn diagnostics_survive_a_supervised_restart() {
	let r = rig();
	r.supervisor.start().await.unwrap();

	let uri: lsp_types::Uri = "file:///w/a.rs".parse().unwrap();
	r.supervisor.diagnostics().set(
		&uri,
		Some(1),
		vec![lsp_types::Diagnostic {
			message: "kept".into(),
			..Default::default()
		}],
	);

	r.factory.kill_latest();
	wait_until(|| r.factory.connect_count() == 2).await;
	wait_until(|| r.supervisor.state() == ConnectionState::Running).await;

	assert_eq!(r.supervisor.diagnostics().get(&uri).len(), 1, "markers survive restart");
}

#[tokio::test]
async fn restart_storm_gives_up_with_a_user_visible_failure() {
	let r = rig();
	r.supervisor.start().await.unwrap();

	for expected in 2..=5 {
		r.factory.kill_latest();
		wait_until(|| {
			r.supervisor.state() == ConnectionState::Stopped || r.factory.connect_count() == expected
		})
		.await;
		if r.supervisor.state() == ConnectionState::Stopped {
			break;
		}
		wait_until(|| r.supervisor.state() == ConnectionState::Running).await;
	}
	// Fifth close within the window: give up.
	r.factory.kill_latest();
	wait_until(|| r.supervisor.state() == ConnectionState::Stopped).await;
	assert!(!r.host.errors.lock().is_empty(), "failure surfaced to the user");
}

#[tokio::test]
async fn stop_shuts_down_gracefully() {
	let r = rig();
	r.supervisor.start().await.unwrap();
	r.supervisor.stop().await.unwrap();
	assert_eq!(r.supervisor.state(), ConnectionState::Stopped);
	// No restart happened.
	assert_eq!(r.factory.connect_count(), 1);
	assert!(r.host.errors.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stop_is_bounded_when_shutdown_goes_unanswered() {
	let r = rig();
	r.factory.mute_shutdown.store(true, Ordering::SeqCst);
	r.supervisor.start().await.unwrap();

	// The server swallows `shutdown`; the bounded wait must still bring
	// the connection down.
	r.supervisor.stop().await.unwrap();
	assert_eq!(r.supervisor.state(), ConnectionState::Stopped);
	assert_eq!(r.factory.connect_count(), 1, "no restart on deliberate stop");
	assert!(r.host.errors.lock().is_empty());
}
