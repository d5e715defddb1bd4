//! End-to-end session tests against a real worker subprocess.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use pipes_bridge::{
    BridgeError, ExecSpawner, Session, SessionConfig, SpawnError, UpHandler,
};

const ECHO_WORKER: &str = env!("CARGO_BIN_EXE_pipes-echo-worker");

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Output(Bytes, Bytes),
    Status(String),
    Progress(f64),
    Done,
    Registered(i32, String, String),
    Incremented(i32, i32),
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, e: Event) {
        self.events.lock().unwrap().push(e);
    }
}

#[async_trait]
impl UpHandler for Recorder {
    async fn output(&self, key: Bytes, value: Bytes) {
        self.push(Event::Output(key, value));
    }
    async fn status(&self, message: String) {
        self.push(Event::Status(message));
    }
    async fn progress(&self, fraction: f64) {
        self.push(Event::Progress(fraction));
    }
    async fn done(&self) {
        self.push(Event::Done);
    }
    async fn counter_registered(&self, id: i32, group: String, name: String) {
        self.push(Event::Registered(id, group, name));
    }
    async fn counter_incremented(&self, id: i32, amount: i32) {
        self.push(Event::Incremented(id, amount));
    }
}

#[tokio::test]
async fn map_session_end_to_end() {
    let handler = Arc::new(Recorder::default());
    let mut session = Session::spawn(SessionConfig::new(ECHO_WORKER), Arc::clone(&handler))
        .await
        .unwrap();

    session.start().await.unwrap();
    let conf = HashMap::from([("a".to_string(), "1".to_string())]);
    session.set_job_conf(&conf).await.unwrap();
    session.set_input_types("Text", "Text").await.unwrap();
    session.run_map("split-0", 2, true).await.unwrap();
    session.map_item("k1", "v1").await.unwrap();

    let status = session.close().await.unwrap();
    assert!(status.success());

    let events = events_settled(&handler);
    let outputs: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, Event::Output(..)))
        .collect();
    assert_eq!(
        outputs,
        vec![&Event::Output(
            Bytes::from_static(b"k1"),
            Bytes::from_static(b"v1"),
        )]
    );
    assert!(events.contains(&Event::Done));
    assert!(events.contains(&Event::Registered(
        0,
        "echo".to_string(),
        "records".to_string(),
    )));
    assert!(events.contains(&Event::Incremented(0, 1)));
}

#[tokio::test]
async fn reduce_session_end_to_end() {
    let handler = Arc::new(Recorder::default());
    let mut session = Session::spawn(SessionConfig::new(ECHO_WORKER), Arc::clone(&handler))
        .await
        .unwrap();

    session.start().await.unwrap();
    session.run_reduce(1, true).await.unwrap();
    session.reduce_key("k").await.unwrap();
    session.reduce_value("1").await.unwrap();
    session.reduce_value("2").await.unwrap();

    let status = session.close().await.unwrap();
    assert!(status.success());

    let events = events_settled(&handler);
    let outputs: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, Event::Output(..)))
        .collect();
    assert_eq!(outputs.len(), 2);
    assert!(events.contains(&Event::Done));
}

#[tokio::test]
async fn abort_mid_session_tears_down_cleanly() {
    let handler = Arc::new(Recorder::default());
    let mut session = Session::spawn(SessionConfig::new(ECHO_WORKER), handler)
        .await
        .unwrap();

    session.start().await.unwrap();
    session.run_map("split-0", 1, true).await.unwrap();

    let status = session.abort().await;
    // The worker exits on ABORT without emitting DONE.
    assert_eq!(status.map(|s| s.success()), Some(true));
}

#[tokio::test]
async fn missing_worker_executable_fails_to_spawn() {
    let handler = Arc::new(Recorder::default());
    let result = Session::spawn(
        SessionConfig::new("/nonexistent/pipes-worker"),
        handler,
    )
    .await;
    assert!(matches!(
        result,
        Err(BridgeError::Spawn(SpawnError::NotFound { .. }))
    ));
}

#[tokio::test]
async fn crashed_worker_fails_pending_operations() {
    let handler = Arc::new(Recorder::default());
    let spawner = ExecSpawner::new("/bin/sh")
        .with_arg("-c")
        .with_arg("exit 1");
    let config = SessionConfig::from_spawner(Arc::new(spawner));
    let mut session = Session::spawn(config, handler).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    let err = session.start().await.unwrap_err();
    assert!(matches!(err, BridgeError::WorkerTerminated { .. }));

    // Abort after the crash must be safe and report the captured exit.
    let status = session.abort().await;
    assert_eq!(status.and_then(|s| s.code()), Some(1));
}

#[tokio::test]
async fn worker_death_unblocks_a_write_stalled_on_a_full_pipe() {
    let handler = Arc::new(Recorder::default());
    // Never reads stdin, so the down pipe fills and a map_item call blocks
    // until the exit closes the read end.
    let spawner = ExecSpawner::new("/bin/sh")
        .with_arg("-c")
        .with_arg("sleep 1; exit 7");
    let mut session = Session::spawn(SessionConfig::from_spawner(Arc::new(spawner)), handler)
        .await
        .unwrap();

    session.start().await.unwrap();
    session.run_map("split-0", 1, true).await.unwrap();

    let payload = Bytes::from(vec![0u8; 1 << 20]);
    let err = tokio::time::timeout(Duration::from_secs(10), async {
        for _ in 0..64 {
            if let Err(e) = session.map_item("k", payload.clone()).await {
                return e;
            }
        }
        panic!("64 MiB of map items never filled the pipe");
    })
    .await
    .unwrap();
    assert!(matches!(err, BridgeError::WorkerTerminated { .. }));

    let status = session.abort().await;
    assert_eq!(status.and_then(|s| s.code()), Some(7));
}

#[tokio::test]
async fn nonzero_exit_after_clean_close_is_reported() {
    let handler = Arc::new(Recorder::default());
    // Consumes the down channel until EOF, then fails.
    let spawner = ExecSpawner::new("/bin/sh")
        .with_arg("-c")
        .with_arg("cat >/dev/null; exit 3");
    let config = SessionConfig::from_spawner(Arc::new(spawner));
    let mut session = Session::spawn(config, handler).await.unwrap();

    session.start().await.unwrap();
    let err = session.close().await.unwrap_err();
    assert!(matches!(err, BridgeError::WorkerFailedGraceful { code: 3 }));
}

/// Events arrive via the receiver task, which `close()` joins before
/// returning, so no extra synchronization is needed - this just centralizes
/// the read.
fn events_settled(handler: &Recorder) -> Vec<Event> {
    handler.events()
}
