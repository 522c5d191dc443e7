use rnetpoll::codec::Category;
use rnetpoll::protocols::tl1;
use rnetpoll::session::{
    Credentials, NormalizeOptions, SessionEvent, SessionRecordLevel, SessionRecorder,
    SessionReplayer,
};
use rnetpoll::ProtocolError;

const RECORDING: &str = include_str!("fixtures/ne1_recording.jsonl");

fn fixture(name: &str) -> std::path::PathBuf {
    std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

#[test]
fn recording_exposes_target_and_alarms() {
    let replayer = SessionReplayer::from_jsonl(RECORDING).expect("load recording");
    assert_eq!(replayer.target(), Some("ne1.example.net"));
    assert_eq!(
        replayer.autonomous(Category::Critical),
        [["1-1:CR,LOS,SA".to_string()].as_slice()]
    );
    assert!(replayer.autonomous(Category::Major).is_empty());
}

#[test]
fn recording_replays_a_script() {
    let mut replayer = SessionReplayer::from_jsonl(RECORDING).expect("load recording");
    let outputs = replayer
        .replay_script(&["RTRV-HDR:::ctag;", "rtrv-alm-all:::ctag;"])
        .expect("replay script");
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs[0].identifier.as_deref(), Some("1"));
    assert_eq!(outputs[1].lines, ["1-1:CR,LOS,SA"]);

    let denied = replayer
        .replay_next("RTRV-EQPT::SLOT-9:ctag;")
        .expect("recorded");
    assert!(!denied.success);
    assert_eq!(denied.status, "M DENY IIAC");
}

#[test]
fn replaying_past_the_recording_is_a_mismatch() {
    let mut replayer = SessionReplayer::from_jsonl(RECORDING).expect("load recording");
    replayer
        .replay_next("RTRV-ALM-ALL:::ctag;")
        .expect("recorded");
    // The cursor only moves forward.
    let err = replayer
        .replay_next("RTRV-HDR:::ctag;")
        .expect_err("already passed");
    assert!(matches!(err, ProtocolError::ReplayMismatch(_)));
}

#[test]
fn normalizing_sorts_by_time_and_drops_raw_chunks() {
    let normalized =
        SessionRecorder::normalize_jsonl(RECORDING, NormalizeOptions::default()).expect("normalize");
    let recorder = SessionRecorder::from_jsonl(&normalized).expect("reload");
    let entries = recorder.entries();
    assert_eq!(entries.len(), 7);
    assert!(
        entries
            .iter()
            .all(|entry| !matches!(entry.event, SessionEvent::RawChunk { .. }))
    );
    assert!(entries.windows(2).all(|pair| pair[0].ts_ms <= pair[1].ts_ms));

    let again =
        SessionRecorder::normalize_jsonl(&normalized, NormalizeOptions::default()).expect("idempotent");
    assert_eq!(again, normalized);
}

#[test]
fn normalizing_can_keep_everything_or_drop_alarms() {
    let everything = SessionRecorder::normalize_jsonl(
        RECORDING,
        NormalizeOptions {
            keep_raw_chunks: true,
            keep_autonomous: true,
        },
    )
    .expect("normalize");
    assert_eq!(everything.lines().count(), 9);
    // Sorting moves the alarm's raw chunk ahead of its dispatch.
    let kinds: Vec<&str> = everything
        .lines()
        .map(|line| {
            if line.contains("\"raw_chunk\"") {
                "raw"
            } else if line.contains("\"autonomous\"") {
                "alarm"
            } else {
                "other"
            }
        })
        .collect();
    assert_eq!(kinds[3..5], ["raw", "alarm"]);

    let quiet = SessionRecorder::normalize_jsonl(
        RECORDING,
        NormalizeOptions {
            keep_raw_chunks: false,
            keep_autonomous: false,
        },
    )
    .expect("normalize");
    assert!(!quiet.contains("\"autonomous\""));
}

#[test]
fn broken_recording_line_is_a_parsing_error() {
    let err = SessionReplayer::from_jsonl("{\"ts_ms\":1,\"event\":{\"kind\":\"nope\"}}")
        .expect_err("unknown kind");
    assert!(matches!(err, ProtocolError::Parsing(_)));
}

#[tokio::test]
async fn recorded_session_replays_offline() {
    let recorder = SessionRecorder::new(SessionRecordLevel::KeyEventsOnly);
    let mut session = tl1::tl1_replay(fixture("tl1_session.log"));
    session.set_recorder(recorder.clone());
    session
        .start(Credentials::default())
        .await
        .expect("start");
    let lines = session
        .command("RTRV-CRS-FIBER::ALL:ctag;")
        .await
        .expect("recorded");
    session.stop().await.expect("stop");

    let jsonl = recorder.to_jsonl().expect("export");
    assert!(!jsonl.contains("\"raw_chunk\""));

    let mut replayer = SessionReplayer::from_jsonl(&jsonl).expect("reload");
    assert_eq!(replayer.target(), Some(session.target().as_str()));
    let output = replayer
        .replay_next("RTRV-CRS-FIBER::ALL:ctag;")
        .expect("recorded");
    assert!(output.success);
    assert_eq!(output.lines, lines);
}
