use std::sync::{Arc, Mutex};
use std::time::Duration;

use rnetpoll::codec::{Category, Tl1Codec};
use rnetpoll::protocols::tl1;
use rnetpoll::session::{
    AsyncSession, Credentials, SessionEvent, SessionOptions, SessionRecorder, SyncSession,
};
use rnetpoll::transport::StreamLink;
use rnetpoll::ProtocolError;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};

type Peer = (BufReader<ReadHalf<DuplexStream>>, WriteHalf<DuplexStream>);

/// A TL1 element on the far side of an in-memory pipe.
fn element() -> (StreamLink, Peer) {
    let (client, peer) = tokio::io::duplex(16 * 1024);
    let (read, write) = tokio::io::split(peer);
    (
        StreamLink::attached("ne1", client),
        (BufReader::new(read), write),
    )
}

async fn next_command(reader: &mut BufReader<ReadHalf<DuplexStream>>) -> Option<String> {
    let mut line = String::new();
    match reader.read_line(&mut line).await {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line),
    }
}

/// Fourth field of a TL1 command.
fn ctag(command: &str) -> String {
    command
        .trim()
        .trim_end_matches(';')
        .split(':')
        .nth(3)
        .unwrap_or_default()
        .to_string()
}

/// Second field of a TL1 command, echoed back as the result line.
fn aid(command: &str) -> String {
    command.split(':').nth(2).unwrap_or_default().to_string()
}

fn completed(ctag: &str, line: &str) -> String {
    format!("\r\n\r\n   SIM 26-10-16 10:00:00\r\nM  {ctag} COMPLD\r\n \"{line}\"\r\n;")
}

fn sync_session(link: StreamLink) -> SyncSession<tl1::Tl1Terminal, Tl1Codec> {
    SyncSession::new(tl1::terminal(link, false), Tl1Codec::new())
}

fn async_session(link: StreamLink) -> AsyncSession<tl1::Tl1Terminal, Tl1Codec> {
    AsyncSession::new(tl1::terminal(link, false), Tl1Codec::new()).with_options(SessionOptions {
        timeout_ms: 600,
        ..SessionOptions::default()
    })
}

#[tokio::test]
async fn sync_command_returns_result_lines() {
    let (link, (mut reader, mut writer)) = element();
    let device = tokio::spawn(async move {
        let command = next_command(&mut reader).await.expect("command");
        writer
            .write_all(completed(&ctag(&command), "10.1-10.2").as_bytes())
            .await
            .expect("reply");
        command
    });

    let mut session = sync_session(link);
    session
        .start(Credentials::default())
        .await
        .expect("start");
    let lines = session
        .command("RTRV-CRS:::C1;")
        .await
        .expect("reply");
    assert_eq!(lines, ["10.1-10.2"]);
    assert_eq!(device.await.expect("device"), "RTRV-CRS:::1;\n");
    session.stop().await.expect("stop");
}

#[tokio::test]
async fn sync_command_dispatches_alarms_on_the_way() {
    let (link, (mut reader, mut writer)) = element();
    let device = tokio::spawn(async move {
        let command = next_command(&mut reader).await.expect("command");
        writer
            .write_all(b"\r\n\r\n   SIM 26-10-16 10:00:00\r\n*C 77 REPT ALM OC48\r\n   \"1-1:CR,LOS,SA\"\r\n;")
            .await
            .expect("alarm");
        writer
            .write_all(completed(&ctag(&command), "1-1").as_bytes())
            .await
            .expect("reply");
    });

    let mut session = sync_session(link);
    let (alarms, mut alarm_rx) = mpsc::unbounded_channel();
    session.set_autonomous_callback(Some(Category::Critical), move |alarm| {
        let _ = alarms.send(alarm.lines().to_vec());
    });
    session
        .start(Credentials::default())
        .await
        .expect("start");
    let lines = session
        .command("RTRV-ALM-ALL:::ctag;")
        .await
        .expect("reply");
    assert_eq!(lines, ["1-1"]);
    assert_eq!(alarm_rx.recv().await.expect("alarm"), ["1-1:CR,LOS,SA"]);
    device.await.expect("device");
}

#[tokio::test]
async fn sync_command_times_out_without_reply() {
    let (link, (mut reader, _writer)) = element();
    let device = tokio::spawn(async move { next_command(&mut reader).await });

    let mut session = sync_session(link);
    session
        .start(Credentials::default())
        .await
        .expect("start");
    let err = session
        .command_with_timeout("RTRV-HDR:::ctag;", Duration::from_millis(100))
        .await
        .expect_err("silent element");
    assert!(err.is_timeout());
    assert!(device.await.expect("device").is_some());
}

#[tokio::test]
async fn denied_command_surfaces_the_peer_reason() {
    let (link, (mut reader, mut writer)) = element();
    tokio::spawn(async move {
        let command = next_command(&mut reader).await.expect("command");
        let reply = format!(
            "\r\nM  {} DENY\r\n   IIAC\r\n   /* Input, Invalid ACcess identifier */\r\n;",
            ctag(&command)
        );
        writer.write_all(reply.as_bytes()).await.expect("reply");
    });

    let mut session = sync_session(link);
    session
        .start(Credentials::default())
        .await
        .expect("start");
    let err = session
        .command("RTRV-EQPT::BOGUS:ctag;")
        .await
        .expect_err("denied");
    match err {
        ProtocolError::CommandFailed { status, reason, .. } => {
            assert_eq!(status, "DENY IIAC");
            assert_eq!(reason, "Input, Invalid ACcess identifier");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn login_and_logout_use_act_user_and_canc_user() {
    let (link, (mut reader, mut writer)) = element();
    let device = tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(command) = next_command(&mut reader).await {
            writer
                .write_all(completed(&ctag(&command), "").as_bytes())
                .await
                .expect("reply");
            seen.push(command);
        }
        seen
    });

    let mut session = sync_session(link);
    session
        .start(Credentials::new("admin", Some("secret")))
        .await
        .expect("start");
    session.stop().await.expect("stop");
    assert_eq!(
        device.await.expect("device"),
        ["ACT-USER::admin:1::secret;\n", "CANC-USER::admin:2;\n"]
    );
}

#[tokio::test]
async fn callbacks_fire_in_reply_order() {
    let (link, (mut reader, mut writer)) = element();
    let device = tokio::spawn(async move {
        let first = next_command(&mut reader).await.expect("C1");
        let second = next_command(&mut reader).await.expect("C2");
        writer
            .write_all(completed(&ctag(&second), "two").as_bytes())
            .await
            .expect("C2 reply");
        tokio::time::sleep(Duration::from_millis(20)).await;
        writer
            .write_all(completed(&ctag(&first), "one").as_bytes())
            .await
            .expect("C1 reply");
        // Stay connected until the session hangs up.
        while next_command(&mut reader).await.is_some() {}
    });

    let session = async_session(link);
    session
        .start(Credentials::default())
        .await
        .expect("start");

    let order = Arc::new(Mutex::new(Vec::new()));
    let (done, mut done_rx) = mpsc::unbounded_channel();
    for command in ["RTRV-CRS::C1:ctag;", "RTRV-CRS::C2:ctag;"] {
        let order = Arc::clone(&order);
        let done = done.clone();
        session
            .callback_command(command, move |reply| {
                let reply = reply.expect("reply");
                order.lock().expect("lock").push(reply.lines()[0].clone());
                let _ = done.send(());
            })
            .await
            .expect("sent");
    }
    done_rx.recv().await.expect("first callback");
    done_rx.recv().await.expect("second callback");

    assert_eq!(*order.lock().expect("lock"), ["two", "one"]);
    assert_eq!(session.pending(), 0);
    session.stop().await.expect("stop");
    device.await.expect("device");
}

#[tokio::test]
async fn concurrent_commands_get_their_own_replies() {
    let (link, (mut reader, mut writer)) = element();
    let device = tokio::spawn(async move {
        let mut ctags = Vec::new();
        while let Some(command) = next_command(&mut reader).await {
            ctags.push(ctag(&command));
            writer
                .write_all(completed(&ctag(&command), &aid(&command)).as_bytes())
                .await
                .expect("reply");
        }
        ctags
    });

    let session = Arc::new(async_session(link));
    session
        .start(Credentials::default())
        .await
        .expect("start");

    let callers: Vec<_> = (0..8)
        .map(|n| {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                let aid = format!("SLOT-{n}");
                let lines = session
                    .command(&format!("RTRV-EQPT::{aid}:ctag;"))
                    .await
                    .expect("reply");
                assert_eq!(lines, [aid]);
            })
        })
        .collect();
    for caller in callers {
        caller.await.expect("caller");
    }
    session.stop().await.expect("stop");

    let mut ctags = device.await.expect("device");
    assert_eq!(ctags.len(), 8);
    ctags.sort();
    ctags.dedup();
    assert_eq!(ctags.len(), 8, "identifiers must be distinct");
}

#[tokio::test]
async fn expired_callback_fails_and_late_reply_is_dropped() {
    let (link, (mut reader, mut writer)) = element();
    let device = tokio::spawn(async move {
        let first = next_command(&mut reader).await.expect("C1");
        let second = next_command(&mut reader).await.expect("C2");
        for command in [first, second] {
            writer
                .write_all(completed(&ctag(&command), &aid(&command)).as_bytes())
                .await
                .expect("reply");
        }
        while next_command(&mut reader).await.is_some() {}
    });

    let session = async_session(link);
    let recorder = SessionRecorder::default();
    session.set_recorder(recorder.clone());
    session
        .start(Credentials::default())
        .await
        .expect("start");

    let (tx, rx) = oneshot::channel();
    session
        .callback_command_with_timeout(
            "RTRV-EQPT::SLOW:ctag;",
            move |reply| {
                let _ = tx.send(reply);
            },
            Duration::from_millis(100),
        )
        .await
        .expect("sent");
    let err = rx.await.expect("called").expect_err("expired");
    assert!(err.is_timeout());

    let lines = session
        .command("RTRV-EQPT::FAST:ctag;")
        .await
        .expect("reply");
    assert_eq!(lines, ["FAST"]);
    session.stop().await.expect("stop");
    device.await.expect("device");

    let expired = recorder
        .entries()
        .into_iter()
        .filter(|entry| matches!(entry.event, SessionEvent::CallbackExpired { .. }))
        .count();
    assert_eq!(expired, 1);
}

#[tokio::test]
async fn lost_connection_fails_pending_callbacks() {
    let (link, (mut reader, writer)) = element();
    let device = tokio::spawn(async move {
        next_command(&mut reader).await.expect("command");
        drop(writer);
        drop(reader);
    });

    let session = async_session(link);
    session
        .start(Credentials::default())
        .await
        .expect("start");
    let (tx, rx) = oneshot::channel();
    session
        .callback_command("RTRV-HDR:::ctag;", move |reply| {
            let _ = tx.send(reply);
        })
        .await
        .expect("sent");
    device.await.expect("device");

    let err = rx.await.expect("called").expect_err("connection lost");
    assert!(matches!(err, ProtocolError::Network(_)));
    let err = session
        .command("RTRV-HDR:::ctag;")
        .await
        .expect_err("session is broken");
    assert!(err.is_session_fatal());
    session.stop().await.expect("stop");
}

#[tokio::test]
async fn autonomous_messages_reach_the_catch_all_handler() {
    let (link, (mut reader, mut writer)) = element();
    let device = tokio::spawn(async move {
        // Past the terminal's post-connect settle window.
        tokio::time::sleep(Duration::from_millis(100)).await;
        writer
            .write_all(b"\r\n\r\n   SIM 26-10-16 10:00:00\r\nA  12 REPT DBCHG\r\n   \"ENT-CRS\"\r\n;")
            .await
            .expect("report");
        while next_command(&mut reader).await.is_some() {}
    });

    let session = async_session(link);
    let (reports, mut report_rx) = mpsc::unbounded_channel();
    session.set_autonomous_callback(None, move |report| {
        let _ = reports.send((report.identifier.clone(), report.lines().to_vec()));
    });
    session.set_threaded_callbacks(true);
    session
        .start(Credentials::default())
        .await
        .expect("start");

    let (identifier, lines) = report_rx.recv().await.expect("report");
    assert_eq!(identifier.as_deref(), Some("12"));
    assert_eq!(lines, ["ENT-CRS"]);
    session.stop().await.expect("stop");
    device.await.expect("device");
}

#[tokio::test]
async fn reply_arriving_with_the_next_echo_is_not_lost() {
    let (link, (mut reader, mut writer)) = element();
    let device = tokio::spawn(async move {
        let first = next_command(&mut reader).await.expect("C1");
        writer
            .write_all(format!("{}\r\n", first.trim_end()).as_bytes())
            .await
            .expect("C1 echo");
        let second = next_command(&mut reader).await.expect("C2");
        let burst = format!(
            "{}{}\r\n",
            completed(&ctag(&first), "one"),
            second.trim_end()
        );
        writer.write_all(burst.as_bytes()).await.expect("C1 reply");
        writer
            .write_all(completed(&ctag(&second), "two").as_bytes())
            .await
            .expect("C2 reply");
        while next_command(&mut reader).await.is_some() {}
    });

    let session = AsyncSession::new(tl1::terminal(link, true), Tl1Codec::new()).with_options(
        SessionOptions {
            timeout_ms: 600,
            ..SessionOptions::default()
        },
    );
    session
        .start(Credentials::default())
        .await
        .expect("start");

    let mut replies = Vec::new();
    for command in ["RTRV-CRS::C1:ctag;", "RTRV-CRS::C2:ctag;"] {
        let (tx, rx) = oneshot::channel();
        session
            .callback_command(command, move |reply| {
                let _ = tx.send(reply);
            })
            .await
            .expect("sent");
        replies.push(rx);
    }
    let mut lines = Vec::new();
    for rx in replies {
        lines.push(rx.await.expect("called").expect("reply").lines().to_vec());
    }
    assert_eq!(lines, [["one"], ["two"]]);
    session.stop().await.expect("stop");
    device.await.expect("device");
}

#[tokio::test]
async fn tcp_element_with_echo_answers_the_convenience_session() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let device = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let (read, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read);
        let mut line = String::new();
        reader.read_line(&mut line).await.expect("command");
        let reply = format!(
            "{}\r\n{}",
            line.trim_end(),
            completed(&ctag(&line), "ECHOED")
        );
        writer.write_all(reply.as_bytes()).await.expect("reply");
        line
    });

    let mut session = tl1::sync_tl1("127.0.0.1", port, true);
    session
        .start(Credentials::default())
        .await
        .expect("start");
    let lines = session
        .command("RTRV-HDR:::ctag;")
        .await
        .expect("reply");
    assert_eq!(lines, ["ECHOED"]);
    assert_eq!(device.await.expect("device"), "RTRV-HDR:::1;\n");
    session.stop().await.expect("stop");
}
