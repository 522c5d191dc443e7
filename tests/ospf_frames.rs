use std::io::Write;
use std::net::Ipv4Addr;
use std::time::Duration;

use rnetpoll::codec::{LsaType, OspfCodec, OspfHeader, SYNC_LSDB_COMMAND, SYNC_LSDB_REQUEST};
use rnetpoll::protocols::ospf::read_frames;
use rnetpoll::protocols::{OspfFetcher, write_dump};
use rnetpoll::session::SyncSession;
use rnetpoll::transport::{DumpTransport, StreamLink, Terminal, Transport};
use rnetpoll::{Credentials, ProtocolError};
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Version 1, type 1, body length 4, sequence 1, and the body.
const REPLY_FRAME: [u8; 12] = [0x01, 0x01, 0x00, 0x04, 0x00, 0x00, 0x00, 0x01, 0, 0, 0, 0];

fn dump_file(bytes: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(bytes).expect("write dump");
    file
}

/// LSA update notification carrying a router LSA.
fn lsa_frame(sequence: u32) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&[192, 0, 2, 1]); // interface
    body.extend_from_slice(&0u32.to_be_bytes()); // area 0.0.0.0
    body.extend_from_slice(&[1, 0, 0, 0]); // self originated, padding
    body.extend_from_slice(&3600u16.to_be_bytes()); // age
    body.push(0x02); // options
    body.push(1); // router LSA
    body.extend_from_slice(&[10, 0, 0, 1]); // link state id
    body.extend_from_slice(&[10, 0, 0, 1]); // advertising router
    body.extend_from_slice(&0x8000_0001u32.to_be_bytes());
    body.extend_from_slice(&0xbeefu16.to_be_bytes());
    body.extend_from_slice(&36u16.to_be_bytes());

    let header = OspfHeader::new(13, body.len() as u16, sequence);
    let mut frame = header.to_bytes().to_vec();
    frame.extend_from_slice(&body);
    frame
}

#[tokio::test]
async fn dump_yields_one_frame_per_header_and_body() {
    let file = dump_file(&REPLY_FRAME);
    let mut transport = DumpTransport::open(file.path());
    transport
        .connect(&Credentials::default())
        .await
        .expect("open dump");

    let frames = read_frames(&mut transport, &OspfCodec::new(), Duration::from_millis(100))
        .await
        .expect("frames");
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].header.version, 1);
    assert_eq!(frames[0].header.msg_type, 1);
    assert_eq!(frames[0].header.sequence, 1);
    assert_eq!(frames[0].body, [0, 0, 0, 0]);
    assert_eq!(frames[0].to_bytes(), REPLY_FRAME);
}

#[tokio::test]
async fn wrong_version_is_a_framing_error() {
    let mut bytes = REPLY_FRAME;
    bytes[0] = 2;
    let file = dump_file(&bytes);
    let err = OspfFetcher::dump(file.path())
        .fetch_frames()
        .await
        .expect_err("version 2");
    assert!(matches!(err, ProtocolError::MalformedIo(ref msg) if msg.contains("wrong version")));
}

#[tokio::test]
async fn truncated_body_is_a_framing_error() {
    let file = dump_file(&REPLY_FRAME[..10]);
    let err = OspfFetcher::dump(file.path())
        .fetch_frames()
        .await
        .expect_err("body cut short");
    assert!(matches!(err, ProtocolError::MalformedIo(_)));
}

#[tokio::test]
async fn lsa_headers_skip_frames_without_lsa() {
    let mut bytes = REPLY_FRAME.to_vec();
    bytes.extend(lsa_frame(2));
    bytes.extend(lsa_frame(3));
    let file = dump_file(&bytes);

    let headers = OspfFetcher::dump(file.path())
        .fetch_lsa_headers()
        .await
        .expect("headers");
    assert_eq!(headers.len(), 2);
    let (change, lsa) = &headers[0];
    assert_eq!(change.interface, Ipv4Addr::new(192, 0, 2, 1));
    assert_eq!(change.area_id, 0);
    assert!(change.self_originated);
    assert_eq!(lsa.lsa_type, LsaType::Router);
    assert_eq!(lsa.advertising_router, Ipv4Addr::new(10, 0, 0, 1));
    assert_eq!(lsa.sequence, 0x8000_0001);
    assert_eq!(lsa.length, 36);
}

#[tokio::test]
async fn live_daemon_frames_end_when_it_goes_quiet() {
    let (client, mut daemon) = tokio::io::duplex(4096);
    let daemon = tokio::spawn(async move {
        let mut request = [0u8; 12];
        daemon.read_exact(&mut request).await.expect("request");
        daemon.write_all(&REPLY_FRAME).await.expect("reply");
        daemon.write_all(&lsa_frame(2)).await.expect("lsa");
        // Hold the connection open; the fetcher stops on silence.
        let mut rest = Vec::new();
        let _ = daemon.read_to_end(&mut rest).await;
        request
    });

    let mut fetcher = OspfFetcher::new(Terminal::new(StreamLink::attached("ospfd", client)));
    fetcher.set_idle_timeout(Duration::from_millis(200));
    let frames = fetcher.fetch_frames().await.expect("frames");
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[1].header.msg_type, 13);
    assert_eq!(daemon.await.expect("daemon"), SYNC_LSDB_REQUEST);
}

#[tokio::test]
async fn sync_session_requests_the_database_over_the_shared_engine() {
    let (client, mut daemon) = tokio::io::duplex(4096);
    let daemon = tokio::spawn(async move {
        let mut request = [0u8; 12];
        daemon.read_exact(&mut request).await.expect("request");
        daemon.write_all(&REPLY_FRAME[..6]).await.expect("header");
        daemon.write_all(&REPLY_FRAME[6..]).await.expect("body");
        daemon.write_all(&lsa_frame(2)).await.expect("lsa");
        let mut rest = Vec::new();
        let _ = daemon.read_to_end(&mut rest).await;
        request
    });

    let mut session = SyncSession::new(
        Terminal::new(StreamLink::attached("ospfd", client)),
        OspfCodec::new(),
    );
    session
        .start(Credentials::default())
        .await
        .expect("start");
    let reply = session.request(SYNC_LSDB_COMMAND).await.expect("reply frame");
    assert!(reply.is_success());
    assert_eq!(reply.bytes(), Some(REPLY_FRAME.as_slice()));

    let frames = read_frames(session.transport_mut(), &OspfCodec::new(), Duration::from_millis(200))
        .await
        .expect("update frames");
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].to_bytes(), lsa_frame(2));
    session.stop().await.expect("stop");
    assert_eq!(daemon.await.expect("daemon"), SYNC_LSDB_REQUEST);
}

#[tokio::test]
async fn captured_batch_reads_back_from_the_dump() {
    let (client, mut daemon) = tokio::io::duplex(4096);
    tokio::spawn(async move {
        let mut request = [0u8; 12];
        daemon.read_exact(&mut request).await.expect("request");
        daemon.write_all(&REPLY_FRAME).await.expect("reply");
        daemon.write_all(&lsa_frame(2)).await.expect("lsa");
        daemon.write_all(&lsa_frame(3)).await.expect("lsa");
        let mut rest = Vec::new();
        let _ = daemon.read_to_end(&mut rest).await;
    });

    let dir = tempfile::tempdir().expect("tempdir");
    let capture = dir.path().join("lsdb.dump");
    let mut fetcher = OspfFetcher::new(Terminal::new(StreamLink::attached("ospfd", client)));
    fetcher.set_idle_timeout(Duration::from_millis(200));
    fetcher.set_capture_file(&capture);
    let live = fetcher.fetch_frames().await.expect("live frames");
    assert_eq!(live.len(), 3);

    let replayed = OspfFetcher::dump(&capture)
        .fetch_frames()
        .await
        .expect("dumped frames");
    assert_eq!(replayed, live);

    let copy = dir.path().join("copy.dump");
    write_dump(&replayed[1..], &copy).await.expect("write dump");
    let headers = OspfFetcher::dump(&copy)
        .fetch_lsa_headers()
        .await
        .expect("headers");
    assert_eq!(headers.len(), 2);
}
