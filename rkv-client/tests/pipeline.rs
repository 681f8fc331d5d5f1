mod support;

use std::time::Duration;

use bytes::Bytes;
use rkv_client::{Client, ClientConfig, ConnectionState};
use rkv_proto::{Command, CommandArg};

use support::{duplex_connector, duplex_connector_with_capacity, fast_config, within};

#[tokio::test]
async fn byte_payload_is_written_as_header_then_one_frame_per_argument() {
    let (connector, mut accept) = duplex_connector();
    let client = Client::with_connector(fast_config(), connector, 1);
    client.connect();
    let mut conn = accept.accept().await;
    within(client.wait_ready()).await.expect("ready");

    let payload = Bytes::from(vec![b'x'; 40_000]);
    let set = client.send(
        Command::new("SET")
            .arg("k")
            .arg(CommandArg::Bytes(payload.clone())),
    );
    let args = within(conn.read_command()).await.expect("read");
    assert_eq!(args[2].len(), payload.len());
    conn.write_simple("OK").await;
    assert!(within(set).await.is_ok());

    let writes = accept.writes();
    assert_eq!(writes[0], b"*3\r\n$3\r\nSET\r\n");
    assert_eq!(writes[1..4].concat(), b"$1\r\nk\r\n");
    assert_eq!(writes[4], b"$40000\r\n");
    assert_eq!(writes[5], payload.as_ref());
    assert_eq!(writes[6], b"\r\n");
    assert_eq!(writes.len(), 7);
}

#[tokio::test]
async fn short_text_command_is_one_write() {
    let (connector, mut accept) = duplex_connector();
    let client = Client::with_connector(fast_config(), connector, 1);
    let get = client.send(Command::new("GET").arg("k"));
    let mut conn = accept.accept().await;

    assert_eq!(conn.expect_command().await, ["GET", "k"]);
    conn.write_nil().await;
    assert!(within(get).await.expect("get").is_nil());
    assert_eq!(accept.writes(), vec![b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n".to_vec()]);
}

#[tokio::test]
async fn pipeline_coalesces_into_one_write_and_keeps_reply_order() {
    let (connector, mut accept) = duplex_connector();
    let client = Client::with_connector(fast_config(), connector, 1);
    client.connect();
    let mut conn = accept.accept().await;
    within(client.wait_ready()).await.expect("ready");

    let mut pipeline = client.pipeline();
    pipeline
        .add(Command::new("SET").arg("a").arg("1"))
        .add(Command::new("INCR").arg("a"))
        .add(Command::new("GET").arg("a"));
    assert_eq!(pipeline.len(), 3);

    let server = async {
        assert_eq!(conn.expect_command().await, ["SET", "a", "1"]);
        assert_eq!(conn.expect_command().await, ["INCR", "a"]);
        assert_eq!(conn.expect_command().await, ["GET", "a"]);
        conn.write_raw(b"+OK\r\n:2\r\n$1\r\n2\r\n").await;
    };
    let (results, ()) = tokio::join!(within(pipeline.execute()), server);

    let results: Vec<_> = results.into_iter().map(|r| r.expect("reply")).collect();
    assert_eq!(results[0].as_str(), Some("OK"));
    assert_eq!(results[1].as_integer(), Some(2));
    assert_eq!(results[2].as_str(), Some("2"));
    assert_eq!(accept.writes().len(), 1);
}

#[tokio::test]
async fn dropped_pipeline_still_flushes_its_commands() {
    let (connector, mut accept) = duplex_connector();
    let client = Client::with_connector(fast_config(), connector, 1);
    client.connect();
    let mut conn = accept.accept().await;
    within(client.wait_ready()).await.expect("ready");

    {
        let mut pipeline = client.pipeline();
        pipeline.add(Command::new("PING"));
    }
    let echo = client.send(Command::new("ECHO").arg("hi"));

    assert_eq!(conn.expect_command().await, ["PING"]);
    assert_eq!(conn.expect_command().await, ["ECHO", "hi"]);
    conn.write_raw(b"+PONG\r\n$2\r\nhi\r\n").await;
    assert_eq!(within(echo).await.expect("echo").as_str(), Some("hi"));
    assert_eq!(accept.writes().len(), 2);
}

#[tokio::test]
async fn should_buffer_follows_the_high_water_mark() {
    let (connector, mut accept) = duplex_connector_with_capacity(64);
    let config = ClientConfig {
        write_high_water_mark: 128,
        ..fast_config()
    };
    let client = Client::with_connector(config, connector, 1);
    client.connect();
    let mut conn = accept.accept().await;
    within(client.wait_ready()).await.expect("ready");
    assert!(!client.should_buffer());

    let set = client.send(Command::new("SET").arg("k").arg("v".repeat(1_000)));
    within(async {
        while !client.should_buffer() {
            tokio::task::yield_now().await;
        }
    })
    .await;

    assert_eq!(conn.expect_command().await.len(), 3);
    within(async {
        while client.should_buffer() {
            tokio::task::yield_now().await;
        }
    })
    .await;
    conn.write_simple("OK").await;
    assert!(within(set).await.is_ok());
}

#[tokio::test]
async fn request_timeout_ignores_commands_held_in_a_batch() {
    let (connector, mut accept) = duplex_connector();
    let config = ClientConfig {
        request_timeout: Some(Duration::from_millis(100)),
        ..fast_config()
    };
    let client = Client::with_connector(config, connector, 1);
    client.connect();
    let mut conn = accept.accept().await;
    within(client.wait_ready()).await.expect("ready");

    client.begin_batch();
    let set = client.send(Command::new("SET").arg("k").arg("v"));
    assert!(conn.is_quiet(Duration::from_millis(300)).await);
    assert_eq!(client.state(), ConnectionState::Ready);

    client.end_batch();
    assert_eq!(conn.expect_command().await, ["SET", "k", "v"]);
    conn.write_simple("OK").await;
    assert_eq!(within(set).await.expect("set").as_str(), Some("OK"));
    assert_eq!(client.state(), ConnectionState::Ready);
}
