use serde_json::{json, Value};
use socket_io_plugin::SocketIoPlugin;
use std::time::Duration;
use tokio::time::timeout;
use warp::ws::Message;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

async fn recv_text(client: &mut warp::test::WsClient) -> String {
    let message = timeout(RECV_TIMEOUT, client.recv())
        .await
        .expect("timed out waiting for a websocket message")
        .expect("websocket closed unexpectedly");
    message
        .to_str()
        .expect("expected a text message")
        .to_owned()
}

fn extract_sid(payload: &str) -> String {
    let start = payload.find("0{").expect("open packet in payload");
    let open: Value = serde_json::from_str(&payload[start + 1..]).expect("open packet json");
    open["sid"].as_str().expect("sid").to_owned()
}

#[tokio::test]
async fn emits_events_to_clients_on_a_custom_path() {
    let plugin = SocketIoPlugin::with_path("/custompath", |io| {
        io.namespace("/", |socket| {
            let _ = socket.send("hello", vec![json!("world")]);
        });
    });
    let routes = plugin.filter();

    let mut client = warp::test::ws()
        .path("/custompath/?EIO=3&transport=websocket")
        .handshake(routes)
        .await
        .expect("websocket handshake");

    let open = recv_text(&mut client).await;
    assert!(open.starts_with('0'), "expected an open packet, got {}", open);
    assert!(open.contains("\"sid\""));

    client.send(Message::text("40")).await;
    assert_eq!(recv_text(&mut client).await, "40");

    assert_eq!(recv_text(&mut client).await, r#"42["hello","world"]"#);

    // exactly one hello event
    let extra = timeout(Duration::from_millis(300), client.recv()).await;
    assert!(extra.is_err(), "expected no further events, got {:?}", extra);
}

#[tokio::test]
async fn replies_to_client_events() {
    let plugin = SocketIoPlugin::new(|io| {
        io.namespace("/", |socket| {
            let reply_socket = socket.clone();
            socket.on("ping", move |_args| {
                let _ = reply_socket.send("pong", vec![]);
            });
        });
    });
    let routes = plugin.filter();

    let mut client = warp::test::ws()
        .path("/socket.io/?EIO=3&transport=websocket")
        .handshake(routes)
        .await
        .expect("websocket handshake");

    let _open = recv_text(&mut client).await;
    client.send(Message::text("40")).await;
    assert_eq!(recv_text(&mut client).await, "40");

    client.send(Message::text(r#"42["ping"]"#)).await;
    assert_eq!(recv_text(&mut client).await, r#"42["pong"]"#);

    // exactly one pong
    let extra = timeout(Duration::from_millis(300), client.recv()).await;
    assert!(extra.is_err(), "expected no further events, got {:?}", extra);
}

#[tokio::test]
async fn handshake_query_parameters_reach_the_namespace_handler() {
    let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
    let plugin = SocketIoPlugin::new(move |io| {
        io.namespace("/", move |socket| {
            let _ = sender.send(socket.handshake().query.clone());
        });
    });
    let routes = plugin.filter();

    let mut client = warp::test::ws()
        .path("/socket.io/?EIO=3&transport=websocket&x=42")
        .handshake(routes)
        .await
        .expect("websocket handshake");

    let _open = recv_text(&mut client).await;
    client.send(Message::text("40")).await;
    let _ack = recv_text(&mut client).await;

    let query = timeout(RECV_TIMEOUT, receiver.recv())
        .await
        .expect("handler did not run")
        .expect("channel closed");
    assert_eq!(query.get("x"), Some(&"42".to_owned()));
    assert_eq!(query.get("transport"), Some(&"websocket".to_owned()));
}

#[tokio::test]
async fn connecting_to_an_unregistered_namespace_fails() {
    let plugin = SocketIoPlugin::new(|io| {
        io.namespace("/", |_socket| {});
    });
    let routes = plugin.filter();

    let mut client = warp::test::ws()
        .path("/socket.io/?EIO=3&transport=websocket")
        .handshake(routes)
        .await
        .expect("websocket handshake");

    let _open = recv_text(&mut client).await;
    client.send(Message::text("40/nope,")).await;
    assert_eq!(
        recv_text(&mut client).await,
        r#"44/nope,"Invalid namespace""#
    );
}

#[tokio::test]
async fn namespaces_are_isolated_per_connection() {
    let plugin = SocketIoPlugin::new(|io| {
        io.namespace("/", |socket| {
            let _ = socket.send("root", vec![]);
        });
        io.namespace("/blah", |socket| {
            let reply_socket = socket.clone();
            socket.on("echo", move |args| {
                let _ = reply_socket.send("echoed", args);
            });
        });
    });
    let routes = plugin.filter();

    let mut client = warp::test::ws()
        .path("/socket.io/?EIO=3&transport=websocket")
        .handshake(routes)
        .await
        .expect("websocket handshake");

    let _open = recv_text(&mut client).await;
    client.send(Message::text("40/blah,")).await;
    assert_eq!(recv_text(&mut client).await, "40/blah,");

    client.send(Message::text(r#"42/blah,["echo","x"]"#)).await;
    assert_eq!(recv_text(&mut client).await, r#"42/blah,["echoed","x"]"#);
}

#[tokio::test]
async fn polling_handshake_and_data_exchange() {
    let plugin = SocketIoPlugin::new(|io| {
        io.namespace("/", |socket| {
            let _ = socket.send("hello", vec![json!("world")]);
        });
    });
    let routes = plugin.filter();

    let response = warp::test::request()
        .method("GET")
        .path("/socket.io/?EIO=3&transport=polling")
        .reply(&routes)
        .await;
    assert_eq!(response.status(), 200);
    let body = std::str::from_utf8(response.body()).unwrap().to_owned();
    assert!(body.contains("\"sid\""), "open packet missing: {}", body);
    let sid = extract_sid(&body);

    // the client joins the root namespace over the write channel
    let post = warp::test::request()
        .method("POST")
        .path(&format!("/socket.io/?EIO=3&transport=polling&sid={}", sid))
        .body("2:40")
        .reply(&routes)
        .await;
    assert_eq!(post.status(), 200);
    assert_eq!(std::str::from_utf8(post.body()).unwrap(), "ok");

    // drain until both the connect ack and the event have arrived
    let mut drained = String::new();
    for _ in 0..3 {
        if drained.contains("40") && drained.contains(r#"42["hello","world"]"#) {
            break;
        }
        let poll = warp::test::request()
            .method("GET")
            .path(&format!("/socket.io/?EIO=3&transport=polling&sid={}", sid))
            .reply(&routes)
            .await;
        assert_eq!(poll.status(), 200);
        drained.push_str(std::str::from_utf8(poll.body()).unwrap());
    }
    assert!(drained.contains("40"), "connect ack missing: {}", drained);
    assert!(
        drained.contains(r#"42["hello","world"]"#),
        "event missing: {}",
        drained
    );
}

#[tokio::test]
async fn rejects_malformed_polling_requests() {
    let plugin = SocketIoPlugin::new(|io| {
        io.namespace("/", |_socket| {});
    });
    let routes = plugin.filter();

    // unknown session id
    let response = warp::test::request()
        .method("GET")
        .path("/socket.io/?EIO=3&transport=polling&sid=nope")
        .reply(&routes)
        .await;
    assert_eq!(response.status(), 400);
    let body: Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(body["message"], "Session ID unknown");

    // the handshake must be a GET
    let response = warp::test::request()
        .method("POST")
        .path("/socket.io/?EIO=3&transport=polling")
        .body("1:2")
        .reply(&routes)
        .await;
    assert_eq!(response.status(), 400);
    let body: Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(body["message"], "Bad handshake method");

    // the websocket transport never rides on plain HTTP
    let response = warp::test::request()
        .method("GET")
        .path("/socket.io/?EIO=3&transport=websocket")
        .reply(&routes)
        .await;
    assert_eq!(response.status(), 400);
    let body: Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(body["message"], "Bad request");

    // unrecognized transport names
    let response = warp::test::request()
        .method("GET")
        .path("/socket.io/?EIO=3&transport=flying")
        .reply(&routes)
        .await;
    assert_eq!(response.status(), 400);
    let body: Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(body["message"], "Transport unknown");

    // requests outside the mount path never reach the engine
    let response = warp::test::request()
        .method("GET")
        .path("/elsewhere")
        .reply(&routes)
        .await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn serves_websocket_clients_over_tcp() {
    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    type TcpWsStream = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn expect_text(stream: &mut TcpWsStream) -> String {
        match timeout(RECV_TIMEOUT, stream.next())
            .await
            .expect("timed out waiting for a websocket message")
            .expect("stream ended unexpectedly")
            .expect("websocket error")
        {
            WsMessage::Text(text) => text,
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    let plugin = SocketIoPlugin::with_path("/custompath", |io| {
        io.namespace("/", |socket| {
            let _ = socket.send("hello", vec![json!("world")]);
        });
    });
    let (addr, server) = warp::serve(plugin.filter())
        .try_bind_ephemeral(([127, 0, 0, 1], 0))
        .expect("bind an ephemeral port");
    tokio::spawn(server);

    let url = format!("ws://{}/custompath/?EIO=3&transport=websocket", addr);
    let (mut stream, _response) = timeout(RECV_TIMEOUT, tokio_tungstenite::connect_async(url))
        .await
        .expect("timed out connecting")
        .expect("websocket connect");

    let open = expect_text(&mut stream).await;
    assert!(open.starts_with('0'), "expected an open packet, got {}", open);

    stream
        .send(WsMessage::Text("40".to_owned()))
        .await
        .expect("send connect");
    assert_eq!(expect_text(&mut stream).await, "40");
    assert_eq!(expect_text(&mut stream).await, r#"42["hello","world"]"#);
}
