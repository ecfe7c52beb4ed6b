//! Proxy and diff mode tests: a second in-process server plays the
//! upstream reference.

mod support;

use larch::clientconn::Mode;
use larch::doc;
use larch::document::Value;
use support::TestClient;
use support::TestServer;

fn ping() -> larch::document::Document {
    doc! {"ping" => Value::Int32(1), "$db" => Value::String("admin".into())}
}

/// Insert one document into a server's backend over the wire.
async fn seed(server: &TestServer, id: i32) {
    let mut client = TestClient::connect(server.addr).await;
    let mut documents = larch::document::Array::new();
    documents.push(Value::Document(doc! {"_id" => Value::Int32(id)}));
    let (_, _, response) = client
        .command(doc! {
            "insert" => Value::String("items".into()),
            "documents" => Value::Array(documents),
            "$db" => Value::String("test".into()),
        })
        .await;
    assert_eq!(response.get("ok"), Some(&Value::Double(1.0)));
}

fn find() -> larch::document::Document {
    doc! {
        "find" => Value::String("items".into()),
        "$db" => Value::String("test".into()),
    }
}

fn first_batch_len(response: &larch::document::Document) -> usize {
    let Some(Value::Document(cursor)) = response.get("cursor") else {
        panic!("missing cursor in {response}");
    };
    let Some(Value::Array(batch)) = cursor.get("firstBatch") else {
        panic!("missing firstBatch in {response}");
    };
    batch.len()
}

#[tokio::test]
async fn proxy_mode_returns_the_upstream_response() {
    let upstream = TestServer::start().await;
    seed(&upstream, 1).await;

    let proxy = TestServer::start_with(Mode::Proxy, Some(upstream.addr.to_string()), None).await;

    let mut client = TestClient::connect(proxy.addr).await;
    let (_, _, response) = client.command(find()).await;

    // The proxy server's own backend is empty; the document proves the
    // response came from the upstream.
    assert_eq!(first_batch_len(&response), 1);
}

#[tokio::test]
async fn diff_normal_returns_the_local_response() {
    let upstream = TestServer::start().await;
    seed(&upstream, 1).await;

    let server =
        TestServer::start_with(Mode::DiffNormal, Some(upstream.addr.to_string()), None).await;

    let mut client = TestClient::connect(server.addr).await;
    let (request_id, header, response) = client.command(find()).await;

    assert_eq!(header.response_to, request_id);
    // Local backend is empty; the diverging upstream response is only
    // logged, not returned.
    assert_eq!(first_batch_len(&response), 0);
}

#[tokio::test]
async fn diff_proxy_returns_the_upstream_response() {
    let upstream = TestServer::start().await;
    seed(&upstream, 1).await;

    let server =
        TestServer::start_with(Mode::DiffProxy, Some(upstream.addr.to_string()), None).await;

    let mut client = TestClient::connect(server.addr).await;
    let (_, _, response) = client.command(find()).await;

    assert_eq!(first_batch_len(&response), 1);
}

#[tokio::test]
async fn diff_modes_serve_agreeing_responses_transparently() {
    let upstream = TestServer::start().await;
    let server =
        TestServer::start_with(Mode::DiffNormal, Some(upstream.addr.to_string()), None).await;

    let mut client = TestClient::connect(server.addr).await;
    for _ in 0..3 {
        let (request_id, header, response) = client.command(ping()).await;
        assert_eq!(header.response_to, request_id);
        assert_eq!(response.get("ok"), Some(&Value::Double(1.0)));
    }
}

#[tokio::test]
async fn unreachable_upstream_degrades_to_a_synthesized_error() {
    // Nothing listens on this address.
    let server =
        TestServer::start_with(Mode::Proxy, Some("127.0.0.1:1".to_owned()), None).await;

    let mut client = TestClient::connect(server.addr).await;
    let (_, header, response) = client.command(ping()).await;

    // The client connection survives and receives an error document.
    assert_eq!(response.get("ok"), Some(&Value::Double(0.0)));
    assert_eq!(header.op_code, larch::wire::OpCode::Msg);

    let (_, _, response) = client.command(ping()).await;
    assert_eq!(response.get("ok"), Some(&Value::Double(0.0)));
}

#[tokio::test]
async fn proxy_reuses_its_upstream_connection() {
    let upstream = TestServer::start().await;
    let server = TestServer::start_with(Mode::Proxy, Some(upstream.addr.to_string()), None).await;

    let mut client = TestClient::connect(server.addr).await;
    for _ in 0..5 {
        let (_, _, response) = client.command(ping()).await;
        assert_eq!(response.get("ok"), Some(&Value::Double(1.0)));
    }
}
