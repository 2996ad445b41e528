use std::time::Duration;

use lens_jsonrpc::{Endpoint, Error, Id, ProtocolErrorKind, WaitOnTimeout};
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;

fn parse_line(line: &str) -> Value {
    serde_json::from_str(line).expect("valid json")
}

#[tokio::test]
async fn wait_returns_ok_none_when_endpoint_has_no_child() {
    let (near, _far) = tokio::io::duplex(64);
    let (near_read, near_write) = tokio::io::split(near);

    let mut endpoint = Endpoint::connect_io(near_read, near_write)
        .await
        .expect("connect");
    let status = endpoint.wait().await.expect("wait ok");
    assert!(status.is_none());
}

#[tokio::test]
async fn wait_with_timeout_returns_ok_none_when_endpoint_has_no_child() {
    let (near, _far) = tokio::io::duplex(64);
    let (near_read, near_write) = tokio::io::split(near);

    let mut endpoint = Endpoint::connect_io(near_read, near_write)
        .await
        .expect("connect");
    let status = endpoint
        .wait_with_timeout(Duration::from_millis(1), WaitOnTimeout::ReturnError)
        .await
        .expect("wait ok");
    assert!(status.is_none());
}

#[tokio::test]
async fn request_roundtrip_over_duplex() {
    let (near, far) = tokio::io::duplex(1024);
    let (near_read, near_write) = tokio::io::split(near);
    let (far_read, mut far_write) = tokio::io::split(far);

    let mut peer_task = tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(far_read).lines();
        let line = lines
            .next_line()
            .await
            .expect("read ok")
            .expect("request line");

        let msg = parse_line(&line);
        assert_eq!(msg["jsonrpc"], "2.0");
        assert_eq!(msg["method"], "demo/request");
        assert_eq!(msg["params"], serde_json::json!({ "x": 1 }));
        let id = msg["id"].clone();

        let response = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": { "ok": true },
        });
        let mut out = serde_json::to_string(&response).unwrap();
        out.push('\n');
        far_write.write_all(out.as_bytes()).await.unwrap();
        far_write.flush().await.unwrap();
    });

    let endpoint = Endpoint::connect_io(near_read, near_write)
        .await
        .expect("connect");
    let result = endpoint
        .request("demo/request", serde_json::json!({ "x": 1 }))
        .await
        .expect("request ok");
    assert_eq!(result, serde_json::json!({ "ok": true }));

    tokio::time::timeout(Duration::from_secs(1), &mut peer_task)
        .await
        .expect("peer task completed")
        .expect("peer task ok");
}

#[tokio::test]
async fn drop_closes_write_end_even_when_handle_is_cloned() {
    let (near, far) = tokio::io::duplex(64);
    let (near_read, near_write) = tokio::io::split(near);
    let (mut far_read, _far_write) = tokio::io::split(far);

    let endpoint = Endpoint::connect_io(near_read, near_write)
        .await
        .expect("connect");
    let handle = endpoint.handle();
    drop(endpoint);

    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(1), far_read.read(&mut buf))
        .await
        .expect("peer read completed")
        .expect("peer read ok");
    assert_eq!(n, 0, "peer should observe EOF after endpoint drop");

    let err = handle
        .notify("demo/notify", None)
        .await
        .expect_err("cloned handle should be closed after endpoint drop");
    assert!(matches!(
        err,
        Error::Protocol(ref protocol) if protocol.kind == ProtocolErrorKind::Closed
    ));
}

#[tokio::test]
async fn handles_peer_request_and_responds() {
    let (near, far) = tokio::io::duplex(1024);
    let (near_read, near_write) = tokio::io::split(near);
    let (far_read, mut far_write) = tokio::io::split(far);

    let mut peer_task = tokio::spawn(async move {
        // Send peer->endpoint request (string id).
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": "abc",
            "method": "demo/ping",
            "params": { "n": 42 },
        });
        let mut out = serde_json::to_string(&request).unwrap();
        out.push('\n');
        far_write.write_all(out.as_bytes()).await.unwrap();
        far_write.flush().await.unwrap();

        let mut lines = tokio::io::BufReader::new(far_read).lines();
        let line = lines
            .next_line()
            .await
            .expect("read ok")
            .expect("response line");
        let msg = parse_line(&line);
        assert_eq!(msg["jsonrpc"], "2.0");
        assert_eq!(msg["id"], "abc");
        assert_eq!(msg["result"], serde_json::json!({ "pong": true }));
    });

    let mut endpoint = Endpoint::connect_io(near_read, near_write)
        .await
        .expect("connect");
    let _ = endpoint.take_notifications();
    let mut requests = endpoint.take_requests().expect("requests rx");

    let handler_task = tokio::spawn(async move {
        let req = requests.recv().await.expect("incoming request");
        assert_eq!(req.method, "demo/ping");
        assert_eq!(req.params, Some(serde_json::json!({ "n": 42 })));
        assert_eq!(req.id, Id::String("abc".to_string()));
        req.respond_ok(serde_json::json!({ "pong": true }))
            .await
            .expect("respond ok");
    });

    tokio::time::timeout(Duration::from_secs(1), handler_task)
        .await
        .expect("handler completed")
        .expect("handler ok");

    tokio::time::timeout(Duration::from_secs(1), &mut peer_task)
        .await
        .expect("peer task completed")
        .expect("peer task ok");
}

#[tokio::test]
async fn responds_invalid_request_when_peer_sends_invalid_id() {
    let (near, far) = tokio::io::duplex(1024);
    let (near_read, near_write) = tokio::io::split(near);
    let (far_read, mut far_write) = tokio::io::split(far);

    let mut peer_task = tokio::spawn(async move {
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": {},
            "method": "demo/ping",
        });
        let mut out = serde_json::to_string(&request).unwrap();
        out.push('\n');
        far_write.write_all(out.as_bytes()).await.unwrap();
        far_write.flush().await.unwrap();

        let mut lines = tokio::io::BufReader::new(far_read).lines();
        let line = lines
            .next_line()
            .await
            .expect("read ok")
            .expect("response line");

        let msg = parse_line(&line);
        assert_eq!(msg["jsonrpc"], "2.0");
        assert!(msg["id"].is_null());
        assert_eq!(msg["error"]["code"], serde_json::json!(-32600));
        assert_eq!(msg["error"]["message"], "invalid request id");
    });

    let _endpoint = Endpoint::connect_io(near_read, near_write)
        .await
        .expect("connect");

    tokio::time::timeout(Duration::from_secs(1), &mut peer_task)
        .await
        .expect("peer task completed")
        .expect("peer task ok");
}

#[tokio::test]
async fn notify_omits_params_when_none() {
    let (near, far) = tokio::io::duplex(1024);
    let (near_read, near_write) = tokio::io::split(near);
    let (far_read, _far_write) = tokio::io::split(far);

    let mut peer_task = tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(far_read).lines();
        let line = lines
            .next_line()
            .await
            .expect("read ok")
            .expect("notification line");

        let msg = parse_line(&line);
        assert_eq!(msg["jsonrpc"], "2.0");
        assert_eq!(msg["method"], "demo/notify");
        assert!(msg.get("id").is_none());
        assert!(msg.get("params").is_none());
    });

    let endpoint = Endpoint::connect_io(near_read, near_write)
        .await
        .expect("connect");
    endpoint
        .notify("demo/notify", None)
        .await
        .expect("notify ok");

    tokio::time::timeout(Duration::from_secs(1), &mut peer_task)
        .await
        .expect("peer task completed")
        .expect("peer task ok");
}

#[tokio::test]
async fn request_optional_omits_params_when_null() {
    let (near, far) = tokio::io::duplex(1024);
    let (near_read, near_write) = tokio::io::split(near);
    let (far_read, mut far_write) = tokio::io::split(far);

    let mut peer_task = tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(far_read).lines();
        let line = lines
            .next_line()
            .await
            .expect("read ok")
            .expect("request line");

        let msg = parse_line(&line);
        assert_eq!(msg["jsonrpc"], "2.0");
        assert_eq!(msg["method"], "demo/noparams");
        assert!(msg.get("params").is_none());
        let id = msg["id"].clone();

        let response = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": { "ok": true },
        });
        let mut out = serde_json::to_string(&response).unwrap();
        out.push('\n');
        far_write.write_all(out.as_bytes()).await.unwrap();
        far_write.flush().await.unwrap();
    });

    let endpoint = Endpoint::connect_io(near_read, near_write)
        .await
        .expect("connect");
    let result = endpoint
        .request_optional("demo/noparams", Some(Value::Null))
        .await
        .expect("request ok");
    assert_eq!(result, serde_json::json!({ "ok": true }));

    tokio::time::timeout(Duration::from_secs(1), &mut peer_task)
        .await
        .expect("peer task completed")
        .expect("peer task ok");
}

#[tokio::test]
async fn responds_invalid_request_when_jsonrpc_is_not_2_0() {
    let (near, far) = tokio::io::duplex(1024);
    let (near_read, near_write) = tokio::io::split(near);
    let (far_read, mut far_write) = tokio::io::split(far);

    let mut peer_task = tokio::spawn(async move {
        let request = serde_json::json!({
            "jsonrpc": "1.0",
            "id": 1,
            "method": "demo/ping",
        });
        let mut out = serde_json::to_string(&request).unwrap();
        out.push('\n');
        far_write.write_all(out.as_bytes()).await.unwrap();
        far_write.flush().await.unwrap();

        let mut lines = tokio::io::BufReader::new(far_read).lines();
        let line = lines
            .next_line()
            .await
            .expect("read ok")
            .expect("response line");
        let msg = parse_line(&line);
        assert_eq!(msg["jsonrpc"], "2.0");
        assert_eq!(msg["id"], 1);
        assert_eq!(msg["error"]["code"], serde_json::json!(-32600));
        assert_eq!(msg["error"]["message"], "invalid jsonrpc version");
    });

    let _endpoint = Endpoint::connect_io(near_read, near_write)
        .await
        .expect("connect");

    tokio::time::timeout(Duration::from_secs(1), &mut peer_task)
        .await
        .expect("peer task completed")
        .expect("peer task ok");
}

#[tokio::test]
async fn request_fails_when_peer_sends_invalid_response_structure() {
    let (near, far) = tokio::io::duplex(1024);
    let (near_read, near_write) = tokio::io::split(near);
    let (far_read, mut far_write) = tokio::io::split(far);

    let mut peer_task = tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(far_read).lines();
        let line = lines
            .next_line()
            .await
            .expect("read ok")
            .expect("request line");
        let msg = parse_line(&line);
        let id = msg["id"].clone();

        let response = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": { "ok": true },
            "error": { "code": -32000, "message": "should not have both" }
        });
        let mut out = serde_json::to_string(&response).unwrap();
        out.push('\n');
        far_write.write_all(out.as_bytes()).await.unwrap();
        far_write.flush().await.unwrap();
    });

    let endpoint = Endpoint::connect_io(near_read, near_write)
        .await
        .expect("connect");
    let err = endpoint
        .request("demo/request", serde_json::json!({}))
        .await
        .expect_err("request should fail");
    assert!(matches!(err, Error::Protocol(_)));

    tokio::time::timeout(Duration::from_secs(1), &mut peer_task)
        .await
        .expect("peer task completed")
        .expect("peer task ok");
}

#[tokio::test]
async fn reader_eof_closes_endpoint_write_end() {
    let (near, far) = tokio::io::duplex(64);
    let (near_read, near_write) = tokio::io::split(near);

    let endpoint = Endpoint::connect_io(near_read, near_write)
        .await
        .expect("connect");
    let handle = endpoint.handle();

    // Closing the peer stream hits EOF in the reader task and closes the endpoint.
    drop(far);
    tokio::time::timeout(Duration::from_secs(1), async {
        while !handle.is_closed() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("endpoint should close after peer EOF");

    let err = handle
        .notify("demo/notify", None)
        .await
        .expect_err("closed endpoint should reject writes after peer EOF");
    assert!(matches!(
        err,
        Error::Protocol(ref protocol) if protocol.kind == ProtocolErrorKind::Closed
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn wait_closes_child_stdin_so_child_can_exit() {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c").arg("cat > /dev/null");

    let mut endpoint = Endpoint::spawn_command(cmd).await.expect("spawn");

    let status = tokio::time::timeout(Duration::from_secs(1), endpoint.wait())
        .await
        .expect("wait completed")
        .expect("wait ok")
        .expect("exit status");

    assert!(status.success(), "child exited unsuccessfully: {status}");
}

#[cfg(unix)]
#[tokio::test]
async fn wait_with_timeout_can_return_timeout_error() {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c").arg("exec sleep 10");

    let mut endpoint = Endpoint::spawn_command(cmd).await.expect("spawn");

    let err = endpoint
        .wait_with_timeout(Duration::from_millis(10), WaitOnTimeout::ReturnError)
        .await
        .expect_err("expected wait timeout error");
    assert!(err.is_wait_timeout(), "err={err:?}");

    let mut child = endpoint.take_child().expect("child");
    child.start_kill().expect("kill");
    tokio::time::timeout(Duration::from_secs(1), child.wait())
        .await
        .expect("child wait completed")
        .expect("child wait ok");
}

#[cfg(unix)]
#[tokio::test]
async fn wait_with_timeout_can_kill_child_on_timeout() {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c").arg("exec sleep 10");

    let mut endpoint = Endpoint::spawn_command(cmd).await.expect("spawn");

    let status = endpoint
        .wait_with_timeout(
            Duration::from_millis(10),
            WaitOnTimeout::Kill {
                kill_timeout: Duration::from_secs(1),
            },
        )
        .await
        .expect("wait ok")
        .expect("exit status");

    assert!(
        !status.success(),
        "expected killed child to exit unsuccessfully: {status}"
    );
}
