//! HTTP round trips against a spawned server

use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;
use trellis_core::object::BinaryCodec;
use trellis_core::{
    ChangedPath, ClientCheckoutSpec, CommitEntry, Datastore, EngineConfig, FileEntry, FolderEntry,
    FolderListing, MergeResult, ObjectReader, ObjectType, ObjectWriter, PushOutcome, PushQuery, PushQueryResponse,
    PushQueryResponseType, PushSpec, ServerCheckoutSpec,
};
use trellis_server::{TrellisHandler, ERROR_HEADER};

/// Spawn a server over a fresh data directory. Returns its address and the
/// directory guard.
async fn spawn_test_server() -> (SocketAddr, TempDir) {
    spawn_server_with_body_limit(EngineConfig::default().max_body_size).await
}

async fn spawn_server_with_body_limit(max_body_size: usize) -> (SocketAddr, TempDir) {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig {
        data_dir: dir.path().to_path_buf(),
        max_body_size,
        ..EngineConfig::default()
    };
    let handler = Arc::new(TrellisHandler::new(Datastore::open(&config).unwrap()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(s) => s,
                Err(_) => continue,
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = hyper::service::service_fn(move |req| {
                    let handler = handler.clone();
                    async move { Ok::<_, Infallible>(handler.handle(req).await) }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service)
                    .await;
            });
        }
    });

    (addr, dir)
}

/// Send a request over raw TCP. Returns (status, headers, body).
async fn send_request(
    addr: SocketAddr,
    path: &str,
    body: &[u8],
    headers: &[(&str, &str)],
) -> (u16, String, Vec<u8>) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let mut request = format!(
        "POST {path} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nConnection: close\r\nContent-Length: {len}\r\n",
        path = path,
        port = addr.port(),
        len = body.len()
    );
    for (key, value) in headers {
        request.push_str(&format!("{}: {}\r\n", key, value));
    }
    request.push_str("\r\n");

    stream.write_all(request.as_bytes()).await.unwrap();
    stream.write_all(body).await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();

    let split = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .unwrap_or(response.len());
    let head = String::from_utf8_lossy(&response[..split]).to_string();
    let mut body = response.get(split + 4..).unwrap_or_default().to_vec();
    if head.to_ascii_lowercase().contains("transfer-encoding: chunked") {
        body = dechunk(&body);
    }
    let status = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    (status, head, body)
}

/// Strip chunked transfer-encoding framing.
fn dechunk(mut raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let line_end = raw.windows(2).position(|w| w == b"\r\n").unwrap();
        let size_field = std::str::from_utf8(&raw[..line_end]).unwrap();
        let size = usize::from_str_radix(size_field.split(';').next().unwrap().trim(), 16).unwrap();
        raw = &raw[line_end + 2..];
        if size == 0 {
            return out;
        }
        out.extend_from_slice(&raw[..size]);
        raw = &raw[size + 2..];
    }
}

async fn push_stream(file: &FileEntry) -> Vec<u8> {
    let spec = PushSpec {
        org: "acme".into(),
        repo: "widgets".into(),
        branch_name: "feature".into(),
        base_commit_id: 1,
        new_head_commit_id: 2,
    };
    let listing = FolderListing::new("/", "feature", 2, vec![FolderEntry::file("a.txt", file.id.clone())]);
    let commit = CommitEntry::new(
        "feature",
        2,
        "ignored",
        "add a.txt",
        vec![ChangedPath::added("/a.txt", file.id.clone())],
    );
    let mut out = ObjectWriter::new(Vec::new());
    out.write_object(ObjectType::PushSpec, "feature", &spec).await.unwrap();
    out.write_object(ObjectType::File, &file.id, file).await.unwrap();
    out.write_object(ObjectType::Folder, "/", &listing).await.unwrap();
    out.write_object(ObjectType::Commit, "2", &commit).await.unwrap();
    out.into_inner()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_health() {
    let (addr, _dir) = spawn_test_server().await;
    let (status, _, body) = send_request(addr, "/health", b"", &[]).await;
    assert_eq!(status, 200);
    assert_eq!(body, br#"{"status":"ok"}"#);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_push_then_merge_then_checkout_query() {
    let (addr, _dir) = spawn_test_server().await;
    let (status, _, _) = send_request(addr, "/acme/widgets/createRepo", b"", &[]).await;
    assert_eq!(status, 200);

    let file = FileEntry::full_from_contents(b"contents of a".to_vec());
    let query = PushQuery {
        org: "acme".into(),
        repo: "widgets".into(),
        branch_name: "feature".into(),
        base_commit_id: 1,
        new_head_commit_id: 2,
        file_ids: vec![file.id.clone()],
    };
    let (status, _, body) =
        send_request(addr, "/acme/widgets/pushQuery", &query.to_bytes().unwrap(), &[]).await;
    assert_eq!(status, 200);
    let response = PushQueryResponse::from_bytes(&body).unwrap();
    assert_eq!(response.response_type, PushQueryResponseType::Ok);
    assert!(response.file_ids_server_already_has.is_empty());

    let stream = push_stream(&file).await;
    let (status, _, body) = send_request(
        addr,
        "/acme/widgets/push",
        &stream,
        &[("X-Trellis-User", "alice")],
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(PushOutcome::from_bytes(&body).unwrap().new_head_commit_id, Some(2));

    let (status, _, body) = send_request(
        addr,
        "/acme/widgets/merge?branchName=feature&headCommitId=2",
        b"",
        &[],
    )
    .await;
    assert_eq!(status, 200);
    let mut reader = ObjectReader::new(body.as_slice());
    let header = reader.next_header().await.unwrap().unwrap();
    assert_eq!(header.object_type, ObjectType::MergeResult);
    let result: MergeResult = reader.read_object().await.unwrap();
    assert!(result.is_successful());

    let (status, _, body) = send_request(
        addr,
        "/acme/widgets/checkoutQuery?branchName=main&commitId=2&paths=/",
        b"",
        &[],
    )
    .await;
    assert_eq!(status, 200);
    let spec = ServerCheckoutSpec::from_bytes(&body).unwrap();
    assert_eq!(spec.all_file_ids_from_server, vec![file.id.clone()]);

    let (status, _, body) = send_request(
        addr,
        "/acme/widgets/log?branchName=feature&path=/&commitId=2",
        b"",
        &[],
    )
    .await;
    assert_eq!(status, 200);
    let mut reader = ObjectReader::new(body.as_slice());
    reader.next_header().await.unwrap().unwrap();
    let commit: CommitEntry = reader.read_object().await.unwrap();
    assert_eq!(commit.author_user_id, "alice");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_stale_push_reports_error_header() {
    let (addr, _dir) = spawn_test_server().await;
    send_request(addr, "/acme/widgets/createRepo", b"", &[]).await;
    let file = FileEntry::full_from_contents(b"x".to_vec());
    let stream = push_stream(&file).await;
    let user = [("X-Trellis-User", "alice")];
    let (status, _, _) = send_request(addr, "/acme/widgets/push", &stream, &user).await;
    assert_eq!(status, 200);

    let (status, head, _) = send_request(addr, "/acme/widgets/push", &stream, &user).await;
    assert_eq!(status, 500);
    let head = head.to_ascii_lowercase();
    assert!(head.contains(ERROR_HEADER));
    assert!(head.contains("got new folder with commit id 2 for branch at 2"));
}

async fn large_push_stream(org: &str, repo: &str, contents: &[u8]) -> Vec<u8> {
    let spec = PushSpec {
        org: org.into(),
        repo: repo.into(),
        branch_name: "feature".into(),
        base_commit_id: 1,
        new_head_commit_id: 2,
    };
    let listing = FolderListing::new("/", "feature", 2, vec![FolderEntry::file("big.bin", "big-file")]);
    let mut out = ObjectWriter::new(Vec::new());
    out.write_object(ObjectType::PushSpec, "feature", &spec).await.unwrap();
    out.write_record(ObjectType::LargeFileContents, "big-file", contents)
        .await
        .unwrap();
    out.write_object(ObjectType::File, "big-file", &FileEntry::large("big-file"))
        .await
        .unwrap();
    out.write_object(ObjectType::Folder, "/", &listing).await.unwrap();
    out.into_inner()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_large_file_round_trip_over_body_limit() {
    let (addr, _dir) = spawn_server_with_body_limit(64 * 1024).await;
    send_request(addr, "/acme/widgets/createRepo", b"", &[]).await;

    let contents: Vec<u8> = (0..512 * 1024).map(|i| (i % 241) as u8).collect();
    let stream = large_push_stream("acme", "widgets", &contents).await;
    let (status, _, body) = send_request(
        addr,
        "/acme/widgets/push",
        &stream,
        &[("X-Trellis-User", "alice")],
    )
    .await;
    assert_eq!(status, 200);
    let outcome = PushOutcome::from_bytes(&body).unwrap();
    assert_eq!(outcome.bytes_written, contents.len() as u64);

    let client = ClientCheckoutSpec {
        file_ids_client_needs: vec!["big-file".into()],
    };
    let (status, _, body) = send_request(
        addr,
        "/acme/widgets/checkout?branchName=feature&commitId=2&paths=/",
        &client.to_bytes().unwrap(),
        &[],
    )
    .await;
    assert_eq!(status, 200);

    let mut reader = ObjectReader::new(body.as_slice());
    let mut types = Vec::new();
    let mut large = Vec::new();
    while let Some(header) = reader.next_header().await.unwrap() {
        let payload = reader.read_payload().await.unwrap();
        if header.object_type == ObjectType::LargeFileContents {
            large = payload;
        }
        types.push(header.object_type);
    }
    assert_eq!(
        types,
        vec![ObjectType::Folder, ObjectType::LargeFileContents, ObjectType::File]
    );
    assert_eq!(large, contents);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_push_must_target_url_repo() {
    let (addr, _dir) = spawn_test_server().await;
    send_request(addr, "/acme/widgets/createRepo", b"", &[]).await;
    send_request(addr, "/beta/gadgets/createRepo", b"", &[]).await;

    let stream = large_push_stream("beta", "gadgets", b"small").await;
    let (status, head, _) = send_request(
        addr,
        "/acme/widgets/push",
        &stream,
        &[("X-Trellis-User", "alice")],
    )
    .await;
    assert_eq!(status, 400);
    assert!(head.to_ascii_lowercase().contains("push for beta/gadgets sent to acme/widgets"));

    let (status, _, _) = send_request(addr, "/beta/gadgets/getBranch?branchName=feature", b"", &[]).await;
    assert_eq!(status, 404);
}
