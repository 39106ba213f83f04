use std::io::{Read as _, Write as _};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use hyper::Method;
use serde_json::Value;

use replayarchive::{
    archive::Archive,
    error::ArchiveError,
    wire::{Request, Response},
};

const CLIENT: &str = "10.0.0.1:5000";

fn get(url: &str) -> Request {
    hyper::Request::builder()
        .method(Method::GET)
        .uri(url)
        .body(Bytes::new())
        .unwrap()
}

fn response(status: u16, body: &[u8]) -> Response {
    hyper::Response::builder()
        .status(status)
        .body(Bytes::copy_from_slice(body))
        .unwrap()
}

fn sample_archive() -> Archive {
    let mut archive = Archive::new();
    archive
        .add("http", &get("http://x/a"), &response(200, b"hi"))
        .unwrap();
    archive.record_tls_config("x", vec![0x30, 0x82, 0x0a], "h2");
    archive.deterministic_time_seed_ms = 1_234_567;
    archive
}

fn decode_document(archive: &Archive) -> Value {
    let mut compressed = Vec::new();
    archive.serialize(&mut compressed).unwrap();

    let mut payload = Vec::new();
    GzDecoder::new(&compressed[..])
        .read_to_end(&mut payload)
        .unwrap();
    serde_json::from_slice(&payload).unwrap()
}

#[test]
fn document_carries_every_field_under_its_wire_name() {
    let document = decode_document(&sample_archive());

    let object = document.as_object().unwrap();
    let mut names: Vec<_> = object.keys().map(String::as_str).collect();
    names.sort_unstable();
    assert_eq!(
        names,
        [
            "Certs",
            "CurrentSession",
            "DeterministicTimeSeedMs",
            "NegotiatedProtocol",
            "Requests",
            "ServeResponseInChronologicalSequence",
        ]
    );

    assert_eq!(
        document.pointer("/DeterministicTimeSeedMs"),
        Some(&Value::from(1_234_567))
    );
    assert_eq!(
        document.pointer("/ServeResponseInChronologicalSequence"),
        Some(&Value::Bool(false))
    );
    assert_eq!(
        document.pointer("/NegotiatedProtocol/x"),
        Some(&Value::from("h2"))
    );
    assert_eq!(
        document.pointer("/CurrentSession"),
        Some(&serde_json::json!({"SessionIds": {}, "StartingSessionId": 0}))
    );
}

#[test]
fn recordings_store_wire_bytes_as_base64() {
    let document = decode_document(&sample_archive());

    let recording = document
        .pointer("/Requests/x/http:~1~1x~1a/0")
        .expect("recording under host and url");

    let request_wire = STANDARD
        .decode(recording["SerializedRequest"].as_str().unwrap())
        .unwrap();
    assert!(
        request_wire.starts_with(b"GET /a HTTP/1.1\r\nHost: x\r\n"),
        "unexpected wire form: {}",
        String::from_utf8_lossy(&request_wire)
    );

    let response_wire = STANDARD
        .decode(recording["SerializedResponse"].as_str().unwrap())
        .unwrap();
    assert!(
        response_wire.starts_with(b"HTTP/1.1 200 OK\r\n"),
        "unexpected wire form: {}",
        String::from_utf8_lossy(&response_wire)
    );
    assert_eq!(
        recording["LastServedSession"],
        serde_json::json!({"SessionIds": {}, "StartingSessionId": 0})
    );

    let cert = STANDARD
        .decode(document.pointer("/Certs/x").unwrap().as_str().unwrap())
        .unwrap();
    assert_eq!(cert, [0x30, 0x82, 0x0a]);
}

#[test]
fn identical_archives_serialize_to_identical_bytes() {
    let mut first = Vec::new();
    sample_archive().serialize(&mut first).unwrap();

    let mut second = Vec::new();
    sample_archive().serialize(&mut second).unwrap();

    assert_eq!(first, second);
}

#[test]
fn documents_with_null_maps_still_open() {
    let document = serde_json::json!({
        "Requests": {
            "x": {
                "http://x/a": [{
                    "SerializedRequest":
                        STANDARD.encode(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n"),
                    "SerializedResponse": STANDARD.encode(
                        b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi"
                    ),
                    "LastServedSession": {"SessionIds": null, "StartingSessionId": 0},
                }],
            },
        },
        "Certs": null,
        "NegotiatedProtocol": null,
        "DeterministicTimeSeedMs": 42,
        "ServeResponseInChronologicalSequence": true,
        "CurrentSession": {"SessionIds": null, "StartingSessionId": 0},
    });

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("legacy.wprgo");
    let mut encoder = GzEncoder::new(std::fs::File::create(&path).unwrap(), Compression::default());
    serde_json::to_writer(&mut encoder, &document).unwrap();
    encoder.finish().unwrap().flush().unwrap();

    let archive = Archive::open(&path).unwrap();
    assert!(archive.serve_in_chronological_sequence);
    assert_eq!(archive.deterministic_time_seed_ms, 42);

    let (_, found) = archive.find(&get("http://x/a"), CLIENT, "http").unwrap();
    assert_eq!(&found.body()[..], b"hi");
    assert_eq!(
        archive.find_tls_config("x").unwrap_err(),
        ArchiveError::NotFound
    );
}

#[test]
fn opening_a_file_that_is_not_gzip_fails_with_io_context() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plain.wprgo");
    std::fs::write(&path, b"not gzip at all").unwrap();

    let err = Archive::open(&path).unwrap_err();
    assert!(matches!(err, ArchiveError::Io(_)), "unexpected: {err:?}");
    assert!(
        err.to_string().contains("plain.wprgo"),
        "error should name the path: {err}"
    );
}

#[test]
fn opening_a_gzip_stream_without_a_document_fails_to_decode() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.wprgo");
    let mut encoder = GzEncoder::new(std::fs::File::create(&path).unwrap(), Compression::default());
    encoder.write_all(b"this is not json").unwrap();
    encoder.finish().unwrap().flush().unwrap();

    let err = Archive::open(&path).unwrap_err();
    assert!(matches!(err, ArchiveError::Decoding(_)), "unexpected: {err:?}");
}
