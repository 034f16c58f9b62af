//! Integration tests for the callbus wire protocol.
//!
//! These tests verify framing and frame bodies across module boundaries.

use callbus::codec::MsgPackCodec;
use callbus::protocol::{
    build_frame, CallRequest, Frame, FrameBuffer, FrameKind, Header, NewRpcRequest, HEADER_SIZE,
};
use callbus::{RpcErrorKind, RpcResult};
use serde_json::{json, Value};

/// A CALL frame survives encode, framing and decode.
#[test]
fn test_call_frame_roundtrip() {
    let request = CallRequest {
        name: "test.test".to_string(),
        handler_id: Some(3),
        args: json!({"message": "Hello, world!"}),
    };

    let frame = Frame::with_body(FrameKind::Call, 12345, &request).unwrap();
    let frame_bytes = build_frame(&frame.header, frame.payload());

    let mut buffer = FrameBuffer::new();
    let frames = buffer.push(&frame_bytes).unwrap();

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].kind(), FrameKind::Call);
    assert_eq!(frames[0].call_id(), 12345);

    let decoded: CallRequest = frames[0].body().unwrap();
    assert_eq!(decoded, request);
}

/// Streaming call: updates in order, then exactly one result.
#[test]
fn test_stream_pattern() {
    let mut all_bytes = Vec::new();

    for i in 1..=3 {
        let update = Frame::with_body(FrameKind::Update, 7, &json!({"count": i})).unwrap();
        all_bytes.extend(build_frame(&update.header, update.payload()));
    }
    let finish = Frame::with_body(FrameKind::Finish, 7, &RpcResult::ok(json!({"blub": "foo"}))).unwrap();
    all_bytes.extend(build_frame(&finish.header, finish.payload()));

    let mut buffer = FrameBuffer::new();
    let frames = buffer.push(&all_bytes).unwrap();
    assert_eq!(frames.len(), 4);

    for (i, frame) in frames[..3].iter().enumerate() {
        assert_eq!(frame.kind(), FrameKind::Update);
        let update: Value = frame.body().unwrap();
        assert_eq!(update, json!({"count": i + 1}));
    }

    assert_eq!(frames[3].kind(), FrameKind::Finish);
    let result: RpcResult = frames[3].body().unwrap();
    assert_eq!(result, RpcResult::ok(json!({"blub": "foo"})));
}

/// Error results keep kind and non-ASCII details intact.
#[test]
fn test_error_result() {
    let result = RpcResult::err(
        RpcErrorKind::InvalidArgs,
        json!({"details": "Needed föö, got blah."}),
    );
    let frame = Frame::with_body(FrameKind::Finish, 1, &result).unwrap();

    let mut buffer = FrameBuffer::new();
    let frames = buffer
        .push(&build_frame(&frame.header, frame.payload()))
        .unwrap();

    let decoded: RpcResult = frames[0].body().unwrap();
    let err = decoded.unwrap_err();
    assert_eq!(err.kind, RpcErrorKind::InvalidArgs);
    assert_eq!(err.details, Some(json!({"details": "Needed föö, got blah."})));
}

/// CANCEL and ACK are header-only.
#[test]
fn test_control_frames_are_empty() {
    let mut bytes = Vec::new();
    bytes.extend(build_frame(&Header::new(FrameKind::Cancel, 9, 0), &[]));
    bytes.extend(build_frame(&Header::new(FrameKind::Ack, 9, 0), &[]));
    assert_eq!(bytes.len(), 2 * HEADER_SIZE);

    let mut buffer = FrameBuffer::new();
    let frames = buffer.push(&bytes).unwrap();

    assert_eq!(frames.len(), 2);
    assert!(frames.iter().all(|f| f.payload().is_empty()));
    assert_eq!(frames[0].kind(), FrameKind::Cancel);
    assert_eq!(frames[1].kind(), FrameKind::Ack);
}

/// A CANCEL that claims a payload is a protocol violation.
#[test]
fn test_control_frame_with_payload_rejected() {
    let bytes = build_frame(&Header::new(FrameKind::Cancel, 9, 3), b"abc");

    let mut buffer = FrameBuffer::new();
    assert!(buffer.push(&bytes).is_err());
}

/// Core registration request as a client sends it.
#[test]
fn test_new_rpc_request_body() {
    let request = NewRpcRequest {
        name: "test.test".to_string(),
        priority: -5,
        handler_id: 1,
    };
    let args = serde_json::to_value(&request).unwrap();
    let call = CallRequest {
        name: callbus::protocol::CORE_NEW_RPC.to_string(),
        handler_id: None,
        args,
    };

    let bytes = MsgPackCodec::encode(&call).unwrap();
    let decoded: CallRequest = MsgPackCodec::decode(&bytes).unwrap();
    let inner: NewRpcRequest = serde_json::from_value(decoded.args).unwrap();
    assert_eq!(inner, request);
}

/// Frames split at every possible boundary reassemble identically.
#[test]
fn test_fragmented_frame_parsing() {
    let first = Frame::with_body(FrameKind::Update, 1, &json!("a longer update payload")).unwrap();
    let second = Frame::with_body(FrameKind::Finish, 1, &RpcResult::not_handled()).unwrap();

    let mut bytes = build_frame(&first.header, first.payload());
    bytes.extend(build_frame(&second.header, second.payload()));

    for split in 1..bytes.len() {
        let mut buffer = FrameBuffer::new();
        let mut frames = buffer.push(&bytes[..split]).unwrap();
        frames.extend(buffer.push(&bytes[split..]).unwrap());

        assert_eq!(frames.len(), 2, "split at {}", split);
        assert_eq!(frames[0].kind(), FrameKind::Update);
        assert_eq!(frames[1].kind(), FrameKind::Finish);
        assert!(buffer.is_empty());
    }
}
