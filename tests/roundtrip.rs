//! End-to-end scenarios: encode a value graph with asynchronous leaves,
//! decode the frames, and drain the revived handles.

use std::collections::HashSet;

use futures::channel::mpsc;
use futures::stream::{self, StreamExt};

use latewire::{
    decode, decode_raw, encode, Array, AsyncSequence, Chunk, DecodeError, DecodeOptions,
    EncodeError, EncodeOptions, Object, Promise, PullStream, SeqStep, Value,
};

fn object(entries: Vec<(&str, Value)>) -> Value {
    let object = Object::new();
    for (key, value) in entries {
        object.insert(key, value);
    }
    Value::Object(object)
}

fn sequence_of(chunks: Vec<Chunk>) -> Value {
    Value::Sequence(AsyncSequence::new(stream::iter(chunks)))
}

async fn collect_frames(root: Value, options: EncodeOptions) -> Vec<String> {
    encode(root, options)
        .map(|frame| frame.expect("encode"))
        .collect()
        .await
}

async fn decode_frames(frames: Vec<String>, options: DecodeOptions) -> Value {
    let frames = stream::iter(frames.into_iter().map(Ok));
    decode(frames, options).await.expect("decode")
}

async fn round_trip(root: Value, en: EncodeOptions, de: DecodeOptions) -> Value {
    let frames = collect_frames(root, en).await;
    decode_frames(frames, de).await
}

async fn drain(sequence: &AsyncSequence) -> (Vec<Value>, Result<Value, Value>) {
    let mut reader = sequence.reader().expect("sequence already consumed");
    let mut items = Vec::new();
    loop {
        match reader.next().await {
            Ok(SeqStep::Item(value)) => items.push(value),
            Ok(SeqStep::Done(value)) => return (items, Ok(value)),
            Err(cause) => return (items, Err(cause)),
        }
    }
}

#[tokio::test]
async fn matches_the_documented_wire_format() {
    let root = object(vec![(
        "asyncIterable",
        sequence_of(vec![
            Chunk::Yield(Value::from("hello")),
            Chunk::Yield(Value::from("world")),
            Chunk::Return(Value::from("return value")),
        ]),
    )]);
    let frames = collect_frames(root, EncodeOptions::new()).await;
    assert_eq!(
        frames.concat(),
        "[{\"asyncIterable\":1},[\"AsyncIterable\",2],1]\n\
         [1,0,[\"hello\"]]\n\
         [1,0,[\"world\"]]\n\
         [1,2,[\"return value\"]]\n"
    );
}

#[tokio::test]
async fn numeric_sequence_with_return_value() {
    let root = object(vec![(
        "seq",
        sequence_of(vec![
            Chunk::Yield(Value::Float(-0.0)),
            Chunk::Yield(Value::from(1)),
            Chunk::Yield(Value::from(2)),
            Chunk::Return(Value::from("done")),
        ]),
    )]);
    let decoded = round_trip(root, EncodeOptions::new(), DecodeOptions::new()).await;
    let sequence = decoded.get("seq").expect("seq");
    let (items, terminal) = drain(sequence.as_sequence().expect("sequence")).await;

    assert_eq!(items.len(), 3);
    let first = items[0].as_float().expect("float");
    assert_eq!(first, 0.0);
    assert!(first.is_sign_negative(), "-0 must round-trip its sign");
    assert_eq!(items[1], Value::from(1));
    assert_eq!(items[2], Value::from(2));
    assert_eq!(terminal, Ok(Value::from("done")));
}

#[tokio::test]
async fn promise_and_sequence_mixed() {
    let root = object(vec![
        ("p", Value::Promise(Promise::resolved(Value::from("hi")))),
        (
            "s",
            sequence_of(vec![
                Chunk::Yield(Value::from(1)),
                Chunk::Yield(Value::from(2)),
                Chunk::Yield(Value::from(3)),
                Chunk::Return(Value::Null),
            ]),
        ),
    ]);
    let decoded = round_trip(root, EncodeOptions::new(), DecodeOptions::new()).await;

    let promise = decoded.get("p").expect("p");
    assert_eq!(
        promise.as_promise().expect("promise").wait().await,
        Ok(Value::from("hi"))
    );

    let sequence = decoded.get("s").expect("s");
    let (items, terminal) = drain(sequence.as_sequence().expect("sequence")).await;
    assert_eq!(
        items,
        vec![Value::from(1), Value::from(2), Value::from(3)]
    );
    assert_eq!(terminal, Ok(Value::Null));
}

#[derive(Debug)]
struct MyErr {
    message: String,
}

#[tokio::test]
async fn custom_error_through_sequence() {
    let root = object(vec![(
        "s",
        sequence_of(vec![
            Chunk::Yield(Value::from(0)),
            Chunk::Yield(Value::from(1)),
            Chunk::Error(Value::opaque(MyErr {
                message: "boom".to_string(),
            })),
        ]),
    )]);
    let en = EncodeOptions::new().with_reducer("MyErr", |value: &Value| {
        let err = value.as_opaque()?.downcast_ref::<MyErr>()?;
        Some(Value::from(err.message.clone()))
    });
    let de = DecodeOptions::new().with_reviver("MyErr", |payload| {
        let message = payload
            .as_str()
            .ok_or_else(|| DecodeError::Reviver("MyErr expects a string".to_string()))?
            .to_string();
        Ok(Value::opaque(MyErr { message }))
    });

    let decoded = round_trip(root, en, de).await;
    let sequence = decoded.get("s").expect("s");
    let (items, terminal) = drain(sequence.as_sequence().expect("sequence")).await;

    assert_eq!(items, vec![Value::from(0), Value::from(1)]);
    let cause = terminal.expect_err("sequence must throw");
    let err = cause
        .as_opaque()
        .and_then(|o| o.downcast_ref::<MyErr>())
        .expect("MyErr");
    assert_eq!(err.message, "boom");
}

#[derive(Debug)]
struct PlainError {
    message: String,
}

#[derive(Debug)]
struct WrappedErr {
    message: String,
}

#[tokio::test]
async fn unregistered_error_salvaged_by_coerce_error() {
    let root = object(vec![(
        "p",
        Value::Promise(Promise::rejected(Value::opaque(PlainError {
            message: "x".to_string(),
        }))),
    )]);
    let en = EncodeOptions::new()
        .with_reducer("WrappedErr", |value: &Value| {
            let err = value.as_opaque()?.downcast_ref::<WrappedErr>()?;
            Some(Value::from(err.message.clone()))
        })
        .with_coerce_error(|cause: &Value| {
            let message = cause
                .as_opaque()
                .and_then(|o| o.downcast_ref::<PlainError>())
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "unknown".to_string());
            Value::opaque(WrappedErr { message })
        });
    let de = DecodeOptions::new().with_reviver("WrappedErr", |payload| {
        let message = payload
            .as_str()
            .ok_or_else(|| DecodeError::Reviver("WrappedErr expects a string".to_string()))?
            .to_string();
        Ok(Value::opaque(WrappedErr { message }))
    });

    let decoded = round_trip(root, en, de).await;
    let cause = decoded
        .get("p")
        .expect("p")
        .as_promise()
        .expect("promise")
        .wait()
        .await
        .expect_err("promise must reject");
    let err = cause
        .as_opaque()
        .and_then(|o| o.downcast_ref::<WrappedErr>())
        .expect("WrappedErr");
    assert_eq!(err.message, "x");
}

#[tokio::test]
async fn unencodable_error_without_coerce_tears_down_the_session() {
    let root = object(vec![(
        "p",
        Value::Promise(Promise::rejected(Value::opaque(PlainError {
            message: "x".to_string(),
        }))),
    )]);
    let mut frames = encode(root, EncodeOptions::new());
    assert!(frames.next().await.unwrap().is_ok(), "header still goes out");
    match frames.next().await {
        Some(Err(EncodeError::Unsupported(_))) => {}
        other => panic!("expected session teardown, got {other:?}"),
    }
}

#[tokio::test]
async fn encoding_an_already_consumed_sequence_fails_distinctly() {
    let sequence = AsyncSequence::new(stream::iter(vec![Chunk::Return(Value::Null)]));
    drop(sequence.reader());
    let root = object(vec![("s", Value::Sequence(sequence))]);
    let mut frames = encode(root, EncodeOptions::new());
    match frames.next().await {
        Some(Err(EncodeError::SourceConsumed)) => {}
        other => panic!("expected SourceConsumed, got {other:?}"),
    }
}

#[tokio::test]
async fn pull_stream_round_trip() {
    let root = object(vec![(
        "s",
        Value::Stream(PullStream::from_values(vec![
            Value::from("hello"),
            Value::from("world"),
        ])),
    )]);
    let decoded = round_trip(root, EncodeOptions::new(), DecodeOptions::new()).await;
    let mut reader = decoded
        .get("s")
        .expect("s")
        .as_stream()
        .expect("pull stream")
        .reader()
        .expect("stream already consumed");

    assert_eq!(reader.pull().await, Ok(Some(Value::from("hello"))));
    assert_eq!(reader.pull().await, Ok(Some(Value::from("world"))));
    assert_eq!(reader.pull().await, Ok(None));
    assert_eq!(reader.pull().await, Ok(None));
}

#[tokio::test]
async fn nested_async_values_use_one_id_each() {
    let comments = Promise::resolved(Value::Array(Array::from_vec(vec![
        Value::from("first"),
        Value::from("second"),
    ])));
    let post = Object::new();
    post.insert("comments", Value::Promise(comments));
    post.insert("id", Value::from(1));
    let root = object(vec![(
        "post",
        Value::Promise(Promise::resolved(Value::Object(post))),
    )]);

    let frames = collect_frames(root, EncodeOptions::new()).await;
    assert_eq!(frames.len(), 3, "header plus one frame per promise");
    let ids: HashSet<u64> = frames[1..]
        .iter()
        .map(|frame| {
            let parts: serde_json::Value = serde_json::from_str(frame).expect("frame json");
            parts[0].as_u64().expect("id")
        })
        .collect();
    assert_eq!(ids.len(), 2, "exactly two chunk-stream ids");

    let decoded = decode_frames(frames, DecodeOptions::new()).await;
    let post = decoded
        .get("post")
        .expect("post")
        .as_promise()
        .expect("promise")
        .wait()
        .await
        .expect("post fulfils");
    assert_eq!(post.get("id"), Some(Value::from(1)));
    let comments = post
        .get("comments")
        .expect("comments")
        .as_promise()
        .expect("comments is still a promise")
        .wait()
        .await
        .expect("comments fulfil");
    assert_eq!(
        comments.as_array().expect("array").to_vec(),
        vec![Value::from("first"), Value::from("second")]
    );
}

#[tokio::test]
async fn shared_promise_is_assigned_one_id_and_revives_shared() {
    let promise = Promise::resolved(Value::from("once"));
    let root = object(vec![
        ("a", Value::Promise(promise.clone())),
        ("b", Value::Promise(promise)),
    ]);
    let frames = collect_frames(root, EncodeOptions::new()).await;
    assert_eq!(frames.len(), 2, "header plus a single body frame");

    let decoded = decode_frames(frames, DecodeOptions::new()).await;
    let a = decoded.get("a").unwrap();
    let b = decoded.get("b").unwrap();
    assert!(a
        .as_promise()
        .unwrap()
        .ptr_eq(b.as_promise().unwrap()));
    assert_eq!(a.as_promise().unwrap().wait().await, Ok(Value::from("once")));
}

#[tokio::test]
async fn synchronous_graph_round_trips_through_the_header() {
    let inner = Array::from_vec(vec![Value::Float(f64::NAN), Value::from(true)]);
    let root = object(vec![
        ("list", Value::Array(inner)),
        ("text", Value::from("plain")),
        ("none", Value::Null),
    ]);
    let decoded = round_trip(root.clone(), EncodeOptions::new(), DecodeOptions::new()).await;
    assert_eq!(decoded, root);
}

#[tokio::test]
async fn interrupted_stream_throws_on_open_consumers() {
    let frames = vec![
        "[{\"seq\":1},[\"AsyncIterable\",2],1]".to_string(),
        "[1,0,[42]]".to_string(),
    ];
    let decoded = decode_frames(frames, DecodeOptions::new()).await;
    let sequence = decoded.get("seq").unwrap();
    let (items, terminal) = drain(sequence.as_sequence().unwrap()).await;

    assert_eq!(items, vec![Value::from(42)]);
    let cause = terminal.expect_err("interruption must throw");
    let error = cause
        .as_opaque()
        .and_then(|o| o.downcast_ref::<DecodeError>())
        .expect("decode error");
    assert_eq!(error.to_string(), "stream interrupted: malformed stream");
}

#[tokio::test]
async fn transport_error_reaches_open_consumers() {
    let frames: Vec<Result<String, DecodeError>> = vec![
        Ok("[{\"p\":1},[\"Promise\",2],1]".to_string()),
        Err(DecodeError::Transport("connection reset".to_string())),
    ];
    let decoded = decode(stream::iter(frames), DecodeOptions::new())
        .await
        .expect("header decodes");
    let cause = decoded
        .get("p")
        .unwrap()
        .as_promise()
        .unwrap()
        .wait()
        .await
        .expect_err("promise must observe the transport error");
    let error = cause
        .as_opaque()
        .and_then(|o| o.downcast_ref::<DecodeError>())
        .expect("decode error");
    assert!(matches!(error, DecodeError::Transport(_)));
}

#[tokio::test]
async fn malformed_body_frame_is_a_transport_error() {
    let frames = vec![
        "[{\"p\":1},[\"Promise\",2],1]".to_string(),
        "[0,9]".to_string(),
    ];
    let decoded = decode_frames(frames, DecodeOptions::new()).await;
    let cause = decoded
        .get("p")
        .unwrap()
        .as_promise()
        .unwrap()
        .wait()
        .await
        .expect_err("promise must observe the structural error");
    let error = cause
        .as_opaque()
        .and_then(|o| o.downcast_ref::<DecodeError>())
        .expect("decode error");
    assert!(matches!(error, DecodeError::MalformedFrame(_)));
}

#[tokio::test]
async fn raw_transport_with_arbitrary_chunk_boundaries() {
    let root = object(vec![
        ("p", Value::Promise(Promise::resolved(Value::from("hi")))),
        (
            "s",
            sequence_of(vec![
                Chunk::Yield(Value::from(1)),
                Chunk::Yield(Value::from(2)),
                Chunk::Return(Value::from("done")),
            ]),
        ),
    ]);
    let wire = collect_frames(root, EncodeOptions::new()).await.concat();

    // re-chunk the byte stream without regard for line boundaries
    let chunks: Vec<Result<String, DecodeError>> = wire
        .as_bytes()
        .chunks(7)
        .map(|piece| Ok(String::from_utf8(piece.to_vec()).expect("ascii wire")))
        .collect();

    let decoded = decode_raw(stream::iter(chunks), DecodeOptions::new())
        .await
        .expect("decode");
    assert_eq!(
        decoded.get("p").unwrap().as_promise().unwrap().wait().await,
        Ok(Value::from("hi"))
    );
    let (items, terminal) = drain(decoded.get("s").unwrap().as_sequence().unwrap()).await;
    assert_eq!(items, vec![Value::from(1), Value::from(2)]);
    assert_eq!(terminal, Ok(Value::from("done")));
}

#[tokio::test]
async fn frames_flow_through_a_live_channel() {
    let (promise, deferred) = Promise::deferred();
    let root = object(vec![("p", Value::Promise(promise))]);

    let (tx, rx) = mpsc::unbounded::<Result<String, DecodeError>>();
    tokio::spawn(async move {
        let mut frames = encode(root, EncodeOptions::new());
        while let Some(frame) = frames.next().await {
            let frame = frame.map_err(|cause| DecodeError::Transport(cause.to_string()));
            if tx.unbounded_send(frame).is_err() {
                break;
            }
        }
    });

    let decoded = decode(rx, DecodeOptions::new()).await.expect("decode");
    deferred.resolve(Value::from("late"));
    assert_eq!(
        decoded.get("p").unwrap().as_promise().unwrap().wait().await,
        Ok(Value::from("late"))
    );
}

#[tokio::test]
async fn closing_the_encoder_cancels_live_producers() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    let cancelled = Arc::new(AtomicUsize::new(0));
    let hook = Arc::clone(&cancelled);
    let endless = AsyncSequence::with_close(stream::pending::<Chunk>(), move || async move {
        hook.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let root = object(vec![("s", Value::Sequence(endless))]);

    let mut frames = encode(root, EncodeOptions::new());
    assert!(frames.next().await.unwrap().is_ok(), "header frame");
    frames.close().await.expect("close");
    assert_eq!(cancelled.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn dropping_one_revived_sequence_leaves_others_running() {
    let root = object(vec![
        (
            "left",
            sequence_of(vec![
                Chunk::Yield(Value::from(1)),
                Chunk::Return(Value::Null),
            ]),
        ),
        (
            "right",
            sequence_of(vec![
                Chunk::Yield(Value::from(2)),
                Chunk::Yield(Value::from(3)),
                Chunk::Return(Value::Null),
            ]),
        ),
    ]);
    let decoded = round_trip(root, EncodeOptions::new(), DecodeOptions::new()).await;

    // abandon "left" without draining it
    let left = decoded.get("left").unwrap();
    drop(left.as_sequence().unwrap().reader());

    let (items, terminal) = drain(decoded.get("right").unwrap().as_sequence().unwrap()).await;
    assert_eq!(items, vec![Value::from(2), Value::from(3)]);
    assert_eq!(terminal, Ok(Value::Null));
}
