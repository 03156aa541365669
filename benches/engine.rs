use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use toolbridge::fc::{normalize, Args};
use toolbridge::observability::NullSink;
use toolbridge::protocol::anthropic::FrontEncoder;
use toolbridge::protocol::backend::{decode_backend_event, ToolCallFragment, UpstreamEvent};
use toolbridge::stream::{EngineOptions, StreamConverter};

fn fragmented_call(id: &str, index: usize, args: &str, chunk: usize) -> Vec<UpstreamEvent> {
    let bytes = args.as_bytes();
    let mut events = Vec::new();
    let mut start = 0;
    while start < bytes.len() {
        let mut end = (start + chunk).min(bytes.len());
        while !args.is_char_boundary(end) {
            end += 1;
        }
        events.push(UpstreamEvent::ToolCall(ToolCallFragment {
            id: Some(id.to_string()),
            stream_index: index,
            tool_name: (start == 0).then(|| "Bash".to_string()),
            argument_text: args[start..end].to_string(),
            is_final: end == bytes.len(),
        }));
        start = end;
    }
    events
}

fn sample_events() -> Vec<UpstreamEvent> {
    let args = format!(
        "{{\"prompt\":\"{}\",\"timeout\":120000,\"description\":\"run the suite\"}}",
        "cargo test --workspace -- --nocapture ".repeat(8)
    );
    let mut events = vec![UpstreamEvent::Text("Running the tests now.".to_string())];
    events.extend(fragmented_call("t1", 0, &args, 12));
    // replay of a closed call, then a duplicate operation
    events.extend(fragmented_call("t1", 1, &args, 12));
    events.extend(fragmented_call("t2", 2, &args, 48));
    events.push(UpstreamEvent::End {
        stop_reason: Some("tool_use".to_string()),
    });
    events
}

fn bench_engine(c: &mut Criterion) {
    let events = sample_events();

    c.bench_function("engine_convert_fragmented_call", |b| {
        b.iter(|| {
            let mut engine =
                StreamConverter::new(EngineOptions::default(), Arc::new(NullSink));
            let mut out = Vec::with_capacity(64);
            for event in events.iter().cloned() {
                let _ = engine.push(event, &mut out);
            }
            engine.finish(&mut out);
            black_box(out.len());
        });
    });

    c.bench_function("engine_convert_and_encode", |b| {
        let mut frames = String::with_capacity(16 * 1024);
        b.iter(|| {
            let mut engine =
                StreamConverter::new(EngineOptions::default(), Arc::new(NullSink));
            let mut encoder = FrontEncoder::with_message_id("claude-sonnet-4.5", "msg_bench");
            let mut out = Vec::with_capacity(64);
            frames.clear();
            for event in events.iter().cloned() {
                let _ = engine.push(event, &mut out);
                for front in out.drain(..) {
                    encoder.encode(&front, &mut frames);
                }
            }
            engine.finish(&mut out);
            for front in out.drain(..) {
                encoder.encode(&front, &mut frames);
            }
            black_box(frames.len());
        });
    });
}

fn bench_normalize(c: &mut Criterion) {
    let serde_json::Value::Object(args) = json!({
        "query": "fn main",
        "path": "src",
        "output_mode": "Content",
        "-n": true
    }) else {
        unreachable!()
    };
    let args: Args = args;
    c.bench_function("normalize_grep_args", |b| {
        b.iter(|| black_box(normalize("Grep", black_box(args.clone()))));
    });
}

fn bench_decode(c: &mut Criterion) {
    let data = r#"{"toolUseId":"tooluse_abc","name":"Bash","input":"{\"prompt\":\"ls -la\"}","index":0,"stop":false}"#;
    c.bench_function("decode_backend_tool_event", |b| {
        b.iter(|| black_box(decode_backend_event(Some("toolUseEvent"), black_box(data))));
    });
}

criterion_group!(benches, bench_engine, bench_normalize, bench_decode);
criterion_main!(benches);
