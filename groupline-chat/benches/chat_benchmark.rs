use std::hint::black_box;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use criterion::{criterion_group, criterion_main, Criterion};
use groupline_chat::auth::StaticTokenIssuer;
use groupline_chat::conversation::Conversation;
use groupline_chat::directory::{GroupRole, InMemoryDirectory};
use groupline_chat::presence::TypingTracker;
use groupline_chat::protocol::{ClientFrame, Message, ServerFrame};
use groupline_chat::registry::{OutboundQueue, SessionRegistry};
use uuid::Uuid;

fn sample_message(i: usize) -> Message {
    let mut message = Message::with_id(format!("m-{i}"), "g1", "alice", "hello there, group", Utc::now());
    message.set_reaction("bob", "👍", true);
    message
}

fn bench_new_message_encode(c: &mut Criterion) {
    let frame = ServerFrame::NewMessage {
        message: sample_message(1),
        temp_id: Some("tmp-1".into()),
    };

    c.bench_function("new_message_encode", |b| {
        b.iter(|| {
            black_box(black_box(&frame).encode().unwrap());
        })
    });
}

fn bench_send_message_decode(c: &mut Criterion) {
    let text = r#"{"type":"send_message","content":"hello there","tempId":"tmp-1"}"#;

    c.bench_function("send_message_decode", |b| {
        b.iter(|| {
            black_box(ClientFrame::decode(black_box(text)).unwrap());
        })
    });
}

fn bench_conversation_apply_1k(c: &mut Criterion) {
    let frames: Vec<ServerFrame> = (0..1000)
        .map(|i| ServerFrame::NewMessage {
            message: sample_message(i),
            temp_id: None,
        })
        .collect();

    c.bench_function("conversation_apply_1k", |b| {
        b.iter(|| {
            let mut conversation = Conversation::new();
            conversation.set_group("g1");
            for frame in &frames {
                conversation.apply(frame);
            }
            black_box(conversation.messages().len());
        })
    });
}

fn bench_optimistic_reconcile_100(c: &mut Criterion) {
    c.bench_function("optimistic_reconcile_100", |b| {
        b.iter(|| {
            let mut conversation = Conversation::new();
            conversation.set_group("g1");
            let pending: Vec<_> = (0..100)
                .map(|i| conversation.begin_send(format!("msg {i}"), None, Vec::new()))
                .collect();
            for (i, p) in pending.iter().enumerate() {
                let frame = ServerFrame::NewMessage {
                    message: sample_message(i),
                    temp_id: Some(p.temp_id.clone()),
                };
                conversation.apply(&frame);
            }
            black_box(conversation.pending_count());
        })
    });
}

fn bench_typing_sweep_1k(c: &mut Criterion) {
    c.bench_function("typing_sweep_1k_users", |b| {
        b.iter(|| {
            let mut tracker = TypingTracker::new(Duration::from_millis(3000));
            let start = Instant::now();
            for i in 0..1000 {
                tracker.start_typing(&format!("g{}", i % 10), &format!("u{i}"), start);
            }
            let expired = tracker.sweep(start + Duration::from_secs(4));
            black_box(expired.len());
        })
    });
}

fn bench_fan_out_100_sessions(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (registry, mut receivers) = rt.block_on(async {
        let issuer = Arc::new(StaticTokenIssuer::new(Duration::from_secs(60)));
        let directory = Arc::new(InMemoryDirectory::new());
        let registry = SessionRegistry::new(issuer.clone(), directory.clone());
        let mut receivers = Vec::new();
        for i in 0..100 {
            let user = format!("u{i}");
            directory.add_member("g1", user.clone(), GroupRole::Member).await;
            let token = issuer.issue(user).await;
            let session_id = Uuid::new_v4();
            let (tx, rx) = OutboundQueue::new(16);
            registry.authenticate(session_id, &token, tx).await.unwrap();
            registry.join_group(session_id, "g1").await.unwrap();
            receivers.push(rx);
        }
        (registry, receivers)
    });
    let frame = ServerFrame::NewMessage {
        message: sample_message(1),
        temp_id: None,
    };

    c.bench_function("fan_out_100_sessions", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(registry.deliver("g1", &frame, None).await.unwrap());
            });
            for rx in receivers.iter_mut() {
                while rx.try_recv().is_ok() {}
            }
        })
    });
}

criterion_group!(
    benches,
    bench_new_message_encode,
    bench_send_message_decode,
    bench_conversation_apply_1k,
    bench_optimistic_reconcile_100,
    bench_typing_sweep_1k,
    bench_fan_out_100_sessions,
);
criterion_main!(benches);
