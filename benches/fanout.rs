//! 消息广播基准测试
//!
//! 测试模板渲染和向多个观察者广播的性能

use anyhow::Result;
use async_trait::async_trait;
use bot_framework::notification::{MessageTemplate, NotificationFanout, NotificationObserver};
use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::{json, Value};
use std::hint::black_box;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// 只计数的观察者
struct Counting(AtomicUsize);

#[async_trait]
impl NotificationObserver for Counting {
    async fn update(&self, _topic: &str, message: &Value) -> Result<()> {
        black_box(message);
        self.0.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// 模板渲染基准测试
fn template_benchmark(c: &mut Criterion) {
    c.bench_function("template_rendering", |b| {
        let template = MessageTemplate::new("[{{topic}}] {{text}}").unwrap();
        let message = json!("部署完成");

        b.iter(|| black_box(template.render("deploy", &message).unwrap()));
    });

    c.bench_function("template_rendering_structured", |b| {
        let template = MessageTemplate::new(
            "**{{topic}}**\n{{#each message.items}}- {{this}}\n{{/each}}",
        )
        .unwrap();
        let message = json!({"items": ["a", "b", "c", "d", "e"]});

        b.iter(|| black_box(template.render("digest", &message).unwrap()));
    });
}

/// 广播基准测试
fn fanout_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();

    for observers in [1usize, 16, 128] {
        let fanout = NotificationFanout::new();
        runtime.block_on(async {
            for _ in 0..observers {
                fanout.register(Arc::new(Counting(AtomicUsize::new(0)))).await;
            }
        });
        let message = json!({"text": "hoho"});

        c.bench_function(&format!("fanout_send_{observers}"), |b| {
            b.iter(|| {
                let summary = runtime.block_on(fanout.send("hey", &message));
                black_box(summary)
            });
        });
    }
}

criterion_group!(benches, template_benchmark, fanout_benchmark);
criterion_main!(benches);
