//! 事件投递队列
//!
//! 每个配置存储持有一个投递队列，由单个任务按入队顺序依次等待回调完成，
//! 同一存储上的事件因此保持后端发出的顺序。

use crate::config::event::{ChangeEvent, ChangeListener, SubscriptionId};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

enum Delivery {
    Event {
        subscription: SubscriptionId,
        listener: ChangeListener,
        event: ChangeEvent,
    },
    Barrier(oneshot::Sender<()>),
}

/// 事件投递器
#[derive(Clone)]
pub struct EventDispatcher {
    sender: mpsc::UnboundedSender<Delivery>,
}

impl EventDispatcher {
    /// 创建投递器并启动投递任务
    ///
    /// 必须在 tokio 运行时内调用。
    pub fn spawn(name: &'static str) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Delivery>();

        tokio::spawn(async move {
            debug!("事件投递任务已启动: {}", name);
            while let Some(delivery) = receiver.recv().await {
                match delivery {
                    Delivery::Event {
                        subscription,
                        listener,
                        event,
                    } => Self::deliver(name, subscription, listener, event).await,
                    Delivery::Barrier(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("事件投递任务已停止: {}", name);
        });

        Self { sender }
    }

    async fn deliver(
        name: &'static str,
        subscription: SubscriptionId,
        listener: ChangeListener,
        event: ChangeEvent,
    ) {
        let kind = event.kind;
        let path = event.path.to_string();
        let key = event.key.clone().unwrap_or_default();

        match AssertUnwindSafe(listener(event)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(
                    store = name,
                    %subscription,
                    %kind,
                    path = %path,
                    key = %key,
                    "配置事件回调失败: {:#}",
                    e
                );
            }
            Err(_) => {
                error!(
                    store = name,
                    %subscription,
                    %kind,
                    path = %path,
                    key = %key,
                    "配置事件回调发生panic"
                );
            }
        }
    }

    /// 将事件加入投递队列
    pub fn enqueue(&self, subscription: SubscriptionId, listener: ChangeListener, event: ChangeEvent) {
        let delivery = Delivery::Event {
            subscription,
            listener,
            event,
        };
        if self.sender.send(delivery).is_err() {
            error!("事件投递任务已停止，丢弃事件: {}", subscription);
        }
    }

    /// 等待此前入队的所有事件投递完成
    pub async fn settled(&self) {
        let (done, wait) = oneshot::channel();
        if self.sender.send(Delivery::Barrier(done)).is_ok() {
            let _ = wait.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::event::{listener, EventKind};
    use crate::config::path::ConfigPath;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_events_delivered_in_order_and_failures_isolated() {
        let dispatcher = EventDispatcher::spawn("test");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let recorder = {
            let seen = Arc::clone(&seen);
            listener(move |event: ChangeEvent| {
                let seen = Arc::clone(&seen);
                async move {
                    let key = event.key.clone().unwrap_or_default();
                    seen.lock().unwrap().push(key.clone());
                    if key == "bad" {
                        anyhow::bail!("回调失败");
                    }
                    Ok(())
                }
            })
        };

        let path = ConfigPath::parse("observers").unwrap();
        for key in ["a", "bad", "b"] {
            dispatcher.enqueue(
                SubscriptionId(1),
                Arc::clone(&recorder),
                ChangeEvent::child(EventKind::ChildAdded, &path, key, serde_json::json!({})),
            );
        }
        dispatcher.settled().await;

        assert_eq!(*seen.lock().unwrap(), vec!["a", "bad", "b"]);
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_stop_queue() {
        let dispatcher = EventDispatcher::spawn("test");
        let path = ConfigPath::parse("x").unwrap();

        let panicking = listener(|event: ChangeEvent| async move {
            if event.value.is_none() {
                panic!("boom");
            }
            Ok(())
        });
        dispatcher.enqueue(SubscriptionId(1), panicking, ChangeEvent::value(&path, None));

        let (tx, rx) = oneshot::channel::<()>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let after = listener(move |_event: ChangeEvent| {
            let tx = Arc::clone(&tx);
            async move {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(());
                }
                Ok(())
            }
        });
        dispatcher.enqueue(SubscriptionId(2), after, ChangeEvent::value(&path, None));

        assert!(rx.await.is_ok());
    }
}
