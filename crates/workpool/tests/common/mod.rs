//! Executors shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, ensure};
use parking_lot::Mutex;
use serde_json::json;
use stupid_workpool::{TaskExecutor, TaskResult, ThreadSpawner, TransferBuffer, Worker, WorkerSpawner};

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Stateless tasks used by the scheduler tests.
pub fn pool_executor() -> Arc<TaskExecutor> {
    Arc::new(
        TaskExecutor::new("pool")
            .sync_task("simpleTask", |_| Ok(json!(true).into()))
            .sync_task("addNumbers", |call| {
                let (a, b): (i64, i64) = (call.arg(0)?, call.arg(1)?);
                Ok(json!(a + b).into())
            })
            .sync_task("numberTransfer", |call| {
                Ok(json!(call.buffer(0)?.to_u32s()).into())
            })
            .task("waitAndPing", |call| async move {
                let ms: u64 = call.arg(0)?;
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!("pong").into())
            }),
    )
}

/// Stateful tasks; every call builds a fresh executor, so state is per worker.
pub fn api_executor() -> Arc<TaskExecutor> {
    let id: Arc<Mutex<Option<u32>>> = Arc::new(Mutex::new(None));
    let last_transfer: Arc<Mutex<Option<TransferBuffer>>> = Arc::new(Mutex::new(None));

    let set_id = Arc::clone(&id);
    let bounce_id = Arc::clone(&id);
    let keep = Arc::clone(&last_transfer);

    Arc::new(
        TaskExecutor::new("api")
            .sync_task("initialize", |_| Ok(json!(true).into()))
            .sync_task("setID", move |call| {
                let new_id: u32 = call.arg(0)?;
                let mut id = set_id.lock();
                if let Some(existing) = *id {
                    bail!("this worker already has an ID: {existing}");
                }
                *id = Some(new_id);
                Ok(json!(true).into())
            })
            .task("bounceNumber", move |call| {
                let id = *bounce_id.lock();
                async move {
                    let number: u32 = call.arg(0)?;
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok(json!({ "number": number, "id": id }).into())
                }
            })
            .sync_task("bounceTransfer", move |call| {
                let reference: Vec<u32> = call.arg(0)?;
                let buffer = call.buffer(0)?.clone();
                let received = buffer.to_u32s();
                ensure!(
                    received == reference,
                    "transferred values {received:?} differ from the reference {reference:?}"
                );
                *keep.lock() = Some(buffer.clone());
                Ok(TaskResult::new(json!(received)).with_transfer(vec![buffer]))
            })
            .sync_task("checkLastTransfer", move |_| {
                let last = last_transfer.lock();
                let Some(buffer) = last.as_ref() else {
                    bail!("nothing was transferred yet");
                };
                Ok(json!(buffer.is_empty()).into())
            }),
    )
}

pub async fn spawn_workers(spawner: &ThreadSpawner, prefix: &str, count: usize) -> Vec<Worker> {
    let mut workers = Vec::with_capacity(count);
    for i in 0..count {
        workers.push(spawner.spawn(&format!("{prefix}-{i}")).await.unwrap());
    }
    workers
}
