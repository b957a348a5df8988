// src/core/data_worker/mod.rs

//! The hash-sharded data-worker pool.
//!
//! Two worker arrays — *master* for client RPCs and *slave* for replicated
//! replays — each own a set of unbounded queues. An operation is routed by
//! `hash(oid, block_offset)`, so everything touching one block lands on one
//! worker and runs in FIFO order; no global lock, no cross-block promises.
//!
//! The original continuation dance ("handler returns CONTINUE, worker wakes
//! it later") is expressed as a `oneshot` completion per operation: the
//! front-end awaits it, the worker fires it after replication fan-out and
//! the binlog append.

use crate::core::SliceStoreError;
use crate::core::binlog::{BinlogOpType, BinlogRecord, BinlogSet, RecordSource};
use crate::core::engine::SliceEngine;
use crate::core::protocol::commands::ReplicaRpcBody;
use crate::core::registry::ClusterRegistry;
use crate::core::replication::ReplicationDispatcher;
use crate::core::slice_index::{SliceKey, SliceRange};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, warn};

/// What a data worker is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    SliceRead,
    SliceWrite,
    SliceAllocate,
    SliceDelete,
    BlockDelete,
}

impl OpKind {
    pub fn is_update(&self) -> bool {
        !matches!(self, OpKind::SliceRead)
    }
}

/// Which side of the server the operation entered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpSource {
    /// A client RPC accepted because this server is the group's master.
    MasterService,
    /// A mutation replayed from the group's master.
    Replication,
}

/// Everything a worker needs to execute one operation.
#[derive(Debug, Clone)]
pub struct SliceOpContext {
    pub kind: OpKind,
    pub source: OpSource,
    pub group_id: u32,
    pub key: SliceKey,
    /// Write payload; empty for every other kind.
    pub payload: Bytes,
    /// `0` on the master (the worker assigns the next version); the
    /// master-assigned version on replicated replays.
    pub data_version: u64,
}

/// The completed result handed back through the operation's notifier.
#[derive(Debug, Clone, Default)]
pub struct OpOutput {
    pub done_bytes: u32,
    pub inc_alloc: i64,
    /// Read data; empty for updates.
    pub data: Bytes,
    /// The data version the mutation was committed at; `0` for reads.
    pub data_version: u64,
}

struct Operation {
    ctx: SliceOpContext,
    notify_tx: oneshot::Sender<Result<OpOutput, SliceStoreError>>,
}

/// Shared collaborators every worker uses.
pub struct WorkerShared {
    pub engine: Arc<SliceEngine>,
    pub binlogs: Arc<BinlogSet>,
    pub registry: Arc<ClusterRegistry>,
    pub dispatcher: Arc<ReplicationDispatcher>,
}

/// The two worker arrays. Cloneable handle; the workers themselves are
/// spawned tasks owning the receive side of each queue.
#[derive(Clone)]
pub struct WorkerPool {
    master: Arc<Vec<mpsc::UnboundedSender<Operation>>>,
    slave: Arc<Vec<mpsc::UnboundedSender<Operation>>>,
}

impl WorkerPool {
    /// Spawns `per_array` workers for each of the master and slave arrays.
    pub fn spawn(
        shared: Arc<WorkerShared>,
        per_array: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let spawn_array = |name: &'static str| {
            (0..per_array)
                .map(|index| {
                    let (tx, rx) = mpsc::unbounded_channel();
                    tokio::spawn(worker_loop(
                        name,
                        index,
                        shared.clone(),
                        rx,
                        shutdown.clone(),
                    ));
                    tx
                })
                .collect::<Vec<_>>()
        };

        Self {
            master: Arc::new(spawn_array("master")),
            slave: Arc::new(spawn_array("slave")),
        }
    }

    fn route(senders: &[mpsc::UnboundedSender<Operation>], key: &SliceKey) -> usize {
        let mut hash = key.block.oid as u64;
        hash = hash.wrapping_mul(31).wrapping_add(key.block.offset as u64);
        (hash % senders.len() as u64) as usize
    }

    async fn execute(
        senders: &[mpsc::UnboundedSender<Operation>],
        ctx: SliceOpContext,
    ) -> Result<OpOutput, SliceStoreError> {
        let (notify_tx, notify_rx) = oneshot::channel();
        let op = Operation { ctx, notify_tx };
        let index = Self::route(senders, &op.ctx.key);
        senders[index]
            .send(op)
            .map_err(|_| SliceStoreError::ShuttingDown)?;
        notify_rx.await.map_err(|_| SliceStoreError::ShuttingDown)?
    }

    /// Runs an operation on the master array and awaits its completion.
    pub async fn execute_master(&self, ctx: SliceOpContext) -> Result<OpOutput, SliceStoreError> {
        Self::execute(&self.master, ctx).await
    }

    /// Runs a replicated replay on the slave array.
    pub async fn execute_replica(&self, ctx: SliceOpContext) -> Result<OpOutput, SliceStoreError> {
        Self::execute(&self.slave, ctx).await
    }
}

async fn worker_loop(
    name: &'static str,
    index: usize,
    shared: Arc<WorkerShared>,
    mut rx: mpsc::UnboundedReceiver<Operation>,
    shutdown: watch::Receiver<bool>,
) {
    debug!("{} data worker {} started", name, index);
    while let Some(op) = rx.recv().await {
        if *shutdown.borrow() {
            // Drain: operations that have not begun get a synthetic error.
            let _ = op.notify_tx.send(Err(SliceStoreError::ShuttingDown));
            continue;
        }
        let result = process_operation(&shared, op.ctx).await;
        let _ = op.notify_tx.send(result);
    }
    debug!("{} data worker {} stopped", name, index);
}

async fn process_operation(
    shared: &WorkerShared,
    ctx: SliceOpContext,
) -> Result<OpOutput, SliceStoreError> {
    let engine = &shared.engine;
    let result = match ctx.kind {
        OpKind::SliceRead => {
            return engine.read_slice(&ctx.key).await.map(|data| OpOutput {
                done_bytes: data.len() as u32,
                inc_alloc: 0,
                data,
                data_version: 0,
            });
        }
        OpKind::SliceWrite => engine.write_slice(&ctx.key, &ctx.payload).await,
        OpKind::SliceAllocate => engine.allocate_slice(&ctx.key).await,
        OpKind::SliceDelete => engine.delete_slices(&ctx.key),
        OpKind::BlockDelete => engine.delete_block(&ctx.key),
    };

    let update = match result {
        Ok(update) => update,
        // A replayed delete of state that is already gone has converged;
        // the version must still advance to match the master's history.
        Err(SliceStoreError::NotFound(_)) if ctx.source == OpSource::Replication => {
            crate::core::engine::UpdateResult::default()
        }
        Err(e) => return Err(e),
    };

    finish_update(shared, &ctx, update).await
}

/// The post-apply half of every successful update: assign the data version,
/// append the binlog record and fan out to the slaves in one ordered step,
/// and only then report completion.
async fn finish_update(
    shared: &WorkerShared,
    ctx: &SliceOpContext,
    update: crate::core::engine::UpdateResult,
) -> Result<OpOutput, SliceStoreError> {
    let payload = if ctx.kind == OpKind::SliceWrite {
        ctx.payload.slice(..update.done_bytes as usize)
    } else {
        Bytes::new()
    };

    let data_version = if ctx.data_version == 0 {
        // Master path: the binlog writer is the version authority. The
        // append and the replication push share its lock, so versions hit
        // both the log and every slave queue in the same order even when
        // workers on different blocks commit concurrently.
        match shared
            .binlogs
            .append_assigned(
                ctx.group_id,
                |data_version| binlog_record(ctx, data_version, update.done_bytes),
                |record| {
                    if ctx.source == OpSource::MasterService {
                        shared.dispatcher.push(
                            ctx.group_id,
                            ReplicaRpcBody {
                                record: *record,
                                payload,
                            },
                        );
                    }
                },
            )
            .await
        {
            Ok(record) => record.data_version,
            // The client still sees its (possibly partial) result; the
            // slaves re-converge through resync.
            Err(e) => {
                let fallback = shared.registry.next_data_version(ctx.group_id)?;
                error!(
                    "group {}: binlog append at version {} failed: {}",
                    ctx.group_id, fallback, e
                );
                return Ok(OpOutput {
                    done_bytes: update.done_bytes,
                    inc_alloc: update.inc_alloc,
                    data: Bytes::new(),
                    data_version: fallback,
                });
            }
        }
    } else {
        // Replicated replay: the master's version is binding, and the
        // follower applies strictly in order.
        let record = binlog_record(ctx, ctx.data_version, update.done_bytes);
        if let Err(e) = shared.binlogs.append(ctx.group_id, &record).await {
            error!(
                "group {}: binlog append of replayed version {} failed: {}",
                ctx.group_id, ctx.data_version, e
            );
        }
        ctx.data_version
    };

    shared
        .registry
        .set_my_data_version(ctx.group_id, data_version);

    Ok(OpOutput {
        done_bytes: update.done_bytes,
        inc_alloc: update.inc_alloc,
        data: Bytes::new(),
        data_version,
    })
}

fn binlog_record(ctx: &SliceOpContext, data_version: u64, done_bytes: u32) -> BinlogRecord {
    let source = match ctx.source {
        OpSource::MasterService => RecordSource::Rpc,
        OpSource::Replication => RecordSource::Replay,
    };
    match ctx.kind {
        OpKind::SliceWrite => BinlogRecord::slice_op(
            BinlogOpType::WriteSlice,
            source,
            data_version,
            ctx.key.block,
            // A short trunk write persists a correspondingly shorter slice.
            SliceRange::new(ctx.key.slice.offset, done_bytes),
        ),
        OpKind::SliceAllocate => BinlogRecord::slice_op(
            BinlogOpType::AllocSlice,
            source,
            data_version,
            ctx.key.block,
            ctx.key.slice,
        ),
        OpKind::SliceDelete => BinlogRecord::slice_op(
            BinlogOpType::DelSlice,
            source,
            data_version,
            ctx.key.block,
            ctx.key.slice,
        ),
        OpKind::BlockDelete => BinlogRecord::block_op(
            BinlogOpType::DelBlock,
            source,
            data_version,
            ctx.key.block,
        ),
        OpKind::SliceRead => {
            warn!("read reached binlog_record; treating as no-op");
            BinlogRecord::block_op(BinlogOpType::NoOp, source, data_version, ctx.key.block)
        }
    }
}
