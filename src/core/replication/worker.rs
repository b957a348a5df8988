// src/core/replication/worker.rs

//! The slave-side follower: one task per data group where this server is a
//! slave. It connects to the group's master on the replica port, resyncs
//! from its own last persisted data version, then applies the live stream
//! in order, acking each applied version.

use crate::core::SliceStoreError;
use crate::core::binlog::BinlogOpType;
use crate::core::data_worker::{OpKind, OpSource, SliceOpContext};
use crate::core::errors::status;
use crate::core::protocol::commands::{self, ReplicaRpcBody, ResyncReq, cmd};
use crate::core::protocol::{Frame, FrameCodec};
use crate::core::registry::ServerStatus;
use crate::core::slice_index::{SliceKey, SliceRange};
use crate::core::state::ServerState;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Runs the follower loop for one group until shutdown.
pub async fn run(state: Arc<ServerState>, group_id: u32, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        match follow_once(&state, group_id, &mut shutdown).await {
            Ok(true) => return, // shutdown observed inside
            Ok(false) => {}
            Err(e) => {
                debug!("group {}: follower session ended: {}", group_id, e);
                let me = state.registry.my_server_id;
                if matches!(
                    state.registry.status_of(group_id, me),
                    Some(ServerStatus::Syncing | ServerStatus::Active)
                ) {
                    state.registry.set_status(group_id, me, ServerStatus::Offline);
                }
            }
        }
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

/// One connection attempt plus the apply loop. Returns `Ok(true)` when the
/// loop exited because of shutdown.
async fn follow_once(
    state: &Arc<ServerState>,
    group_id: u32,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<bool, SliceStoreError> {
    let me = state.registry.my_server_id;
    if state.registry.am_master(group_id) {
        return Ok(false);
    }
    let (master_id, master) = state.registry.get_master(group_id)?;
    if master_id == me {
        return Ok(false);
    }

    let stream = TcpStream::connect(master.replica_addr()).await?;
    let mut framed = Framed::new(stream, FrameCodec);

    let start_version = state.registry.my_data_version(group_id) + 1;
    let resync = ResyncReq {
        group_id,
        server_id: me,
        start_version,
    };
    framed
        .send(Frame::request(cmd::RESYNC_REQ, resync.encode()))
        .await?;

    let resp = framed
        .next()
        .await
        .ok_or_else(|| SliceStoreError::Io(Arc::new(std::io::Error::other(
            "master closed during resync handshake",
        ))))??;
    if resp.header.status == status::DATA_VERSION_TOO_OLD {
        // Our window is gone from the master's log; a data rebuild from
        // the group peers is required before we can follow again.
        state.registry.set_status(group_id, me, ServerStatus::Rebuilding);
        return Err(SliceStoreError::DataVersionTooOld {
            requested: start_version,
            oldest: 0,
        });
    }
    if resp.header.status != status::OK {
        return Err(SliceStoreError::Invalid(format!(
            "resync rejected with status {}: {}",
            resp.header.status,
            String::from_utf8_lossy(&resp.body)
        )));
    }
    let target = commands::parse_resync_resp(&resp.body)?;

    info!(
        "group {}: syncing from master {} at version {}, target {}",
        group_id,
        master_id,
        start_version - 1,
        target
    );
    state.registry.set_status(group_id, me, ServerStatus::Syncing);
    if state.registry.my_data_version(group_id) >= target {
        state.registry.set_status(group_id, me, ServerStatus::Active);
    }

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                state.registry.set_status(group_id, me, ServerStatus::Offline);
                return Ok(true);
            }
            maybe_frame = framed.next() => {
                let Some(frame) = maybe_frame else {
                    state.registry.set_status(group_id, me, ServerStatus::Offline);
                    return Ok(false);
                };
                let frame = frame?;
                match frame.header.base_cmd() {
                    cmd::REPLICA_RPC_REQ => {
                        let body = ReplicaRpcBody::parse(&frame.body)?;
                        let data_version = body.record.data_version;
                        // Catch-up and live streams can overlap; versions at
                        // or below ours have already been applied.
                        if data_version > state.registry.my_data_version(group_id) {
                            apply_replica_op(state, group_id, body).await?;
                        }
                        framed
                            .send(Frame::request(
                                cmd::REPLICA_ACK,
                                commands::encode_replica_ack(data_version),
                            ))
                            .await?;
                        if data_version >= target
                            && state.registry.status_of(group_id, me)
                                == Some(ServerStatus::Syncing)
                        {
                            info!("group {}: caught up at version {}", group_id, data_version);
                            state.registry.set_status(group_id, me, ServerStatus::Active);
                        }
                    }
                    cmd::REPLICA_ACTIVE_TEST_REQ => {
                        framed
                            .send(Frame::response(
                                cmd::REPLICA_ACTIVE_TEST_REQ,
                                status::OK,
                                Bytes::new(),
                            ))
                            .await?;
                    }
                    other => {
                        warn!("group {}: unexpected replica frame {}", group_id,
                            commands::cmd_name(other));
                    }
                }
            }
        }
    }
}

/// Applies one replicated mutation through the slave worker array.
async fn apply_replica_op(
    state: &Arc<ServerState>,
    group_id: u32,
    body: ReplicaRpcBody,
) -> Result<(), SliceStoreError> {
    let record = body.record;

    if record.op_type == BinlogOpType::NoOp {
        // Version padding: advance and log, nothing to apply.
        state
            .registry
            .set_my_data_version(group_id, record.data_version);
        state.binlogs.append(group_id, &record).await?;
        return Ok(());
    }

    let kind = match record.op_type {
        BinlogOpType::WriteSlice => OpKind::SliceWrite,
        BinlogOpType::AllocSlice => OpKind::SliceAllocate,
        BinlogOpType::DelSlice => OpKind::SliceDelete,
        BinlogOpType::DelBlock => OpKind::BlockDelete,
        BinlogOpType::NoOp => unreachable!("handled above"),
    };

    let ctx = SliceOpContext {
        kind,
        source: OpSource::Replication,
        group_id,
        key: SliceKey {
            block: record.block,
            slice: record.slice.unwrap_or(SliceRange {
                offset: 0,
                length: 0,
            }),
        },
        payload: body.payload,
        data_version: record.data_version,
    };
    state.workers.execute_replica(ctx).await?;
    Ok(())
}
