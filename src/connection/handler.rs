// src/connection/handler.rs

//! The service-port connection handler: reads frames, dispatches on the
//! command id, and writes responses. Mutating commands are checked against
//! the session's idempotency channel, then enqueued on the data-worker pool
//! and awaited; everything else is answered inline.

use super::session::{ChannelRole, SessionState};
use crate::core::SliceStoreError;
use crate::core::data_worker::{OpKind, OpSource, SliceOpContext};
use crate::core::errors::status;
use crate::core::idempotency::{Admission, FinishedReply};
use crate::core::protocol::commands::{self, cmd};
use crate::core::protocol::{Frame, FrameCodec};
use crate::core::registry::{ServerStatus, persist};
use crate::core::slice_index::BlockKey;
use crate::core::state::ServerState;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

/// Derives the data group owning a block. All servers share the topology
/// tables, so the mapping is identical cluster-wide.
pub fn group_for_block(state: &ServerState, block: &BlockKey) -> u32 {
    let groups = &state.config.groups;
    let block_index = block.offset / state.config.file_block_size as i64;
    let mut hash = block.oid as u64;
    hash = hash.wrapping_mul(31).wrapping_add(block_index as u64);
    groups[(hash % groups.len() as u64) as usize].group_id
}

/// Handles one client connection on the service port.
pub struct ConnectionHandler {
    state: Arc<ServerState>,
    session: SessionState,
    peer: SocketAddr,
}

impl ConnectionHandler {
    pub fn new(state: Arc<ServerState>, peer: SocketAddr) -> Self {
        Self {
            state,
            session: SessionState::default(),
            peer,
        }
    }

    /// The connection's frame loop; returns when the peer disconnects or
    /// shutdown begins.
    pub async fn run(mut self, stream: TcpStream, mut shutdown: watch::Receiver<bool>) {
        let mut framed = Framed::new(stream, FrameCodec);
        self.state.connection_opened();

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                maybe_frame = framed.next() => {
                    let frame = match maybe_frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => {
                            debug!("client {}: frame error: {}", self.peer, e);
                            break;
                        }
                        None => break,
                    };

                    let request_cmd = frame.header.cmd;
                    let response = match self.dispatch(frame).await {
                        Ok(body) => Frame::response(request_cmd, status::OK, body),
                        Err(e) => {
                            debug!(
                                "client {}: {} failed: {}",
                                self.peer,
                                commands::cmd_name(request_cmd),
                                e
                            );
                            Frame::error_response(request_cmd, &e)
                        }
                    };
                    if let Err(e) = framed.send(response).await {
                        debug!("client {}: send failed: {}", self.peer, e);
                        break;
                    }
                }
            }
        }

        self.session.finish(&self.state.channels);
        self.state.connection_closed();
    }

    async fn dispatch(&mut self, frame: Frame) -> Result<Bytes, SliceStoreError> {
        if self.state.is_shutting_down() {
            return Err(SliceStoreError::ShuttingDown);
        }
        match frame.header.cmd {
            cmd::ACTIVE_TEST_REQ => Ok(Bytes::new()),
            cmd::CLIENT_JOIN_REQ => self.handle_client_join(&frame.body),
            cmd::SERVICE_STAT_REQ => self.handle_service_stat(&frame.body),
            cmd::CLUSTER_STAT_REQ => self.handle_cluster_stat(&frame.body),
            cmd::DISK_SPACE_STAT_REQ => self.handle_disk_space_stat(&frame.body),
            cmd::GET_MASTER_REQ => self.handle_get_master(&frame.body),
            cmd::GET_LEADER_REQ => self.handle_get_leader(&frame.body),
            cmd::GET_READABLE_SERVER_REQ => self.handle_get_readable_server(&frame.body),
            cmd::SLICE_READ_REQ => self.handle_slice_read(&frame.body).await,
            cmd::SLICE_WRITE_REQ => self.handle_update(OpKind::SliceWrite, &frame.body).await,
            cmd::SLICE_ALLOCATE_REQ => self.handle_update(OpKind::SliceAllocate, &frame.body).await,
            cmd::SLICE_DELETE_REQ => self.handle_update(OpKind::SliceDelete, &frame.body).await,
            cmd::BLOCK_DELETE_REQ => self.handle_update(OpKind::BlockDelete, &frame.body).await,
            cmd::SETUP_CHANNEL_REQ => self.handle_setup_channel(&frame.body),
            cmd::CLOSE_CHANNEL_REQ => self.handle_close_channel(&frame.body),
            cmd::REBIND_CHANNEL_REQ => self.handle_rebind_channel(&frame.body),
            cmd::REPORT_REQ_RECEIPT_REQ => self.handle_report_receipt(&frame.body),
            unknown => Err(SliceStoreError::Invalid(format!(
                "unknown cmd: {}",
                commands::cmd_name(unknown)
            ))),
        }
    }

    // --- session commands ---

    fn handle_client_join(&mut self, body: &Bytes) -> Result<Bytes, SliceStoreError> {
        let req = commands::ClientJoinReq::parse(body)?;

        let my_group_count = self.state.config.groups.len() as u32;
        if req.data_group_count != my_group_count {
            return Err(SliceStoreError::Invalid(format!(
                "client data group count: {} != mine: {}",
                req.data_group_count, my_group_count
            )));
        }
        if req.file_block_size != self.state.config.file_block_size {
            return Err(SliceStoreError::Invalid(format!(
                "file block size: {} != mine: {}",
                req.file_block_size, self.state.config.file_block_size
            )));
        }

        if req.flags & commands::JOIN_FLAG_IDEMPOTENCY != 0 {
            if self.session.has_channel() {
                return Err(SliceStoreError::Exists(
                    "channel already bound to this connection".into(),
                ));
            }
            let channel = self.state.channels.rebind(req.channel_id, req.key)?;
            self.session.channel = ChannelRole::User(channel);
        }

        // The largest request body a client should build: one full slice
        // plus the keyed header and the idempotency prefix.
        let buffer_size = self.state.config.file_block_size
            + (commands::BLOCK_SLICE_KEY_LEN + commands::IDEMPOTENCY_PREFIX_LEN) as u32;
        Ok(commands::encode_client_join_resp(buffer_size))
    }

    fn handle_service_stat(&self, body: &Bytes) -> Result<Bytes, SliceStoreError> {
        if !body.is_empty() {
            return Err(SliceStoreError::Invalid(format!(
                "SERVICE_STAT: body length {} != expected 0",
                body.len()
            )));
        }
        let resp = commands::ServiceStatResp {
            is_leader: self.state.registry.is_leader(),
            server_id: self.state.registry.my_server_id,
            conn_current: self.state.conn_current.load(Ordering::Acquire) as u32,
            conn_max: self.state.config.max_clients as u32,
        };
        Ok(resp.encode())
    }

    // --- cluster lookups ---

    fn handle_cluster_stat(&self, body: &Bytes) -> Result<Bytes, SliceStoreError> {
        let filter = match body.len() {
            0 => None,
            4 => Some(commands::parse_group_id(body, "CLUSTER_STAT")?),
            other => {
                return Err(SliceStoreError::Invalid(format!(
                    "invalid request body length: {other} != 0 or 4"
                )));
            }
        };
        if let Some(group_id) = filter
            && self.state.registry.group(group_id).is_none()
        {
            return Err(SliceStoreError::NotFound(format!(
                "data group {group_id} not exist"
            )));
        }

        let rows: Vec<_> = self
            .state
            .registry
            .cluster_stat(filter)
            .into_iter()
            .map(|row| {
                let entry = self
                    .state
                    .registry
                    .server_entry(row.server_id)
                    .expect("stat row references configured server");
                (row, entry.host.clone(), entry.service_port)
            })
            .collect();
        Ok(commands::encode_cluster_stat_resp(&rows))
    }

    fn handle_disk_space_stat(&self, body: &Bytes) -> Result<Bytes, SliceStoreError> {
        if !body.is_empty() {
            return Err(SliceStoreError::Invalid(format!(
                "DISK_SPACE_STAT: body length {} != expected 0",
                body.len()
            )));
        }
        let stat = persist::disk_space_stat(self.state.data_dir());
        Ok(commands::encode_disk_space_resp(
            stat.total, stat.used, stat.avail,
        ))
    }

    fn handle_get_master(&self, body: &Bytes) -> Result<Bytes, SliceStoreError> {
        let group_id = commands::parse_group_id(body, "GET_MASTER")?;
        let (server_id, entry) = self.state.registry.get_master(group_id)?;
        Ok(commands::ServerAddrResp {
            server_id,
            host: entry.host,
            port: entry.service_port,
        }
        .encode())
    }

    fn handle_get_leader(&self, body: &Bytes) -> Result<Bytes, SliceStoreError> {
        if !body.is_empty() {
            return Err(SliceStoreError::Invalid(format!(
                "GET_LEADER: body length {} != expected 0",
                body.len()
            )));
        }
        let entry = self.state.registry.get_leader()?;
        Ok(commands::ServerAddrResp {
            server_id: entry.id,
            host: entry.host,
            port: entry.service_port,
        }
        .encode())
    }

    fn handle_get_readable_server(&self, body: &Bytes) -> Result<Bytes, SliceStoreError> {
        let group_id = commands::parse_group_id(body, "GET_READABLE_SERVER")?;
        let (server_id, entry) = self.state.registry.get_readable_server(group_id)?;
        Ok(commands::ServerAddrResp {
            server_id,
            host: entry.host,
            port: entry.service_port,
        }
        .encode())
    }

    // --- slice data plane ---

    async fn handle_slice_read(&self, body: &Bytes) -> Result<Bytes, SliceStoreError> {
        let (key, _) = commands::parse_slice_request(body, false)?;
        let group_id = group_for_block(&self.state, &key.block);

        let me = self.state.registry.my_server_id;
        if self.state.registry.status_of(group_id, me) != Some(ServerStatus::Active) {
            return Err(SliceStoreError::NoServer(format!(
                "server not readable for group {group_id}"
            )));
        }
        if key.slice.length > self.state.config.file_block_size {
            return Err(SliceStoreError::Overflow(format!(
                "read slice length: {} > buffer size: {}",
                key.slice.length, self.state.config.file_block_size
            )));
        }

        let read = self.state.workers.execute_master(SliceOpContext {
            kind: OpKind::SliceRead,
            source: OpSource::MasterService,
            group_id,
            key,
            payload: Bytes::new(),
            data_version: 0,
        });
        let output = tokio::time::timeout(self.state.config.request_deadline, read)
            .await
            .map_err(|_| SliceStoreError::Busy("read deadline exceeded".into()))??;
        Ok(output.data)
    }

    /// The shared path of every mutating command: idempotency admission,
    /// master check, worker execution, response caching.
    async fn handle_update(&mut self, kind: OpKind, body: &Bytes) -> Result<Bytes, SliceStoreError> {
        // Strip the idempotency prefix when this session runs over a
        // user channel.
        let (dedup, body) = match self.session.user_channel() {
            Some(channel) => {
                if !channel.is_valid() {
                    return Err(SliceStoreError::ChannelInvalid(format!(
                        "channel {} is invalid",
                        channel.id
                    )));
                }
                let (prefix, rest) = commands::IdempotencyPrefix::strip(body)?;
                if prefix.channel_id != channel.id {
                    return Err(SliceStoreError::Invalid(format!(
                        "prefix channel {} != bound channel {}",
                        prefix.channel_id, channel.id
                    )));
                }
                match channel.begin(prefix.req_id) {
                    Admission::Fresh => (Some((channel.clone(), prefix.req_id)), rest),
                    Admission::InFlight => return Err(SliceStoreError::Again),
                    Admission::Finished(reply) => {
                        return Ok(commands::SliceUpdateResp {
                            done_bytes: reply.done_bytes as i32,
                            inc_alloc: reply.inc_alloc as i32,
                        }
                        .encode());
                    }
                }
            }
            None => (None, body.clone()),
        };

        // The work is spawned so it runs to completion even when the
        // deadline below fires first: a timed-out request's idempotency
        // entry stays in flight until the worker finishes, at which point
        // the cached result serves the client's next retry.
        let state = self.state.clone();
        let dedup_for_work = dedup.clone();
        let work = tokio::spawn(async move {
            let result = Self::execute_update(&state, kind, &body).await;
            match (&result, dedup_for_work) {
                (Ok(resp), Some((channel, req_id))) => {
                    channel.finish(
                        req_id,
                        FinishedReply {
                            status: status::OK,
                            done_bytes: resp.done_bytes as u32,
                            inc_alloc: resp.inc_alloc as i64,
                        },
                    );
                }
                // A failed attempt had no effect; the retry re-executes.
                (Err(_), Some((channel, req_id))) => channel.abandon(req_id),
                _ => {}
            }
            result
        });

        match tokio::time::timeout(self.state.config.request_deadline, work).await {
            Ok(Ok(result)) => result.map(|resp| resp.encode()),
            Ok(Err(join_error)) => {
                if let Some((channel, req_id)) = dedup {
                    channel.abandon(req_id);
                }
                Err(SliceStoreError::Io(Arc::new(std::io::Error::other(
                    format!("update task failed: {join_error}"),
                ))))
            }
            Err(_) => Err(SliceStoreError::Busy(
                "deadline exceeded, request still processing".into(),
            )),
        }
    }

    async fn execute_update(
        state: &Arc<ServerState>,
        kind: OpKind,
        body: &Bytes,
    ) -> Result<commands::SliceUpdateResp, SliceStoreError> {
        let with_payload = kind == OpKind::SliceWrite;
        let (key, payload) = commands::parse_slice_request(body, with_payload)?;
        let group_id = group_for_block(state, &key.block);

        if !state.registry.am_master(group_id) {
            return Err(SliceStoreError::NoServer(format!(
                "server {} is not the master of group {}",
                state.registry.my_server_id, group_id
            )));
        }

        let output = state
            .workers
            .execute_master(SliceOpContext {
                kind,
                source: OpSource::MasterService,
                group_id,
                key,
                payload,
                data_version: 0,
            })
            .await?;

        Ok(commands::SliceUpdateResp {
            done_bytes: output.done_bytes as i32,
            inc_alloc: output.inc_alloc as i32,
        })
    }

    // --- idempotency channels ---

    fn handle_setup_channel(&mut self, body: &Bytes) -> Result<Bytes, SliceStoreError> {
        // The client may suggest an old `(id, key)`; the server always
        // assigns fresh ones, so only the shape is validated here.
        commands::ChannelIdKey::parse(body, "SETUP_CHANNEL")?;
        if let Some(existing) = self.session.holder_channel() {
            return Err(SliceStoreError::Exists(format!(
                "channel already setup, the channel id: {}",
                existing.id
            )));
        }

        let channel = self.state.channels.setup()?;
        let resp = commands::ChannelIdKey {
            channel_id: channel.id,
            key: channel.key,
        };
        self.session.channel = ChannelRole::Holder(channel);
        Ok(resp.encode())
    }

    fn handle_close_channel(&mut self, body: &Bytes) -> Result<Bytes, SliceStoreError> {
        if !body.is_empty() {
            return Err(SliceStoreError::Invalid(format!(
                "CLOSE_CHANNEL: body length {} != expected 0",
                body.len()
            )));
        }
        let Some(channel) = self.session.holder_channel() else {
            return Err(SliceStoreError::Invalid(
                "connection holds no channel".into(),
            ));
        };
        self.state.channels.close(channel.id)?;
        self.session.channel = ChannelRole::None;
        Ok(Bytes::new())
    }

    fn handle_rebind_channel(&mut self, body: &Bytes) -> Result<Bytes, SliceStoreError> {
        let req = commands::ChannelIdKey::parse(body, "REBIND_CHANNEL")?;
        let channel = self.state.channels.rebind(req.channel_id, req.key)?;
        self.session.channel = ChannelRole::User(channel);
        Ok(Bytes::new())
    }

    fn handle_report_receipt(&mut self, body: &Bytes) -> Result<Bytes, SliceStoreError> {
        let Some(channel) = self.session.holder_channel() else {
            return Err(SliceStoreError::Invalid(
                "connection holds no channel".into(),
            ));
        };
        let req_ids = commands::parse_report_receipt_req(body)?;
        let mut success = 0usize;
        for req_id in &req_ids {
            if channel.remove_receipt(*req_id) {
                success += 1;
            }
        }
        if success < req_ids.len() {
            warn!(
                "receipt count: {}, success: {}",
                req_ids.len(),
                success
            );
        }
        Ok(Bytes::new())
    }
}
