// src/connection/replica_handler.rs

//! The replica-port connection handler, run by the master side.
//!
//! A slave connects, optionally pings or runs a consistency check, then
//! sends `RESYNC` with its last persisted data version. From that point the
//! connection is a replica session: the handler first streams the binlog
//! catch-up (attaching live slice content for writes), then forwards the
//! dispatcher's live queue, reading `ack` frames back the whole time.

use crate::core::SliceStoreError;
use crate::core::errors::status;
use crate::core::protocol::commands::{self, ResyncReq, cmd};
use crate::core::protocol::{Frame, FrameCodec};
use crate::core::registry::ServerStatus;
use crate::core::replication::sync;
use crate::core::state::ServerState;
use bytes::Bytes;
use futures::FutureExt;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// Handles one connection on the replica port.
pub struct ReplicaConnectionHandler {
    state: Arc<ServerState>,
    peer: SocketAddr,
}

impl ReplicaConnectionHandler {
    pub fn new(state: Arc<ServerState>, peer: SocketAddr) -> Self {
        Self { state, peer }
    }

    pub async fn run(self, stream: TcpStream, mut shutdown: watch::Receiver<bool>) {
        let mut framed = Framed::new(stream, FrameCodec);

        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                maybe_frame = framed.next() => {
                    let frame = match maybe_frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => {
                            debug!("replica peer {}: frame error: {}", self.peer, e);
                            return;
                        }
                        None => return,
                    };

                    match frame.header.cmd {
                        cmd::REPLICA_ACTIVE_TEST_REQ => {
                            let resp = Frame::response(
                                cmd::REPLICA_ACTIVE_TEST_REQ,
                                status::OK,
                                Bytes::new(),
                            );
                            if framed.send(resp).await.is_err() {
                                return;
                            }
                        }
                        cmd::CONSISTENCY_CHECK_REQ => {
                            let resp = match self.handle_consistency_check(&frame.body).await {
                                Ok(body) => Frame::response(
                                    cmd::CONSISTENCY_CHECK_REQ,
                                    status::OK,
                                    body,
                                ),
                                Err(e) => Frame::error_response(cmd::CONSISTENCY_CHECK_REQ, &e),
                            };
                            if framed.send(resp).await.is_err() {
                                return;
                            }
                        }
                        cmd::RESYNC_REQ => {
                            // The rest of the connection is a replica session.
                            self.run_replica_session(framed, &frame.body, shutdown).await;
                            return;
                        }
                        other => {
                            let err = SliceStoreError::Invalid(format!(
                                "unknown cmd: {}",
                                commands::cmd_name(other)
                            ));
                            if framed.send(Frame::error_response(other, &err)).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn handle_consistency_check(&self, body: &Bytes) -> Result<Bytes, SliceStoreError> {
        let (group_id, lines) = commands::parse_consistency_check_req(body)?;
        let first_unmatched = self.state.binlogs.check_consistency(group_id, &lines).await?;
        Ok(commands::encode_consistency_check_resp(first_unmatched))
    }

    async fn run_replica_session(
        &self,
        mut framed: Framed<TcpStream, FrameCodec>,
        body: &Bytes,
        shutdown: watch::Receiver<bool>,
    ) {
        let req = match ResyncReq::parse(body) {
            Ok(req) => req,
            Err(e) => {
                let _ = framed.send(Frame::error_response(cmd::RESYNC_REQ, &e)).await;
                return;
            }
        };

        if let Err(e) = self.validate_resync(&req) {
            let _ = framed.send(Frame::error_response(cmd::RESYNC_REQ, &e)).await;
            return;
        }

        // Position the catch-up reader before anything is promised. A
        // version we no longer retain means the slave needs a full rebuild.
        let reader = match self.state.binlogs.reader(req.group_id, req.start_version).await {
            Ok(reader) => reader,
            Err(e) => {
                let _ = framed.send(Frame::error_response(cmd::RESYNC_REQ, &e)).await;
                return;
            }
        };

        // Register the live queue first so no mutation can slip between
        // the catch-up stream and the live stream.
        let live_rx = self
            .state
            .dispatcher
            .register(req.group_id, req.server_id);
        self.state
            .registry
            .set_status(req.group_id, req.server_id, ServerStatus::Syncing);

        let durable = self.state.binlogs.durable_version(req.group_id);
        let handshake = Frame::response(
            cmd::RESYNC_REQ,
            status::OK,
            commands::encode_resync_resp(durable),
        );
        if framed.send(handshake).await.is_err() {
            self.state.dispatcher.unregister(req.group_id, req.server_id);
            return;
        }

        info!(
            "group {}: replica session for server {} from version {}",
            req.group_id, req.server_id, req.start_version
        );

        if let Err(e) = self
            .stream_to_slave(&mut framed, &req, reader, live_rx, shutdown)
            .await
        {
            debug!(
                "group {}: replica session for server {} ended: {}",
                req.group_id, req.server_id, e
            );
        }
        self.state.dispatcher.unregister(req.group_id, req.server_id);
    }

    fn validate_resync(&self, req: &ResyncReq) -> Result<(), SliceStoreError> {
        if !self.state.registry.am_master(req.group_id) {
            return Err(SliceStoreError::NoServer(format!(
                "server {} is not the master of group {}",
                self.state.registry.my_server_id, req.group_id
            )));
        }
        let group = self
            .state
            .registry
            .group(req.group_id)
            .ok_or_else(|| {
                SliceStoreError::NotFound(format!("data group {} not exist", req.group_id))
            })?;
        if group.member(req.server_id).is_none() {
            return Err(SliceStoreError::NotFound(format!(
                "server {} is not a member of group {}",
                req.server_id, req.group_id
            )));
        }
        Ok(())
    }

    /// The two-phase send loop: binlog catch-up, then the live queue.
    async fn stream_to_slave(
        &self,
        framed: &mut Framed<TcpStream, FrameCodec>,
        req: &ResyncReq,
        mut reader: crate::core::binlog::BinlogReader,
        mut live_rx: tokio::sync::mpsc::UnboundedReceiver<commands::ReplicaRpcBody>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), SliceStoreError> {
        // Catch-up: replay the retained history. Acks arriving meanwhile
        // are drained opportunistically so neither side's buffers fill up.
        while let Some(record) = reader.next_record().await? {
            let body = sync::load_replica_body(&self.state.engine, record).await?;
            framed
                .send(Frame::request(cmd::REPLICA_RPC_REQ, body.encode()))
                .await?;

            while let Some(maybe_frame) = framed.next().now_or_never() {
                match maybe_frame {
                    Some(frame) => self.handle_slave_frame(req, &frame?)?,
                    None => return Ok(()),
                }
            }
            if self.state.is_shutting_down() {
                return Ok(());
            }
        }

        // Live: forward the dispatcher queue until disconnect, demotion
        // (the dispatcher drops our sender) or shutdown.
        loop {
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                maybe_body = live_rx.recv() => {
                    let Some(body) = maybe_body else { return Ok(()) };
                    framed
                        .send(Frame::request(cmd::REPLICA_RPC_REQ, body.encode()))
                        .await?;
                }
                maybe_frame = framed.next() => {
                    match maybe_frame {
                        Some(frame) => self.handle_slave_frame(req, &frame?)?,
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    fn handle_slave_frame(&self, req: &ResyncReq, frame: &Frame) -> Result<(), SliceStoreError> {
        match frame.header.base_cmd() {
            cmd::REPLICA_ACK => {
                let data_version = commands::parse_replica_ack(&frame.body)?;
                self.state
                    .dispatcher
                    .ack(req.group_id, req.server_id, data_version);
                Ok(())
            }
            other => {
                warn!(
                    "group {}: unexpected frame {} from slave {}",
                    req.group_id,
                    commands::cmd_name(other),
                    req.server_id
                );
                Ok(())
            }
        }
    }
}
