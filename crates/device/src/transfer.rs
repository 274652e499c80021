//! USB token execution over the socket transport
//!
//! Each SETUP, IN or OUT token becomes exactly one encode -> send -> receive
//! -> decode round trip. The handler also carries the per-transfer state that
//! USB control transfers need:
//!
//! - a SET_ADDRESS seen at SETUP time is held as a pending address and only
//!   reported for application after the status-stage IN succeeds
//! - an IN on endpoint 0 marks a control read in progress, so the zero-length
//!   OUT status stage that follows is completed locally (the wire protocol
//!   has no frame for a handshake-only stage)

use crate::error::TransportError;
use crate::transport::Transport;
use common::{TransferMetrics, TransferOutcome};
use protocol::{SetupPacket, TransferReply, TransferRequest};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Result of an IN round trip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InCompletion {
    pub reply: TransferReply,
    /// Address from an earlier SET_ADDRESS that takes effect now
    pub applied_address: Option<u8>,
}

pub struct TransferHandler {
    transport: Transport,
    pending_address: Option<u8>,
    control_read_in_progress: bool,
    metrics: Arc<TransferMetrics>,
}

impl TransferHandler {
    pub fn new(transport: Transport, metrics: Arc<TransferMetrics>) -> Self {
        Self {
            transport,
            pending_address: None,
            control_read_in_progress: false,
            metrics,
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut Transport {
        &mut self.transport
    }

    pub fn pending_address(&self) -> Option<u8> {
        self.pending_address
    }

    pub fn control_read_in_progress(&self) -> bool {
        self.control_read_in_progress
    }

    /// Forget any half-finished control transfer
    pub fn clear(&mut self) {
        self.pending_address = None;
        self.control_read_in_progress = false;
    }

    /// Forward a SETUP stage
    ///
    /// A standard SET_ADDRESS is remembered once the peer accepts the SETUP;
    /// the device address itself is left alone until the status stage.
    pub async fn setup(&mut self, request: &[u8]) -> Result<TransferReply, TransportError> {
        self.control_read_in_progress = false;
        self.pending_address = None;

        let reply = self
            .round_trip(
                TransferRequest::Setup {
                    request: request.to_vec(),
                },
                usize::MAX,
            )
            .await?;

        if matches!(reply, TransferReply::Ok(_))
            && let Some(address) = SetupPacket::parse(request)
                .ok()
                .and_then(|setup| setup.set_address_target())
        {
            debug!("SET_ADDRESS({}) pending until status stage", address);
            self.pending_address = Some(address);
        }

        Ok(reply)
    }

    /// Forward an IN token
    pub async fn data_in(
        &mut self,
        endpoint: u8,
        max_len: usize,
    ) -> Result<InCompletion, TransportError> {
        if endpoint == 0 {
            self.control_read_in_progress = true;
        }

        let reply = self
            .round_trip(TransferRequest::In { endpoint }, max_len)
            .await?;

        let applied_address = match reply {
            TransferReply::Ok(_) => self.pending_address.take(),
            _ => None,
        };

        Ok(InCompletion {
            reply,
            applied_address,
        })
    }

    /// Forward an OUT token, or complete a control-read status stage locally
    pub async fn data_out(
        &mut self,
        endpoint: u8,
        data: &[u8],
    ) -> Result<TransferReply, TransportError> {
        if endpoint == 0 && data.is_empty() && self.control_read_in_progress {
            self.control_read_in_progress = false;
            self.metrics.record_short_circuit();
            trace!("Completed control-read status stage locally");
            return Ok(TransferReply::Ok(Vec::new()));
        }

        self.round_trip(
            TransferRequest::Out {
                endpoint,
                data: data.to_vec(),
            },
            0,
        )
        .await
    }

    /// One request/reply exchange with signal delivery suspended throughout
    async fn round_trip(
        &mut self,
        request: TransferRequest,
        max_len: usize,
    ) -> Result<TransferReply, TransportError> {
        self.metrics.record_token(request.kind());

        let frame = match request.encode() {
            Ok(frame) => frame,
            Err(e) => {
                let err = TransportError::from(e);
                self.metrics
                    .record_outcome(err.outcome(), 0, 0, Duration::ZERO);
                return Err(err);
            }
        };

        self.transport.drain_stale();
        let started = Instant::now();
        let result = if self.transport.peer_change_pending() {
            debug!("Not sending {}: peer signal pending", request.name());
            Err(TransportError::NoPeer)
        } else {
            self.transport.suspend_signals();
            let result = self.exchange(&frame, max_len).await;
            self.transport.resume_signals();
            result
        };

        let elapsed = started.elapsed();
        match &result {
            Ok(reply) => {
                let outcome = match reply {
                    TransferReply::Ok(_) => TransferOutcome::Ok,
                    TransferReply::Nak => TransferOutcome::Nak,
                    TransferReply::Stall => TransferOutcome::Stall,
                };
                self.metrics.record_outcome(
                    outcome,
                    frame.len() as u64,
                    reply.data().len() as u64,
                    elapsed,
                );
                debug!(
                    "{} -> {:?} ({} bytes) in {:?}",
                    request.name(),
                    outcome,
                    reply.data().len(),
                    elapsed
                );
            }
            Err(e) => {
                self.metrics.record_outcome(e.outcome(), 0, 0, elapsed);
                debug!("{} failed after {:?}: {}", request.name(), elapsed, e);
            }
        }

        result
    }

    async fn exchange(
        &mut self,
        frame: &[u8],
        max_len: usize,
    ) -> Result<TransferReply, TransportError> {
        self.transport.send_frame(frame).await?;
        self.transport.recv_reply(max_len).await
    }
}
