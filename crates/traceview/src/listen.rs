//! Local collector simulator.
//!
//! Receives reporter datagrams on a UDP socket and prints each decoded
//! message as one JSON line on stdout.

use std::io::Write;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};
use traceview_core::ReceivedMessage;
use traceview_core::message::MAX_MESSAGE_SIZE;

/// One received event, as printed.
#[derive(Debug, Serialize)]
struct Line<'a> {
    from: SocketAddr,
    task_id: String,
    op_id: String,
    sampled: bool,
    edges: Vec<String>,
    timestamp_u: Option<i64>,
    info: &'a Map<String, Value>,
}

/// Collector simulator state.
pub struct Listener {
    socket: UdpSocket,
    received: u64,
    rejected: u64,
}

impl Listener {
    /// Bind the collector socket.
    pub async fn bind(host: &str, port: u16) -> Result<Self> {
        let socket = UdpSocket::bind((host, port))
            .await
            .with_context(|| format!("Failed to bind collector on {host}:{port}"))?;
        info!("Collector listening on {}", socket.local_addr()?);
        Ok(Self {
            socket,
            received: 0,
            rejected: 0,
        })
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive messages until `limit` valid ones have arrived (forever if None).
    pub async fn run(&mut self, limit: Option<u64>, out: &mut impl Write) -> Result<()> {
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];

        while limit.is_none_or(|limit| self.received < limit) {
            let (n, from) = self.socket.recv_from(&mut buf).await?;
            match ReceivedMessage::parse(&buf[..n]) {
                Ok(msg) => {
                    self.received += 1;
                    debug!(%from, bytes = n, op_id = %msg.id.op_id(), "Received event");
                    let line = Line {
                        from,
                        task_id: msg.id.task_id().to_string(),
                        op_id: msg.id.op_id().to_string(),
                        sampled: msg.id.is_sampled(),
                        edges: msg.edges.iter().map(ToString::to_string).collect(),
                        timestamp_u: msg.timestamp_u,
                        info: &msg.info,
                    };
                    writeln!(out, "{}", serde_json::to_string(&line)?)?;
                    out.flush()?;
                }
                Err(e) => {
                    self.rejected += 1;
                    warn!(%from, bytes = n, error = %e, "Rejected datagram");
                }
            }
        }

        info!(
            received = self.received,
            rejected = self.rejected,
            "Collector stopped"
        );
        Ok(())
    }
}
