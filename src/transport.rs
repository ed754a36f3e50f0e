//! Signaling transport collaborator.
//!
//! The transport is a dumb pipe keyed by recipient user id; reliability is
//! its concern, not the state machine's.

use async_trait::async_trait;
use log::trace;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};

use crate::calls::RawSignal;

/// Sends signaling messages to the user named in their `to` field.
#[async_trait]
pub trait SignalTransport: Send + Sync {
    async fn send(&self, signal: &RawSignal) -> Result<(), anyhow::Error>;
}

type EndpointMap = HashMap<String, Vec<mpsc::UnboundedSender<String>>>;

/// Routes signals between in-process endpoints. A user may connect several
/// endpoints (devices); each receives every message addressed to that user.
#[derive(Clone, Default)]
pub struct MemoryHub {
    endpoints: Arc<RwLock<EndpointMap>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a device of `user_id` and returns its sending half and the
    /// stream of signals addressed to it.
    pub async fn connect(
        &self,
        user_id: &str,
    ) -> (MemoryTransport, mpsc::UnboundedReceiver<RawSignal>) {
        let (wire_tx, mut wire_rx) = mpsc::unbounded_channel::<String>();
        self.endpoints
            .write()
            .await
            .entry(user_id.to_string())
            .or_default()
            .push(wire_tx);

        // Decode on the receiving side so both ends exercise the JSON format.
        let (tx, rx) = mpsc::unbounded_channel();
        let owner = user_id.to_string();
        tokio::spawn(async move {
            while let Some(frame) = wire_rx.recv().await {
                match RawSignal::from_json(&frame) {
                    Ok(signal) => {
                        if tx.send(signal).is_err() {
                            return;
                        }
                    }
                    Err(e) => log::warn!(
                        target: "Transport/Memory",
                        "Undecodable frame for {owner}: {e}"
                    ),
                }
            }
        });

        (
            MemoryTransport {
                hub: self.clone(),
            },
            rx,
        )
    }
}

/// Sending half of a [`MemoryHub`] endpoint.
#[derive(Clone)]
pub struct MemoryTransport {
    hub: MemoryHub,
}

#[async_trait]
impl SignalTransport for MemoryTransport {
    async fn send(&self, signal: &RawSignal) -> Result<(), anyhow::Error> {
        let to = signal
            .payload
            .to
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("signal {} has no recipient", signal.flag))?;
        let frame = signal.to_json()?;

        let mut endpoints = self.hub.endpoints.write().await;
        let devices = endpoints
            .get_mut(to)
            .ok_or_else(|| anyhow::anyhow!("{to} is not connected"))?;
        devices.retain(|device| device.send(frame.clone()).is_ok());
        if devices.is_empty() {
            endpoints.remove(to);
            anyhow::bail!("{to} is not connected");
        }
        trace!(target: "Transport/Memory", "{} -> {to}", signal.flag);
        Ok(())
    }
}
