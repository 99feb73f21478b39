// SPDX-License-Identifier: MPL-2.0

use anyhow::{Context, Error};
use async_tungstenite::tungstenite::Message as WsMessage;
use futures::channel::mpsc;
use futures::prelude::*;
use pi_webrtc_protocol::Envelope;
use std::path::Path;
use tokio::task;
use tokio_native_tls::native_tls;
use tracing::{info, trace, warn};

/// One outbound WebSocket connection to the signalling server.
///
/// Outgoing envelopes go through a bounded channel drained by a send
/// task; incoming text frames are parsed into envelopes and surface on
/// the channel returned by [`take_incoming`](Signaller::take_incoming).
/// The incoming channel ends when the server closes the connection.
pub struct Signaller {
    sender: mpsc::Sender<Envelope>,
    incoming: Option<mpsc::Receiver<Envelope>>,
    send_task_handle: task::JoinHandle<Result<(), Error>>,
    receive_task_handle: task::JoinHandle<()>,
}

impl Signaller {
    pub async fn connect(uri: &str, cafile: Option<&Path>) -> Result<Self, Error> {
        let connector = if let Some(path) = cafile {
            let pem = tokio::fs::read(path)
                .await
                .with_context(|| format!("Reading CA file {}", path.display()))?;
            let cert = native_tls::Certificate::from_pem(&pem).context("Parsing CA file")?;
            let connector = native_tls::TlsConnector::builder()
                .add_root_certificate(cert)
                .build()
                .context("Building TLS connector")?;
            Some(tokio_native_tls::TlsConnector::from(connector))
        } else {
            None
        };

        let (ws, _) = async_tungstenite::tokio::connect_async_with_tls_connector(uri, connector)
            .await
            .with_context(|| format!("Connecting to the signalling server at {uri}"))?;

        info!("connected to {uri}");

        // Channel for asynchronously sending out websocket messages
        let (mut ws_sink, mut ws_stream) = ws.split();

        // 1000 is completely arbitrary, we simply don't want infinite piling
        // up of messages as with unbounded
        let (sender, mut outgoing) = mpsc::channel::<Envelope>(1000);
        let (mut incoming_sender, incoming) = mpsc::channel::<Envelope>(1000);

        let send_task_handle = task::spawn(async move {
            while let Some(msg) = outgoing.next().await {
                trace!("Sending websocket message {:?}", msg);
                ws_sink
                    .send(WsMessage::text(serde_json::to_string(&msg)?))
                    .await?;
            }

            info!("Done sending");

            ws_sink.close(None).await?;

            Ok::<(), Error>(())
        });

        let receive_task_handle = task::spawn(async move {
            while let Some(msg) = ws_stream.next().await {
                match msg {
                    Ok(WsMessage::Text(msg)) => {
                        trace!("Received message {}", msg);

                        match serde_json::from_str::<Envelope>(&msg) {
                            Ok(envelope) => {
                                if incoming_sender.send(envelope).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                warn!("Unknown message from server: {} ({})", err, msg);
                            }
                        }
                    }
                    Ok(WsMessage::Close(reason)) => {
                        info!("websocket connection closed: {:?}", reason);
                        break;
                    }
                    Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => (),
                    Ok(msg) => warn!("Unsupported message type {:?}", msg),
                    Err(err) => {
                        warn!("Error receiving: {}", err);
                        break;
                    }
                }
            }

            incoming_sender.close_channel();
            info!("Stopped websocket receiving");
        });

        Ok(Self {
            sender,
            incoming: Some(incoming),
            send_task_handle,
            receive_task_handle,
        })
    }

    /// A handle for sending envelopes; cloned into pipeline callbacks.
    pub fn sender(&self) -> mpsc::Sender<Envelope> {
        self.sender.clone()
    }

    /// The incoming envelope stream. Yields `None` once taken.
    pub fn take_incoming(&mut self) -> Option<mpsc::Receiver<Envelope>> {
        self.incoming.take()
    }

    /// Flush pending sends, close the connection and join both tasks.
    pub async fn close(mut self) {
        self.sender.close_channel();

        match self.send_task_handle.await {
            Ok(Err(err)) => warn!("Error in send task: {}", err),
            Err(err) => warn!("Error while joining send task: {}", err),
            Ok(Ok(())) => (),
        }

        if let Err(err) = self.receive_task_handle.await {
            warn!("Error while joining receive task: {}", err);
        }
    }
}
