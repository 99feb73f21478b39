// SPDX-License-Identifier: MPL-2.0

use anyhow::{anyhow, bail, Context, Error};
use futures::prelude::*;
use gst::prelude::*;
use pi_webrtc_protocol::{Envelope, IceCandidate};
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

use crate::pipeline::{SenderPipeline, VideoFormat};
use crate::signaller::Signaller;

/// Which side of the SDP exchange this sender takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    /// Create an offer as soon as the signalling connection is up
    Offer,
    /// Wait for the viewer's offer and answer it
    Answer,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub uri: String,
    pub cafile: Option<PathBuf>,
    pub device: String,
    pub stun_server: String,
    pub format: VideoFormat,
    pub role: NegotiationRole,
}

/// Ties the sender pipeline to the signalling connection: framework
/// callbacks become envelope sends, incoming envelopes become webrtcbin
/// signal emissions.
pub struct App {
    config: Config,
    pipeline: Option<SenderPipeline>,
    signaller: Option<Signaller>,
}

impl App {
    pub fn new(config: Config) -> Self {
        App {
            config,
            pipeline: None,
            signaller: None,
        }
    }

    #[inline(always)]
    fn pipeline(&self) -> &SenderPipeline {
        self.pipeline.as_ref().expect("Set in prepare")
    }

    #[inline(always)]
    fn signaller(&self) -> &Signaller {
        self.signaller.as_ref().expect("Set in prepare")
    }

    pub async fn prepare_and_run(&mut self) -> Result<(), Error> {
        self.prepare().await.context("Preparing")?;
        self.run().await.context("Running")?;

        Ok(())
    }

    async fn prepare(&mut self) -> Result<(), Error> {
        debug!("Preparing");

        let uri = url::Url::parse(&self.config.uri).context("Parsing the signalling URI")?;
        if !matches!(uri.scheme(), "ws" | "wss") {
            bail!("Unsupported signalling URI scheme {}", uri.scheme());
        }

        let pipeline = SenderPipeline::new(
            &self.config.device,
            &self.config.stun_server,
            self.config.format,
        )?;

        let signaller = Signaller::connect(uri.as_str(), self.config.cafile.as_deref()).await?;

        // Locally gathered candidates go straight out on the socket
        let outgoing = signaller.sender();
        pipeline
            .webrtcbin()
            .connect("on-ice-candidate", false, move |values| {
                let mline_index = values[1].get::<u32>().expect("mline index");
                let candidate = values[2].get::<String>().expect("candidate string");

                let msg = match Envelope::from_candidate(&IceCandidate {
                    candidate,
                    sdp_m_line_index: mline_index,
                }) {
                    Ok(msg) => msg,
                    Err(err) => {
                        warn!("Failed to serialize ICE candidate: {err}");
                        return None;
                    }
                };

                if let Err(err) = outgoing.clone().try_send(msg) {
                    warn!("Dropping ICE candidate: {err}");
                }

                None
            });

        self.pipeline = Some(pipeline);
        self.signaller = Some(signaller);

        Ok(())
    }

    async fn run(&mut self) -> Result<(), Error> {
        debug!("Running");

        let mut incoming = self
            .signaller
            .as_mut()
            .and_then(|signaller| signaller.take_incoming())
            .context("Signaller not connected")?;

        let bus = self
            .pipeline()
            .pipeline()
            .bus()
            .context("Getting the pipeline bus")?;
        let mut bus_stream = bus.stream().fuse();

        self.pipeline().play().await?;

        if self.config.role == NegotiationRole::Offer {
            self.trigger_offer();
        }

        loop {
            futures::select! {
                bus_msg = bus_stream.next() => {
                    let Some(bus_msg) = bus_msg else { break };

                    use gst::MessageView::*;
                    match bus_msg.view() {
                        Error(msg) => {
                            let err = msg.error();
                            let src_name = msg.src().map(|src| src.name());

                            bail!(
                                "Element {} error message: {err:#}",
                                src_name.as_deref().unwrap_or("UNKNOWN"),
                            );
                        }
                        Eos(_) => {
                            info!("End of stream");
                            break;
                        }
                        Latency(msg) => {
                            info!(
                                "Latency requirements have changed for element {}",
                                msg.src()
                                    .map(|src| src.name())
                                    .as_deref()
                                    .unwrap_or("UNKNOWN"),
                            );
                            if let Err(err) = self.pipeline().pipeline().recalculate_latency() {
                                error!(%err, "Error recalculating latency");
                            }
                        }
                        _ => (),
                    }
                }
                envelope = incoming.next() => {
                    let Some(envelope) = envelope else {
                        info!("Signalling connection closed");
                        break;
                    };
                    self.handle_envelope(envelope);
                }
            }
        }

        Ok(())
    }

    fn handle_envelope(&self, envelope: Envelope) {
        match envelope {
            Envelope::Offer(sdp) => match self.config.role {
                NegotiationRole::Answer => {
                    if let Err(err) = self.handle_offer(&sdp) {
                        warn!("Failed to handle the remote offer: {err:#}");
                    }
                }
                NegotiationRole::Offer => warn!("Ignoring offer from peer"),
            },
            Envelope::Answer(sdp) => match self.config.role {
                NegotiationRole::Offer => {
                    if let Err(err) = self.handle_answer(&sdp) {
                        warn!("Failed to handle the remote answer: {err:#}");
                    }
                }
                NegotiationRole::Answer => warn!("Ignoring answer from peer"),
            },
            ice @ Envelope::Ice(_) => match ice.candidate() {
                Some(Ok(candidate)) => self.handle_ice(&candidate),
                Some(Err(err)) => warn!("Ignoring malformed ICE payload: {err} ({ice:?})"),
                None => (),
            },
        }
    }

    /// Offerer path: create the offer, apply it locally and send it.
    fn trigger_offer(&self) {
        debug!("Creating offer");

        let webrtcbin = self.pipeline().webrtcbin().clone();
        let mut outgoing = self.signaller().sender();
        let promise = gst::Promise::with_change_func(move |reply| {
            let reply = match reply {
                Ok(Some(reply)) => reply,
                Ok(None) => {
                    warn!("Offer creation promise returned without a reply");
                    return;
                }
                Err(err) => {
                    warn!("Offer creation promise returned with an error: {err:?}");
                    return;
                }
            };

            let offer = match reply
                .value("offer")
                .map(|offer| offer.get::<gst_webrtc::WebRTCSessionDescription>().unwrap())
            {
                Ok(offer) => offer,
                Err(err) => {
                    warn!("Reply without an offer: {err:?}");
                    return;
                }
            };

            webrtcbin.emit_by_name::<()>("set-local-description", &[&offer, &None::<gst::Promise>]);

            match offer.sdp().as_text() {
                Ok(sdp) => {
                    if let Err(err) = outgoing.try_send(Envelope::Offer(sdp)) {
                        warn!("Dropping offer: {err}");
                    }
                }
                Err(err) => warn!("Offer SDP is not valid text: {err}"),
            }
        });

        self.pipeline()
            .webrtcbin()
            .emit_by_name::<()>("create-offer", &[&None::<gst::Structure>, &promise]);
    }

    /// Answerer path: apply the remote offer, then create and send the
    /// answer once the remote description is in place.
    fn handle_offer(&self, sdp: &str) -> Result<(), Error> {
        let sdp = gst_sdp::SDPMessage::parse_buffer(sdp.as_bytes())
            .map_err(|_| anyhow!("Parsing the remote offer"))?;
        let offer =
            gst_webrtc::WebRTCSessionDescription::new(gst_webrtc::WebRTCSDPType::Offer, sdp);

        let webrtcbin = self.pipeline().webrtcbin().clone();
        let mut outgoing = self.signaller().sender();
        let promise = gst::Promise::with_change_func(move |reply| {
            if let Err(err) = reply {
                warn!("Applying the remote offer failed: {err:?}");
                return;
            }

            debug!("Remote offer applied, creating answer");

            let webrtcbin_clone = webrtcbin.clone();
            let answer_promise = gst::Promise::with_change_func(move |reply| {
                let reply = match reply {
                    Ok(Some(reply)) => reply,
                    Ok(None) => {
                        warn!("Answer creation promise returned without a reply");
                        return;
                    }
                    Err(err) => {
                        warn!("Answer creation promise returned with an error: {err:?}");
                        return;
                    }
                };

                let answer = match reply.value("answer").map(|answer| {
                    answer.get::<gst_webrtc::WebRTCSessionDescription>().unwrap()
                }) {
                    Ok(answer) => answer,
                    Err(err) => {
                        warn!("Reply without an answer: {err:?}");
                        return;
                    }
                };

                webrtcbin_clone
                    .emit_by_name::<()>("set-local-description", &[&answer, &None::<gst::Promise>]);

                match answer.sdp().as_text() {
                    Ok(sdp) => {
                        if let Err(err) = outgoing.try_send(Envelope::Answer(sdp)) {
                            warn!("Dropping answer: {err}");
                        }
                    }
                    Err(err) => warn!("Answer SDP is not valid text: {err}"),
                }
            });

            webrtcbin
                .emit_by_name::<()>("create-answer", &[&None::<gst::Structure>, &answer_promise]);
        });

        self.pipeline()
            .webrtcbin()
            .emit_by_name::<()>("set-remote-description", &[&offer, &promise]);

        Ok(())
    }

    /// Offerer path: the viewer answered, apply its description.
    fn handle_answer(&self, sdp: &str) -> Result<(), Error> {
        let sdp = gst_sdp::SDPMessage::parse_buffer(sdp.as_bytes())
            .map_err(|_| anyhow!("Parsing the remote answer"))?;
        let answer =
            gst_webrtc::WebRTCSessionDescription::new(gst_webrtc::WebRTCSDPType::Answer, sdp);

        self.pipeline()
            .webrtcbin()
            .emit_by_name::<()>("set-remote-description", &[&answer, &None::<gst::Promise>]);

        Ok(())
    }

    fn handle_ice(&self, candidate: &IceCandidate) {
        self.pipeline().webrtcbin().emit_by_name::<()>(
            "add-ice-candidate",
            &[&candidate.sdp_m_line_index, &candidate.candidate.as_str()],
        );
    }

    /// Tears this `App` down and deallocates all its resources by consuming `self`.
    pub async fn teardown(mut self) {
        debug!("Tearing down");

        if let Some(pipeline) = self.pipeline.take() {
            pipeline.stop().await;
        }

        if let Some(signaller) = self.signaller.take() {
            signaller.close().await;
        }
    }
}
