// SPDX-License-Identifier: MPL-2.0

use anyhow::{anyhow, Context, Error};
use gst::prelude::*;

pub const DEFAULT_DEVICE: &str = "/dev/video2";
pub const DEFAULT_STUN_SERVER: &str = "stun://stun.l.google.com:19302";

const WEBRTCBIN_NAME: &str = "sendonly";

/// Capture format requested from the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFormat {
    pub width: i32,
    pub height: i32,
    pub framerate: i32,
    /// Target encoder bitrate in bits per second, when the operator
    /// asked for one. Applied through the camera's V4L2 controls, the
    /// H.264 encoding happens on the camera itself.
    pub bitrate: Option<u32>,
}

impl Default for VideoFormat {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            framerate: 30,
            bitrate: None,
        }
    }
}

/// gst-launch description of the fixed sender topology.
///
/// The camera delivers H.264 directly (no software encoding on the Pi),
/// `mtu=1200` keeps RTP packets below the DTLS path MTU.
fn launch_description(device: &str, stun_server: &str, format: VideoFormat) -> String {
    let VideoFormat {
        width,
        height,
        framerate,
        bitrate,
    } = format;

    let extra_controls = bitrate
        .map(|bitrate| format!(" extra-controls=\"controls,video_bitrate={bitrate}\""))
        .unwrap_or_default();

    format!(
        "v4l2src device={device} io-mode=dmabuf{extra_controls} ! \
         video/x-h264,profile=baseline,stream-format=byte-stream,alignment=au,\
         framerate={framerate}/1,width={width},height={height} ! \
         h264parse config-interval=1 ! \
         rtph264pay pt=96 config-interval=-1 aggregate-mode=zero-latency mtu=1200 ! \
         application/x-rtp,media=video,encoding-name=H264,payload=96 ! \
         webrtcbin name={WEBRTCBIN_NAME} bundle-policy=max-bundle \
         stun-server={stun_server} latency=0"
    )
}

/// The capture → payload → webrtcbin graph and its running state.
#[derive(Debug)]
pub struct SenderPipeline {
    pipeline: gst::Pipeline,
    webrtcbin: gst::Element,
}

impl SenderPipeline {
    pub fn new(device: &str, stun_server: &str, format: VideoFormat) -> Result<Self, Error> {
        let description = launch_description(device, stun_server, format);
        tracing::debug!("Pipeline: {description}");

        let pipeline = gst::parse::launch(&description)
            .context("Parsing the sender pipeline")?
            .downcast::<gst::Pipeline>()
            .map_err(|_| anyhow!("Top-level element is not a pipeline"))?;

        let webrtcbin = pipeline
            .by_name(WEBRTCBIN_NAME)
            .context("Getting the webrtcbin element")?;

        Ok(Self {
            pipeline,
            webrtcbin,
        })
    }

    pub fn pipeline(&self) -> &gst::Pipeline {
        &self.pipeline
    }

    pub fn webrtcbin(&self) -> &gst::Element {
        &self.webrtcbin
    }

    pub async fn play(&self) -> Result<(), Error> {
        self.pipeline
            .call_async_future(|pipeline| pipeline.set_state(gst::State::Playing))
            .await
            .context("Setting pipeline to Playing")?;

        Ok(())
    }

    pub async fn stop(&self) {
        let _ = self
            .pipeline
            .call_async_future(|pipeline| pipeline.set_state(gst::State::Null))
            .await;
    }
}
