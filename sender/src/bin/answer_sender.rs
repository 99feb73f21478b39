// SPDX-License-Identifier: MPL-2.0

//! The answerer variant: the viewer initiates the session with an SDP
//! offer, this sender answers it. Capture format and target bitrate are
//! configurable.

use anyhow::Context;
use clap::Parser;
use futures::prelude::*;
use pi_webrtc_sender::app::{App, Config, NegotiationRole};
use pi_webrtc_sender::pipeline::{VideoFormat, DEFAULT_DEVICE, DEFAULT_STUN_SERVER};
use std::path::PathBuf;
use tracing::{debug, error, info};

#[derive(Parser, Debug)]
#[clap(about, version, author)]
/// Program arguments
struct Args {
    /// Signalling server URL
    url: String,

    /// Video width
    #[clap(short, long, default_value_t = 1920)]
    width: i32,

    /// Video height
    #[clap(long, default_value_t = 1080)]
    height: i32,

    /// Video framerate
    #[clap(short, long, default_value_t = 30)]
    fps: i32,

    /// Video bitrate (bps)
    #[clap(short, long, default_value_t = 2_000_000)]
    bitrate: u32,

    /// Camera device to capture from
    #[clap(long, default_value = DEFAULT_DEVICE)]
    device: String,

    /// STUN server handed to webrtcbin
    #[clap(long, default_value = DEFAULT_STUN_SERVER)]
    stun_server: String,

    /// Certificate file to add to the set of roots the TLS connector will trust
    #[clap(long)]
    cafile: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    pi_webrtc_sender::initialize_logging("PI_WEBRTC_SENDER_LOG")?;

    gst::init().context("Initializing GStreamer")?;

    info!(
        "Format: {}x{} @ {}fps, {} bps",
        args.width, args.height, args.fps, args.bitrate
    );

    let mut res = Ok(());
    let mut app = App::new(Config {
        uri: args.url,
        cafile: args.cafile,
        device: args.device,
        stun_server: args.stun_server,
        format: VideoFormat {
            width: args.width,
            height: args.height,
            framerate: args.fps,
            bitrate: Some(args.bitrate),
        },
        role: NegotiationRole::Answer,
    });

    {
        let ctrl_c = tokio::signal::ctrl_c().fuse();
        tokio::pin!(ctrl_c);

        let prepare_and_run = app.prepare_and_run().fuse();
        tokio::pin!(prepare_and_run);

        futures::select! {
            _ctrl_c_res = ctrl_c => {
                info!("Shutting down due to user request");
            }
            app_res = prepare_and_run => {
                if let Err(ref err) = app_res {
                    error!("Shutting down due to application error: {err:#}");
                } else {
                    info!("Shutting down due to application termination");
                }

                res = app_res;
            }
        }
    }

    app.teardown().await;

    debug!("Quitting");

    res
}
