// SPDX-License-Identifier: MPL-2.0

use futures::prelude::*;
use futures::ready;
use pi_webrtc_protocol::Envelope;
use pin_project_lite::pin_project;
use std::collections::{HashSet, VecDeque};
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use tracing::{info, instrument};

use crate::server::PeerEvent;

type PeerId = String;

pin_project! {
    /// The relay proper: every envelope received from one peer is
    /// forwarded to every other connected peer.
    ///
    /// The sender and the viewer find each other by being the only two
    /// peers on the relay; there are no rooms and no registration, and
    /// the relay never originates messages of its own.
    #[must_use = "streams do nothing unless polled"]
    pub struct Handler {
        #[pin]
        stream: Pin<Box<dyn Stream<Item=(PeerId, PeerEvent)> + Send>>,
        items: VecDeque<(PeerId, Envelope)>,
        peers: HashSet<PeerId>,
    }
}

impl Handler {
    #[instrument(level = "debug", skip(stream))]
    /// Create a handler
    pub fn new(stream: Pin<Box<dyn Stream<Item = (PeerId, PeerEvent)> + Send>>) -> Self {
        Self {
            stream,
            items: VecDeque::new(),
            peers: Default::default(),
        }
    }

    #[instrument(level = "trace", skip(self))]
    fn handle(&mut self, peer_id: &str, event: PeerEvent) {
        match event {
            PeerEvent::Joined => {
                info!(peer_id = %peer_id, "peer joined");
                self.peers.insert(peer_id.to_string());
            }
            PeerEvent::Left => {
                info!(peer_id = %peer_id, "peer left");
                self.peers.remove(peer_id);
            }
            PeerEvent::Message(envelope) => self.relay(peer_id, envelope),
        }
    }

    /// Forward `envelope` to everyone but its sender.
    fn relay(&mut self, from_id: &str, envelope: Envelope) {
        for peer_id in self.peers.iter() {
            if peer_id != from_id {
                self.items.push_back((peer_id.clone(), envelope.clone()));
            }
        }
    }
}

impl Stream for Handler {
    type Item = (PeerId, Envelope);

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let this = self.as_mut().project();

            if let Some(item) = this.items.pop_front() {
                break Poll::Ready(Some(item));
            }

            match ready!(this.stream.poll_next(cx)) {
                Some((peer_id, event)) => self.as_mut().handle(&peer_id, event),
                None => {
                    break Poll::Ready(None);
                }
            }
        }
    }
}
