//! The receive half: one loop per attached window. Frames are parsed,
//! deduplicated, origin-corrected for opaque schemes, then dispatched by
//! type. A REQUEST is acked before its handler runs, so the ack always
//! precedes the response.

use std::sync::atomic::Ordering;

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::Error;
use crate::win::identity::DomainPattern;
use crate::win::{PostedMessage, WindowHandle};

use super::frame::{self, AckStatus, FrameType, WireFrame};
use super::{Bus, Data, MessageEvent, MethodScope};

pub(crate) fn spawn_receive_loop(bus: Bus, mut rx: UnboundedReceiver<PostedMessage>) {
    tokio::spawn(async move {
        while let Some(posted) = rx.recv().await {
            if !bus.state.enabled.load(Ordering::SeqCst) {
                continue;
            }
            bus.handle_posted(posted);
        }
        debug!(target = "bus", "receive loop ended");
    });
}

impl Bus {
    fn handle_posted(&self, posted: PostedMessage) {
        let Some(wire_frame) = frame::parse(&posted.data) else {
            // Not protocol traffic; ignore silently.
            return;
        };

        // A message id is processed at most once per window.
        {
            let mut received = self.state.received.lock().unwrap();
            if received.contains(&wire_frame.id) {
                debug!(target = "bus", id = %wire_frame.id, "duplicate frame dropped");
                return;
            }
            received.push_back(wire_frame.id.clone());
            while received.len() > self.state.config.dedup_capacity {
                received.pop_front();
            }
        }

        // Opaque event origins (file/mock schemes) carry the sender's origin
        // in the frame instead.
        let origin = if posted.origin == "null"
            && (wire_frame.source_domain.starts_with("mock:")
                || wire_frame.source_domain.starts_with("file:"))
        {
            wire_frame.source_domain.clone()
        } else {
            posted.origin.clone()
        };

        self.mark_window_ready(&posted.source, &origin);

        match wire_frame.frame_type {
            FrameType::Request => self.handle_request(posted.source, origin, wire_frame),
            FrameType::Ack => self.handle_ack(&posted.source, &origin, &wire_frame),
            FrameType::Response => self.handle_response(&posted.source, &origin, wire_frame),
        }
    }

    fn handle_request(&self, source: WindowHandle, origin: String, wire_frame: WireFrame) {
        let peer_domain = DomainPattern::Literal(origin.clone());

        // Ack immediately, before the handler gets a chance to run.
        let ack = WireFrame {
            frame_type: FrameType::Ack,
            id: Uuid::new_v4().to_string(),
            hash: wire_frame.hash.clone(),
            name: wire_frame.name.clone(),
            source_domain: self.domain(),
            window_type: self.win.kind().into(),
            data: None,
            error: None,
            stack: None,
            ack: None,
        };
        if let Err(err) = self.post_frame(&source, &peer_domain, &ack) {
            debug!(target = "bus", error = %err, "could not ack request");
        }

        let listener = {
            let table = self.state.listeners.lock().unwrap();
            table.lookup(&wire_frame.name, &source, &origin)
        };
        if let Some(entry) = &listener {
            if entry.once {
                self.state
                    .listeners
                    .lock()
                    .unwrap()
                    .remove_entry(&wire_frame.name, entry);
            }
        }

        // The handler may itself issue requests through this bus, so it runs
        // in its own task while the loop keeps draining.
        let bus = self.clone();
        tokio::spawn(async move {
            let result = match &listener {
                Some(entry) => {
                    let data = wire_frame
                        .data
                        .as_ref()
                        .map(|value| bus.deserialize_data(&source, &origin, value))
                        .unwrap_or(Data::Null);
                    let outcome = (entry.handler)(MessageEvent {
                        source: source.clone(),
                        origin: origin.clone(),
                        data,
                    })
                    .await;
                    if let (Err(err), Some(error_handler)) = (&outcome, &entry.error_handler) {
                        error_handler(err);
                    }
                    outcome
                }
                None => Err(Error::remote(format!(
                    "no handler found for post message {} from {}",
                    wire_frame.name, origin
                ))),
            };

            let response = match result {
                Ok(data) => {
                    let scope = MethodScope {
                        peer: Some(source.clone()),
                        domain: DomainPattern::Literal(origin.clone()),
                    };
                    let mut ids = Vec::new();
                    WireFrame {
                        frame_type: FrameType::Response,
                        id: Uuid::new_v4().to_string(),
                        hash: wire_frame.hash.clone(),
                        name: wire_frame.name.clone(),
                        source_domain: bus.domain(),
                        window_type: bus.win.kind().into(),
                        data: Some(bus.serialize_data(&scope, &data, &mut ids)),
                        error: None,
                        stack: None,
                        ack: Some(AckStatus::Success),
                    }
                }
                Err(err) => {
                    debug!(
                        target = "bus",
                        msg_name = %wire_frame.name,
                        error = %err,
                        "listener failed; returning error response"
                    );
                    let stack = match &err {
                        Error::Remote { stack, .. } => stack.clone(),
                        _ => None,
                    };
                    WireFrame {
                        frame_type: FrameType::Response,
                        id: Uuid::new_v4().to_string(),
                        hash: wire_frame.hash.clone(),
                        name: wire_frame.name.clone(),
                        source_domain: bus.domain(),
                        window_type: bus.win.kind().into(),
                        data: None,
                        error: Some(err.to_string()),
                        stack,
                        ack: Some(AckStatus::Error),
                    }
                }
            };

            let peer_domain = DomainPattern::Literal(origin.clone());
            if let Err(err) = bus.post_frame(&source, &peer_domain, &response) {
                debug!(target = "bus", error = %err, "could not post response");
            }
        });
    }

    fn handle_ack(&self, source: &WindowHandle, origin: &str, wire_frame: &WireFrame) {
        let mut responses = self.state.responses.lock().unwrap();
        let Some(entry) = responses.get_mut(&wire_frame.hash) else {
            debug!(target = "bus", hash = %wire_frame.hash, "ack for unknown request");
            return;
        };
        if !entry.domain.matches(origin) {
            error!(
                target = "bus",
                msg_name = %entry.name,
                origin,
                expected = ?entry.domain,
                "ack from unexpected origin rejected"
            );
            return;
        }
        if !entry.peer.ptr_eq(source) {
            error!(target = "bus", msg_name = %entry.name, "ack from unexpected window rejected");
            return;
        }
        entry.ack = true;
    }

    fn handle_response(&self, source: &WindowHandle, origin: &str, wire_frame: WireFrame) {
        let entry = {
            let mut responses = self.state.responses.lock().unwrap();
            match responses.get(&wire_frame.hash) {
                None => {
                    debug!(target = "bus", hash = %wire_frame.hash, "response for unknown request");
                    return;
                }
                Some(entry) => {
                    if !entry.domain.matches(origin) {
                        error!(
                            target = "bus",
                            msg_name = %entry.name,
                            origin,
                            expected = ?entry.domain,
                            "response from unexpected origin rejected"
                        );
                        return;
                    }
                    if !entry.peer.ptr_eq(source) {
                        error!(
                            target = "bus",
                            msg_name = %entry.name,
                            "response from unexpected window rejected"
                        );
                        return;
                    }
                }
            }
            responses.remove(&wire_frame.hash)
        };
        let Some(mut entry) = entry else {
            return;
        };

        let settled = match wire_frame.ack {
            Some(AckStatus::Error) => Err(Error::Remote {
                message: wire_frame
                    .error
                    .unwrap_or_else(|| format!("remote listener for {} failed", entry.name)),
                stack: wire_frame.stack,
            }),
            _ => Ok(wire_frame
                .data
                .as_ref()
                .map(|value| self.deserialize_data(source, origin, value))
                .unwrap_or(Data::Null)),
        };

        if let Some(responder) = entry.responder.take() {
            let _ = responder.send(settled);
        }
    }
}
