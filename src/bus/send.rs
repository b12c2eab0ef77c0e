//! The send half of the protocol: build a REQUEST frame, try the enabled
//! transport strategies in order, then watch the response entry against the
//! ack and response deadlines while polling for a closed peer.

use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::config::SendStrategy;
use crate::error::Error;
use crate::win::identity::{is_window_closed, DomainPattern};
use crate::win::WindowHandle;

use super::data::Data;
use super::frame::{self, FrameType, WireFrame};
use super::{Bus, MethodScope, ResponseEntry};

/// Deadline for the full request/response transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timeout {
    /// Use the configured response timeout.
    #[default]
    Default,
    /// Wait forever; used for method-handle calls and the ready handshake.
    Never,
    After(Duration),
}

#[derive(Clone, Default)]
pub struct SendOptions {
    pub domain: Option<DomainPattern>,
    pub timeout: Timeout,
    /// Do not register a response entry; the request settles as soon as it
    /// is posted.
    pub fire_and_forget: bool,
}

impl Bus {
    /// Send a request to `peer` and wait for the correlated response.
    pub async fn send(
        &self,
        peer: &WindowHandle,
        name: &str,
        data: Data,
        options: SendOptions,
    ) -> Result<Data, Error> {
        if peer.ptr_eq(&self.win) {
            return Err(Error::Integration(format!(
                "can not send {name} to the window's own bus"
            )));
        }
        if is_window_closed(peer) {
            return Err(Error::WindowClosed(format!(
                "can not send {name}: window is closed"
            )));
        }

        let domain = options.domain.unwrap_or(DomainPattern::Wildcard);
        let hash = format!("{}_{}", name, Uuid::new_v4());
        let scope = MethodScope {
            peer: Some(peer.clone()),
            domain: domain.clone(),
        };
        let mut method_ids = Vec::new();
        let payload = self.serialize_data(&scope, &data, &mut method_ids);

        let request = WireFrame {
            frame_type: FrameType::Request,
            id: Uuid::new_v4().to_string(),
            hash: hash.clone(),
            name: name.to_string(),
            source_domain: self.domain(),
            window_type: self.win.kind().into(),
            data: Some(payload),
            error: None,
            stack: None,
            ack: None,
        };

        let rx = if options.fire_and_forget {
            None
        } else {
            let (tx, rx) = oneshot::channel();
            self.state.responses.lock().unwrap().insert(
                hash.clone(),
                ResponseEntry {
                    peer: peer.clone(),
                    domain: domain.clone(),
                    name: name.to_string(),
                    ack: false,
                    responder: Some(tx),
                },
            );
            Some(rx)
        };

        if let Err(err) = self.post_frame(peer, &domain, &request) {
            self.state.responses.lock().unwrap().remove(&hash);
            return Err(err);
        }
        debug!(target = "bus", msg_name = name, hash = %hash, "request posted");

        let Some(mut rx) = rx else {
            return Ok(Data::Null);
        };

        let ack_deadline = self.state.config.ack_timeout;
        let poll = self.state.config.poll_interval;
        let overall = match options.timeout {
            Timeout::Default => Some(self.state.config.response_timeout),
            Timeout::Never => None,
            Timeout::After(duration) => Some(duration),
        };
        let started = Instant::now();

        loop {
            tokio::select! {
                result = &mut rx => {
                    return match result {
                        Ok(settled) => settled,
                        Err(_) => Err(Error::WindowClosed(format!(
                            "request {name} dropped before a response arrived"
                        ))),
                    };
                }
                _ = tokio::time::sleep(poll) => {
                    let acked = {
                        let responses = self.state.responses.lock().unwrap();
                        match responses.get(&hash) {
                            Some(entry) => entry.ack,
                            // Entry already settled; the channel fires next.
                            None => continue,
                        }
                    };
                    if is_window_closed(peer) {
                        self.state.responses.lock().unwrap().remove(&hash);
                        return Err(Error::WindowClosed(if acked {
                            format!("window closed for {name} before response")
                        } else {
                            format!("window closed for {name} before ack")
                        }));
                    }
                    if !acked && started.elapsed() >= ack_deadline {
                        self.state.responses.lock().unwrap().remove(&hash);
                        return Err(Error::MessageTimeout(format!(
                            "no ack for {name} in {}ms",
                            ack_deadline.as_millis()
                        )));
                    }
                    if let Some(total) = overall {
                        if started.elapsed() >= total {
                            self.state.responses.lock().unwrap().remove(&hash);
                            return Err(Error::MessageTimeout(format!(
                                "no response for {name} in {}ms",
                                total.as_millis()
                            )));
                        }
                    }
                }
            }
        }
    }

    /// Post a frame to `peer`, trying each enabled strategy in order. A
    /// registered bridge for the target domain is tried as a last resort
    /// even when the strategy list does not name it. The send succeeds if
    /// any transport delivers; otherwise the aggregated per-strategy
    /// diagnostics come back in the error.
    pub(crate) fn post_frame(
        &self,
        peer: &WindowHandle,
        domain: &DomainPattern,
        wire_frame: &WireFrame,
    ) -> Result<(), Error> {
        let raw = frame::emit(wire_frame);
        let target_origin = domain.as_target_origin();
        let strategies = self.state.config.strategies.clone();
        let mut outcomes: Vec<String> = Vec::new();

        for strategy in &strategies {
            match strategy {
                SendStrategy::PostMessage => {
                    match peer.post_message(raw.clone(), &target_origin, &self.win) {
                        Ok(()) => return Ok(()),
                        Err(reason) => outcomes.push(format!("postmessage: {reason}")),
                    }
                }
                SendStrategy::Bridge => match self.post_via_bridge(peer, &target_origin, &raw) {
                    Ok(()) => return Ok(()),
                    Err(reason) => outcomes.push(format!("bridge: {reason}")),
                },
                SendStrategy::Global => {
                    let opaque = peer
                        .location()
                        .map(|url| !matches!(url.scheme(), "http" | "https"))
                        .unwrap_or(false);
                    if opaque {
                        match peer.post_message(raw.clone(), "*", &self.win) {
                            Ok(()) => return Ok(()),
                            Err(reason) => outcomes.push(format!("global: {reason}")),
                        }
                    } else {
                        outcomes.push("global: transport only applies to opaque origins".into());
                    }
                }
            }
        }

        // A registered relay implies the component configured one for this
        // domain; use it even when the strategy list predates registration.
        if !strategies.contains(&SendStrategy::Bridge) {
            match self.post_via_bridge(peer, &target_origin, &raw) {
                Ok(()) => return Ok(()),
                Err(reason) => outcomes.push(format!("bridge: {reason}")),
            }
        }

        Err(Error::Fatal(format!(
            "no send strategy succeeded for {}: {}",
            wire_frame.name,
            outcomes.join("; ")
        )))
    }

    /// Deliver through the bridge frame registered for `target_origin`. The
    /// relay's net effect is that the frame reaches the peer regardless of
    /// the transport origin gate.
    fn post_via_bridge(
        &self,
        peer: &WindowHandle,
        target_origin: &str,
        raw: &str,
    ) -> Result<(), String> {
        let bridge = {
            let bridges = self.state.bridges.lock().unwrap();
            bridges
                .iter()
                .find(|(bridge_domain, _)| *bridge_domain == target_origin)
                .map(|(_, win)| win.clone())
        };
        match bridge {
            Some(bridge) if !is_window_closed(&bridge) => {
                peer.post_message(raw.to_string(), "*", &self.win)
            }
            Some(_) => Err("bridge window closed".to_string()),
            None => Err(format!("no bridge registered for {target_origin}")),
        }
    }
}
