// Copyright 2024 The sshlogd Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The IPC router (C6): accepts connections on the control socket, decodes
//! envelopes, dispatches to the handlers in [`super::handlers`] (or, for
//! Watch, to the lease-gated loop below), and routes every response back to
//! the client that asked for it.
//!
//! Internals follow the specification's leaves-first breakdown: a front pipe
//! (the accept loop), a back pipe (per-request worker threads), a response
//! queue (`responses_tx`/`responses_rx`, multi-producer single-consumer),
//! and a control pipe (`control_thread` below, which connects to our own
//! socket once `shutdown` flips so the blocking accept loop is never stuck).

use std::collections::{HashMap, HashSet};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::Context;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use sshlogd_protocol::{
    decode_request, encode_response, EventWatchRequestDto, EventWatchResponseDto, RequestPayload,
    ResponsePayload, WireEnvelope,
};
use tracing::{error, info, warn};

use crate::active_streams::ActiveStreams;
use crate::consts::{SOCK_POLL_TIMEOUT, WATCH_POLL_INTERVAL};
use crate::event_bus::{EventBus, EventSubscriber, FnSubscriber};
use crate::ipc::handlers;
use crate::tracker::Tracker;

type Outbound = (String, WireEnvelope);

pub struct Router {
    bus: Arc<EventBus>,
    tracker: Arc<Tracker>,
    active_streams: Arc<ActiveStreams>,
    session_injection_enabled: bool,
    shutdown: Arc<AtomicBool>,
    responses_tx: Sender<Outbound>,
    responses_rx: Receiver<Outbound>,
    writers: Mutex<HashMap<String, Arc<Mutex<UnixStream>>>>,
    watch_handlers: Mutex<HashSet<String>>,
}

impl Router {
    pub fn new(
        bus: Arc<EventBus>,
        tracker: Arc<Tracker>,
        active_streams: Arc<ActiveStreams>,
        session_injection_enabled: bool,
        shutdown: Arc<AtomicBool>,
    ) -> Arc<Router> {
        let (responses_tx, responses_rx) = bounded(1024);
        Arc::new(Router {
            bus,
            tracker,
            active_streams,
            session_injection_enabled,
            shutdown,
            responses_tx,
            responses_rx,
            writers: Mutex::new(HashMap::new()),
            watch_handlers: Mutex::new(HashSet::new()),
        })
    }

    /// Accepts connections until `shutdown` flips, then waits for in-flight
    /// work to drain. Blocks the calling thread for the router's whole
    /// lifetime.
    pub fn serve(self: Arc<Self>, listener: UnixListener, socket_path: PathBuf) -> anyhow::Result<()> {
        let response_router = self.clone();
        let response_thread = thread::spawn(move || response_router.drain_responses());

        let control_shutdown = self.shutdown.clone();
        let control_path = socket_path.clone();
        let control_thread = thread::spawn(move || {
            while !control_shutdown.load(Ordering::SeqCst) {
                thread::sleep(SOCK_POLL_TIMEOUT);
            }
            // unblocks the accept loop below, which would otherwise sit
            // inside listener.incoming() forever waiting for a real client.
            let _ = UnixStream::connect(&control_path);
        });

        info!("ipc router listening on {:?}", socket_path);
        for stream in listener.incoming() {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            match stream {
                Ok(stream) => {
                    let router = self.clone();
                    thread::spawn(move || {
                        if let Err(err) = router.handle_conn(stream) {
                            warn!("handling ipc connection: {:?}", err);
                        }
                    });
                }
                Err(err) => error!("accepting ipc connection: {:?}", err),
            }
        }

        // every blocking per-connection read is unstuck by shutting the
        // underlying stream down; connections that never sent a frame are
        // not in `writers` and are left for process exit to reclaim.
        for writer in self.writers.lock().unwrap().values() {
            let _ = writer.lock().unwrap().shutdown(std::net::Shutdown::Both);
        }

        let _ = control_thread.join();
        let _ = response_thread.join();
        info!("ipc router stopped");
        Ok(())
    }

    fn handle_conn(self: Arc<Self>, stream: UnixStream) -> anyhow::Result<()> {
        let writer = Arc::new(Mutex::new(stream.try_clone().context("cloning connection for writes")?));
        let mut reader = sshlogd_protocol::EnvelopeReader::new(stream);
        let mut registered: Option<String> = None;

        loop {
            let envelope = match reader.read_one()? {
                Some(envelope) => envelope,
                None => break,
            };

            if registered.as_deref() != Some(envelope.client_id.as_str()) {
                self.writers.lock().unwrap().insert(envelope.client_id.clone(), writer.clone());
                registered = Some(envelope.client_id.clone());
            }

            self.dispatch(envelope);
        }

        if let Some(client_id) = registered {
            self.writers.lock().unwrap().remove(&client_id);
        }
        Ok(())
    }

    fn dispatch(self: &Arc<Self>, envelope: WireEnvelope) {
        let client_id = envelope.client_id.clone();
        let correlation_id = envelope.correlation_id.clone();

        let decoded = match decode_request(&envelope) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!("protocol error from client {}: {:?}; dropping frame", client_id, err);
                return;
            }
        };

        match decoded.payload {
            RequestPayload::SessionList(_) => {
                let router = self.clone();
                thread::spawn(move || {
                    match handlers::list_sessions_response(&client_id, &correlation_id, &router.tracker) {
                        Ok(envelope) => {
                            let _ = router.responses_tx.send((client_id, envelope));
                        }
                        Err(err) => warn!("building session list response: {:?}", err),
                    }
                });
            }
            RequestPayload::Kill(dto) => {
                let router = self.clone();
                thread::spawn(move || {
                    match handlers::kill_session_response(&client_id, &correlation_id, dto.ptm_pid) {
                        Ok(envelope) => {
                            let _ = router.responses_tx.send((client_id, envelope));
                        }
                        Err(err) => warn!("building kill response: {:?}", err),
                    }
                });
            }
            RequestPayload::Watch(dto) => {
                self.start_or_refresh_watch(client_id, correlation_id, dto);
            }
            RequestPayload::SendKeys(dto) => {
                handlers::send_keys(dto, &self.tracker, self.session_injection_enabled);
            }
        }
    }

    /// Subsequent watch requests carrying a correlation_id already running
    /// are coalesced into a lease refresh; only the first spawns a handler.
    fn start_or_refresh_watch(self: &Arc<Self>, client_id: String, correlation_id: String, dto: EventWatchRequestDto) {
        self.active_streams.refresh(&correlation_id);

        let mut running = self.watch_handlers.lock().unwrap();
        if running.contains(&correlation_id) {
            return;
        }
        running.insert(correlation_id.clone());
        drop(running);

        let router = self.clone();
        thread::spawn(move || router.run_watch(client_id, correlation_id, dto));
    }

    fn run_watch(self: Arc<Self>, client_id: String, correlation_id: String, dto: EventWatchRequestDto) {
        let responses_tx = self.responses_tx.clone();
        let cb_client_id = client_id.clone();
        let cb_correlation_id = correlation_id.clone();
        let ptm_filter = dto.ptm_pid;

        let subscriber: Arc<dyn EventSubscriber> = Arc::new(FnSubscriber(move |kind, event: &sshlogd_protocol::Event| {
            if let Some(filter) = ptm_filter {
                if event.ptm_pid != filter {
                    return;
                }
            }
            let envelope = EventWatchResponseDto::new(kind, event).and_then(|dto| {
                encode_response(&cb_client_id, &cb_correlation_id, &ResponsePayload::Watch(dto))
            });
            match envelope {
                Ok(envelope) => {
                    if responses_tx.send((cb_client_id.clone(), envelope)).is_err() {
                        warn!("response queue closed; dropping watch event");
                    }
                }
                Err(err) => warn!("encoding watch response: {:?}", err),
            }
        }));

        self.bus.subscribe(subscriber.clone(), Some(&dto.event_types));

        while self.active_streams.is_active(&correlation_id) && !self.shutdown.load(Ordering::SeqCst) {
            thread::sleep(WATCH_POLL_INTERVAL);
        }

        self.bus.unsubscribe(&subscriber, Some(&dto.event_types));
        self.watch_handlers.lock().unwrap().remove(&correlation_id);
    }

    fn drain_responses(self: Arc<Self>) {
        loop {
            match self.responses_rx.recv_timeout(SOCK_POLL_TIMEOUT) {
                Ok((client_id, envelope)) => {
                    if self.shutdown.load(Ordering::SeqCst) {
                        // invariant: no response is emitted after shutdown begins.
                        continue;
                    }
                    self.write_to(&client_id, &envelope);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn write_to(&self, client_id: &str, envelope: &WireEnvelope) {
        let writer = self.writers.lock().unwrap().get(client_id).cloned();
        match writer {
            Some(writer) => {
                let mut stream = writer.lock().unwrap();
                if let Err(err) = sshlogd_protocol::write_envelope(&mut *stream, envelope) {
                    warn!("writing response to client {}: {:?}", client_id, err);
                    drop(stream);
                    self.writers.lock().unwrap().remove(client_id);
                }
            }
            None => warn!("no connection registered for client {}; dropping response", client_id),
        }
    }
}
