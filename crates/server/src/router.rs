//! Per-socket control protocol handling.
//!
//! Each WebSocket connection gets one reader loop (this module), one writer
//! task draining the outbound channel, and — once `init` succeeds — one
//! producer task streaming frames. Frames are queued with `try_send` and
//! dropped when the channel is full; acks and control events use reliable
//! sends. Handler failures become `{success:false, error}` acks and never
//! cross sockets.

use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use periscope_protocol::{
    AckReply, ActionAck, ActionRequest, ClientCommand, ClientEnvelope, ControlAck,
    ControlRequest, ErrorAck, InitAck, InitRequest, LatencyReport, NavigateAck, NavigateRequest,
    Outbound, ResizeAck, ResizeRequest, ServerEvent, SettingsAck, SettingsRequest,
    SettingsUpdated, StatusAck,
};

use crate::driver::{BrowserDriver, SnapshotOptions};
use crate::session::{Session, SessionSettings};
use crate::stream::{self, SharedStream, StreamCommand, StreamState, run_producer};
use crate::web::AppState;

/// Outbound queue depth. Control messages are few; the rest of the budget
/// absorbs frame bursts before the drop-on-full policy kicks in.
const OUTBOUND_BUFFER: usize = 32;

/// Viewport bounds accepted from clients; anything outside falls back to the
/// defaults.
const WIDTH_RANGE: std::ops::RangeInclusive<u32> = 320..=3840;
const HEIGHT_RANGE: std::ops::RangeInclusive<u32> = 240..=2160;
const DEFAULT_WIDTH: u32 = 1280;
const DEFAULT_HEIGHT: u32 = 720;

/// Drive one client connection until the transport drops.
pub async fn handle_socket<D: BrowserDriver>(
    socket: WebSocket,
    app: Arc<AppState<D>>,
    session: Session,
) {
    let socket_id = Uuid::new_v4();
    tracing::info!(%socket_id, session_id = %session.id, "Client connected");

    let (sink, mut inbound) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel::<Outbound>(OUTBOUND_BUFFER);
    let writer = tokio::spawn(write_loop(sink, outbound_rx));

    let mut conn = Connection {
        app,
        socket_id,
        session,
        outbound: outbound_tx,
        stream: None,
    };

    while let Some(message) = inbound.next().await {
        match message {
            Ok(Message::Text(text)) => conn.handle_text(text.as_str()).await,
            Ok(Message::Close(_)) => {
                tracing::info!(%socket_id, "Client closed the socket");
                break;
            }
            Ok(_) => {} // binary frames and ws ping/pong are not part of the protocol
            Err(e) => {
                tracing::debug!(%socket_id, "WebSocket error: {e}");
                break;
            }
        }
    }

    conn.teardown().await;
    writer.abort();
    tracing::info!(%socket_id, "Client disconnected");
}

/// Serialize outbound messages onto the socket until either side closes.
async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut outbound: mpsc::Receiver<Outbound>) {
    while let Some(message) = outbound.recv().await {
        let json = match serde_json::to_string(&message) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("Failed to serialize outbound message: {e}");
                continue;
            }
        };
        if sink.send(Message::Text(json.into())).await.is_err() {
            break;
        }
    }
}

/// Per-connection state: the bound session, the outbound queue, and the
/// stream handle once `init` has run.
struct Connection<D: BrowserDriver> {
    app: Arc<AppState<D>>,
    socket_id: Uuid,
    session: Session,
    outbound: mpsc::Sender<Outbound>,
    stream: Option<StreamHandle>,
}

/// Everything owned on behalf of one socket's stream.
struct StreamHandle {
    browser_id: Uuid,
    state: SharedStream,
    commands: mpsc::Sender<StreamCommand>,
    task: JoinHandle<()>,
}

impl<D: BrowserDriver> Connection<D> {
    #[cfg(test)]
    fn new(app: Arc<AppState<D>>, session: Session, outbound: mpsc::Sender<Outbound>) -> Self {
        Self {
            app,
            socket_id: Uuid::new_v4(),
            session,
            outbound,
            stream: None,
        }
    }

    async fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<ClientEnvelope>(text) {
            Ok(envelope) => self.dispatch(envelope.command, envelope.ack).await,
            Err(e) => {
                tracing::warn!(socket_id = %self.socket_id, "Invalid client message: {e}");
            }
        }
    }

    async fn dispatch(&mut self, command: ClientCommand, ack: Option<u64>) {
        match command {
            ClientCommand::Init(req) => self.handle_init(req, ack).await,
            ClientCommand::Navigate(req) => {
                let payload = self.handle_navigate(req).await;
                self.reply(ack, payload).await;
            }
            ClientCommand::Action(req) => {
                let payload = self.handle_action(req).await;
                self.reply(ack, payload).await;
            }
            ClientCommand::Resize(req) => {
                let payload = self.handle_resize(req).await;
                self.reply(ack, payload).await;
            }
            ClientCommand::Status => {
                let payload = self.handle_status().await;
                self.reply(ack, payload).await;
            }
            ClientCommand::StreamSettings(req) => {
                let payload = self.handle_stream_settings(req).await;
                self.reply(ack, payload).await;
            }
            ClientCommand::StreamControl(req) => {
                let payload = self.handle_stream_control(req).await;
                self.reply(ack, payload).await;
            }
            ClientCommand::LatencyReport(report) => self.handle_latency_report(report),
            ClientCommand::Ping(t0) => self.send_event(ServerEvent::Pong(t0)).await,
        }
    }

    /// Bind a browser to this socket and start the producer. Idempotent: a
    /// socket that already owns a browser gets the same id back.
    async fn handle_init(&mut self, req: InitRequest, ack: Option<u64>) {
        if let Some(handle) = &self.stream {
            let payload = to_value(InitAck {
                success: true,
                browser_id: handle.browser_id,
            });
            self.reply(ack, payload).await;
            return;
        }

        let prefs = self.merge_session_prefs(req);
        let url = prefs
            .url
            .clone()
            .unwrap_or_else(|| self.app.config.browser.default_url.clone());
        let width = prefs
            .width
            .filter(|w| WIDTH_RANGE.contains(w))
            .unwrap_or(DEFAULT_WIDTH);
        let height = prefs
            .height
            .filter(|h| HEIGHT_RANGE.contains(h))
            .unwrap_or(DEFAULT_HEIGHT);

        let browser_id = match self.app.pool.create(&url, width, height).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(socket_id = %self.socket_id, "Init failed: {e}");
                self.reply(ack, to_value(ErrorAck::new(e.to_string()))).await;
                return;
            }
        };

        self.app
            .clients
            .write()
            .await
            .insert(self.socket_id, browser_id);
        self.app
            .sessions
            .set_browser_id(self.session.id, Some(browser_id))
            .await;
        self.app
            .sessions
            .update_settings(
                self.session.id,
                SessionSettings {
                    fps: prefs.fps,
                    quality: prefs.quality,
                    adaptive: prefs.adaptive_bitrate,
                    resolution: Some((width, height)),
                },
            )
            .await;

        let state: SharedStream = Arc::new(Mutex::new(StreamState::new(
            self.socket_id,
            browser_id,
            &prefs,
            self.app.limits,
        )));
        let (cmd_tx, cmd_rx) = mpsc::channel(8);

        // Queue the ack before spawning the producer so it precedes the
        // first frame on the outbound channel.
        self.reply(
            ack,
            to_value(InitAck {
                success: true,
                browser_id,
            }),
        )
        .await;

        let opts = SnapshotOptions {
            format: self.app.config.browser.screenshot_type,
            quality: self.app.config.browser.screenshot_quality,
            full_page: false,
        };
        let task = tokio::spawn(run_producer(
            Arc::clone(&state),
            Arc::clone(&self.app.pool),
            opts,
            self.outbound.clone(),
            cmd_rx,
        ));

        tracing::info!(
            socket_id = %self.socket_id,
            %browser_id,
            %url,
            width,
            height,
            "Stream initialised"
        );
        self.stream = Some(StreamHandle {
            browser_id,
            state,
            commands: cmd_tx,
            task,
        });
    }

    async fn handle_navigate(&mut self, req: NavigateRequest) -> serde_json::Value {
        let Some(browser_id) = self.browser_id() else {
            return to_value(ErrorAck::new("no browser bound to this socket"));
        };
        match self.app.pool.navigate(browser_id, &req.url).await {
            Ok(url) => {
                self.app.sessions.touch(self.session.id).await;
                to_value(NavigateAck {
                    success: true,
                    current_url: Some(url),
                })
            }
            Err(e) => to_value(ErrorAck::new(e.to_string())),
        }
    }

    async fn handle_action(&mut self, req: ActionRequest) -> serde_json::Value {
        let Some(browser_id) = self.browser_id() else {
            return to_value(ErrorAck::new("no browser bound to this socket"));
        };

        // Resolved from pool state without entering the input dispatch
        if req.action == ActionRequest::GET_CURRENT_URL {
            return match self.app.pool.current_url(browser_id).await {
                Ok(url) => to_value(ActionAck {
                    success: true,
                    url: Some(url),
                }),
                Err(e) => to_value(ErrorAck::new(e.to_string())),
            };
        }

        let action = match req.parse() {
            Ok(action) => action,
            Err(e) => {
                return to_value(ErrorAck::new(format!(
                    "unknown or malformed action '{}': {e}",
                    req.action
                )));
            }
        };

        match self.app.pool.execute(browser_id, &action).await {
            Ok(()) => to_value(ActionAck {
                success: true,
                url: None,
            }),
            Err(e) => to_value(ErrorAck::new(e.to_string())),
        }
    }

    async fn handle_resize(&mut self, req: ResizeRequest) -> serde_json::Value {
        let Some(browser_id) = self.browser_id() else {
            return to_value(ErrorAck::new("no browser bound to this socket"));
        };
        let width = req.width.clamp(*WIDTH_RANGE.start(), *WIDTH_RANGE.end());
        let height = req.height.clamp(*HEIGHT_RANGE.start(), *HEIGHT_RANGE.end());

        match self.app.pool.resize(browser_id, width, height).await {
            Ok(()) => {
                let mut settings = self.session.settings;
                settings.resolution = Some((width, height));
                self.session.settings = settings;
                self.app
                    .sessions
                    .update_settings(self.session.id, settings)
                    .await;
                to_value(ResizeAck { success: true })
            }
            Err(e) => to_value(ErrorAck::new(e.to_string())),
        }
    }

    async fn handle_status(&self) -> serde_json::Value {
        let (browser_id, stream) = match &self.stream {
            Some(handle) => (
                Some(handle.browser_id),
                Some(stream::lock(&handle.state).snapshot()),
            ),
            None => (None, None),
        };
        to_value(StatusAck {
            connected: true,
            browser_id,
            active_browsers: self.app.pool.count().await,
            all_browser_ids: self.app.pool.list().await,
            stream,
        })
    }

    async fn handle_stream_settings(&mut self, req: SettingsRequest) -> serde_json::Value {
        let Some(handle) = &self.stream else {
            return to_value(ErrorAck::new("no active stream"));
        };

        // A viewport change rides along the settings message
        if let (Some(width), Some(height)) = (req.width, req.height) {
            let width = width.clamp(*WIDTH_RANGE.start(), *WIDTH_RANGE.end());
            let height = height.clamp(*HEIGHT_RANGE.start(), *HEIGHT_RANGE.end());
            if let Err(e) = self.app.pool.resize(handle.browser_id, width, height).await {
                tracing::warn!(socket_id = %self.socket_id, "Viewport change failed: {e}");
            }
        }

        // Preview the update on a copy so the settings-updated event can be
        // queued before the shared state changes; every frame produced under
        // the new settings then follows the event on the channel.
        let (changed, before, settings) = {
            let mut preview = stream::lock(&handle.state).clone();
            let before = preview.settings();
            let changed = preview.apply_update(&req);
            (changed, before, preview.settings())
        };

        if changed {
            tracing::info!(
                socket_id = %self.socket_id,
                old_fps = before.fps,
                new_fps = settings.fps,
                old_quality = before.quality,
                new_quality = settings.quality,
                adaptive = settings.adaptive_bitrate,
                "Stream settings updated"
            );
            self.send_event(ServerEvent::StreamSettingsUpdated(SettingsUpdated {
                settings,
            }))
            .await;
            stream::lock(&handle.state).apply_update(&req);
            let _ = handle.commands.send(StreamCommand::Wake).await;
        }

        self.app
            .sessions
            .update_settings(
                self.session.id,
                SessionSettings {
                    fps: Some(settings.fps),
                    quality: Some(settings.quality),
                    adaptive: Some(settings.adaptive_bitrate),
                    resolution: self.session.settings.resolution,
                },
            )
            .await;

        to_value(SettingsAck {
            success: true,
            settings,
        })
    }

    async fn handle_stream_control(&mut self, req: ControlRequest) -> serde_json::Value {
        let Some(handle) = &self.stream else {
            return to_value(ErrorAck::new("no active stream"));
        };
        stream::lock(&handle.state).active = req.streaming;
        let _ = handle.commands.send(StreamCommand::Wake).await;

        tracing::info!(
            socket_id = %self.socket_id,
            streaming = req.streaming,
            "Stream control"
        );
        to_value(ControlAck {
            success: true,
            streaming: req.streaming,
        })
    }

    fn handle_latency_report(&mut self, report: LatencyReport) {
        if let Some(handle) = &self.stream {
            stream::lock(&handle.state).apply_latency_report(report.latency);
        }
    }

    fn browser_id(&self) -> Option<Uuid> {
        self.stream.as_ref().map(|handle| handle.browser_id)
    }

    /// Fill request gaps from the session's remembered preferences.
    fn merge_session_prefs(&self, mut req: InitRequest) -> InitRequest {
        let saved = &self.session.settings;
        req.fps = req.fps.or(saved.fps);
        req.quality = req.quality.or(saved.quality);
        req.adaptive_bitrate = req.adaptive_bitrate.or(saved.adaptive);
        if req.width.is_none()
            && req.height.is_none()
            && let Some((width, height)) = saved.resolution
        {
            req.width = Some(width);
            req.height = Some(height);
        }
        req
    }

    async fn reply(&self, ack: Option<u64>, payload: serde_json::Value) {
        let Some(ack) = ack else { return };
        if self
            .outbound
            .send(Outbound::Ack(AckReply { ack, payload }))
            .await
            .is_err()
        {
            tracing::debug!(socket_id = %self.socket_id, "Socket gone before ack");
        }
    }

    async fn send_event(&self, event: ServerEvent) {
        if self.outbound.send(Outbound::Event(event)).await.is_err() {
            tracing::debug!(socket_id = %self.socket_id, "Socket gone before event");
        }
    }

    /// Disconnect cleanup: stop the producer, release the ownership mapping,
    /// and close the browser exactly once.
    async fn teardown(mut self) {
        if let Some(handle) = self.stream.take() {
            let _ = handle.commands.send(StreamCommand::Shutdown).await;
            self.app.clients.write().await.remove(&self.socket_id);
            if self.app.pool.close(handle.browser_id).await {
                tracing::info!(
                    socket_id = %self.socket_id,
                    browser_id = %handle.browser_id,
                    "Closed browser on disconnect"
                );
            }
            self.app
                .sessions
                .set_browser_id(self.session.id, None)
                .await;
            let _ = handle.task.await;
        }
        self.app.sessions.touch(self.session.id).await;
    }
}

fn to_value<T: Serialize>(payload: T) -> serde_json::Value {
    serde_json::to_value(payload)
        .unwrap_or_else(|_| json!({"success": false, "error": "internal serialization error"}))
}
