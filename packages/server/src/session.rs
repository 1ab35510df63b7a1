//! Per-socket session state machine.
//!
//! A session mediates between one WebSocket and the room registry:
//! `Connected -> Authenticated -> Joined(doc)`, with `leave`/`logout` moving
//! back down. Frames arriving in a disallowed state produce a protocol error
//! without closing the socket; clients are allowed to race.

use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use coedit_auth::{AuthError, Principal};
use coedit_protocol::{framing, ClientMessage, ErrorCode, ServerMessage};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior, Sleep};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::gateway::AppState;
use crate::room::{RoomHandle, RoomMsg, RoomSignal, SessionHandle, SessionId};

type WsSink = SplitSink<WebSocket, Message>;

enum Phase {
    Connected,
    Authenticated,
    Joined { document_id: String, room: RoomHandle },
}

pub async fn run(socket: WebSocket, query_token: Option<String>, state: Arc<AppState>) {
    let session_id = Uuid::new_v4();
    state.sessions.register(session_id);
    debug!(session_id = %session_id, "session connected");

    let session = Session {
        id: session_id,
        state: state.clone(),
        phase: Phase::Connected,
        principal: None,
        frames_rx: None,
        signals_rx: None,
        missed_pongs: 0,
    };
    session.drive(socket, query_token).await;

    state.sessions.deregister(session_id);
    debug!(session_id = %session_id, "session closed");
}

struct Session {
    id: SessionId,
    state: Arc<AppState>,
    phase: Phase,
    principal: Option<Principal>,
    frames_rx: Option<mpsc::Receiver<ServerMessage>>,
    signals_rx: Option<mpsc::Receiver<RoomSignal>>,
    missed_pongs: u32,
}

impl Session {
    async fn drive(mut self, socket: WebSocket, query_token: Option<String>) {
        let config = self.state.config.clone();
        let (mut sink, mut stream) = socket.split();

        let auth_deadline = sleep(config.auth_deadline);
        tokio::pin!(auth_deadline);

        let mut heartbeat = interval(config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut shutdown = self.state.shutdown.subscribe();

        // A token in the connection query authenticates eagerly; an
        // `authenticate` frame remains authoritative and may replace it.
        if let Some(token) = query_token {
            let msg = ClientMessage::Authenticate { token };
            if self
                .handle_frame(msg, &mut sink, &mut auth_deadline)
                .await
                .is_break()
            {
                self.leave_room();
                return;
            }
        }

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    self.drain_outbound(&mut sink).await;
                    self.leave_room();
                    let _ = write_frame(&mut sink, &ServerMessage::ShuttingDown,
                                        config.write_timeout).await;
                    close(&mut sink, ErrorCode::ShuttingDown).await;
                    return;
                }

                () = &mut auth_deadline, if matches!(self.phase, Phase::Connected) => {
                    let _ = write_frame(
                        &mut sink,
                        &ServerMessage::error(ErrorCode::AuthRequired, "authentication deadline exceeded"),
                        config.write_timeout,
                    ).await;
                    close(&mut sink, ErrorCode::AuthRequired).await;
                    return;
                }

                _ = heartbeat.tick() => {
                    if self.missed_pongs >= config.heartbeat_miss_limit {
                        warn!(session_id = %self.id, "heartbeat timed out");
                        self.leave_room();
                        close_raw(&mut sink, 4000, "heartbeat timeout").await;
                        return;
                    }
                    self.missed_pongs += 1;
                    let ping = sink.send(Message::Ping(Vec::new()));
                    if !matches!(timeout(config.write_timeout, ping).await, Ok(Ok(()))) {
                        self.leave_room();
                        return;
                    }
                }

                frame = recv_opt(&mut self.frames_rx) => {
                    match frame {
                        Some(msg) => {
                            if write_frame(&mut sink, &msg, config.write_timeout).await.is_err() {
                                self.leave_room();
                                close(&mut sink, ErrorCode::SlowConsumer).await;
                                return;
                            }
                        }
                        None => {
                            // The room dropped us without a signal: it died.
                            self.clear_room();
                            let _ = write_frame(
                                &mut sink,
                                &ServerMessage::error(ErrorCode::Unavailable, "document room closed"),
                                config.write_timeout,
                            ).await;
                        }
                    }
                }

                signal = recv_opt(&mut self.signals_rx) => {
                    match signal {
                        Some(RoomSignal::Ejected { document_id }) => {
                            debug!(session_id = %self.id, document_id = %document_id, "ejected");
                            self.clear_room();
                        }
                        Some(RoomSignal::Close(code)) => {
                            self.leave_room();
                            close(&mut sink, code).await;
                            return;
                        }
                        None => self.signals_rx = None,
                    }
                }

                inbound = stream.next() => {
                    let Some(Ok(msg)) = inbound else {
                        self.leave_room();
                        return;
                    };
                    if self
                        .handle_socket_message(msg, &mut sink, &mut auth_deadline)
                        .await
                        .is_break()
                    {
                        return;
                    }
                }
            }
        }
    }

    async fn handle_socket_message(
        &mut self,
        msg: Message,
        sink: &mut WsSink,
        auth_deadline: &mut Pin<&mut Sleep>,
    ) -> ControlFlow<()> {
        match msg {
            Message::Text(text) => match ClientMessage::decode(&text) {
                Ok(frame) => self.handle_frame(frame, sink, auth_deadline).await,
                Err(e) => {
                    self.protocol_error(sink, &e.to_string()).await;
                    ControlFlow::Continue(())
                }
            },
            Message::Binary(buf) => match framing::decode_update(&buf) {
                Ok(update) => {
                    let frame = ClientMessage::DocumentUpdate {
                        document_id: update.document_id,
                        update: update.update,
                    };
                    self.handle_frame(frame, sink, auth_deadline).await
                }
                Err(e) => {
                    self.protocol_error(sink, &e.to_string()).await;
                    ControlFlow::Continue(())
                }
            },
            Message::Ping(payload) => {
                let _ = sink.send(Message::Pong(payload)).await;
                ControlFlow::Continue(())
            }
            Message::Pong(_) => {
                self.missed_pongs = 0;
                ControlFlow::Continue(())
            }
            Message::Close(_) => {
                self.leave_room();
                ControlFlow::Break(())
            }
        }
    }

    async fn handle_frame(
        &mut self,
        msg: ClientMessage,
        sink: &mut WsSink,
        auth_deadline: &mut Pin<&mut Sleep>,
    ) -> ControlFlow<()> {
        let config = self.state.config.clone();
        match msg {
            // Answered immediately in any phase.
            ClientMessage::Ping => {
                let _ = write_frame(sink, &ServerMessage::Pong, config.write_timeout).await;
            }

            ClientMessage::Authenticate { token } => {
                // The authenticate frame is authoritative: it may replace a
                // principal established from the connection query token, but
                // not while joined to a document.
                if matches!(self.phase, Phase::Joined { .. }) {
                    self.protocol_error(sink, "cannot re-authenticate while joined")
                        .await;
                    return ControlFlow::Continue(());
                }
                match self.state.verifier.verify(&token) {
                    Ok(principal) => {
                        info!(session_id = %self.id,
                              principal_id = %principal.principal_id, "authenticated");
                        let ack = ServerMessage::Authenticated {
                            principal_id: principal.principal_id.clone(),
                            display_name: principal.display_name.clone(),
                            role: principal.role.as_str().to_owned(),
                            permissions: principal.permissions.clone(),
                        };
                        self.principal = Some(principal);
                        self.phase = Phase::Authenticated;
                        if write_frame(sink, &ack, config.write_timeout).await.is_err() {
                            return ControlFlow::Break(());
                        }
                    }
                    Err(e) => {
                        let code = match e {
                            AuthError::TokenExpired => ErrorCode::AuthExpired,
                            _ => ErrorCode::AuthInvalid,
                        };
                        let _ = write_frame(
                            sink,
                            &ServerMessage::AuthError {
                                code,
                                message: e.to_string(),
                            },
                            config.write_timeout,
                        )
                        .await;
                        close(sink, code).await;
                        return ControlFlow::Break(());
                    }
                }
            }

            ClientMessage::Logout => {
                if !matches!(self.phase, Phase::Authenticated) {
                    self.protocol_error(sink, "logout requires an idle authenticated session")
                        .await;
                    return ControlFlow::Continue(());
                }
                info!(session_id = %self.id, "logged out");
                self.principal = None;
                self.phase = Phase::Connected;
                auth_deadline
                    .as_mut()
                    .reset(Instant::now() + config.auth_deadline);
            }

            ClientMessage::JoinDocument { document_id } => match self.phase {
                Phase::Connected => {
                    self.protocol_error(sink, "authentication required").await;
                }
                Phase::Authenticated => return self.do_join(document_id, sink).await,
                Phase::Joined { .. } => {
                    // Implicit leave, then join the new document.
                    self.leave_room();
                    return self.do_join(document_id, sink).await;
                }
            },

            ClientMessage::LeaveDocument { document_id } => {
                let joined = matches!(&self.phase,
                                      Phase::Joined { document_id: d, .. } if *d == document_id);
                if !joined {
                    self.protocol_error(sink, "not joined to that document").await;
                    return ControlFlow::Continue(());
                }
                self.leave_room();
                let _ = write_frame(
                    sink,
                    &ServerMessage::DocumentLeft { document_id },
                    config.write_timeout,
                )
                .await;
            }

            ClientMessage::DocumentUpdate {
                document_id,
                update,
            } => {
                let room = match &self.phase {
                    Phase::Joined { document_id: d, room } if *d == document_id => room.clone(),
                    _ => {
                        self.protocol_error(sink, "not joined to that document").await;
                        return ControlFlow::Continue(());
                    }
                };
                let send = room.send(RoomMsg::Update {
                    session_id: self.id,
                    update,
                });
                match timeout(config.write_timeout, send).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => {
                        self.clear_room();
                        let _ = write_frame(
                            sink,
                            &ServerMessage::error(ErrorCode::Unavailable, "document room closed"),
                            config.write_timeout,
                        )
                        .await;
                    }
                    Err(_) => {
                        // Bounded wait on a jammed room inbox expired.
                        self.leave_room();
                        close(sink, ErrorCode::SlowConsumer).await;
                        return ControlFlow::Break(());
                    }
                }
            }

            ClientMessage::CursorUpdate {
                document_id,
                cursor,
            } => {
                let room = match &self.phase {
                    Phase::Joined { document_id: d, room } if *d == document_id => room.clone(),
                    _ => {
                        self.protocol_error(sink, "not joined to that document").await;
                        return ControlFlow::Continue(());
                    }
                };
                // Cursor traffic is coalescable; drop it when the inbox is full.
                let _ = room.try_send(RoomMsg::Cursor {
                    session_id: self.id,
                    cursor,
                });
            }
        }
        ControlFlow::Continue(())
    }

    async fn do_join(&mut self, document_id: String, sink: &mut WsSink) -> ControlFlow<()> {
        let config = self.state.config.clone();
        let Some(principal) = self.principal.clone() else {
            self.protocol_error(sink, "authentication required").await;
            return ControlFlow::Continue(());
        };

        let (handle, frames_rx, signals_rx) =
            SessionHandle::new(self.id, principal, config.session_outbound_capacity);
        let join = self.state.registry.join(&document_id, handle);
        match timeout(config.join_deadline, join).await {
            Ok(Ok((accept, room))) => {
                self.frames_rx = Some(frames_rx);
                self.signals_rx = Some(signals_rx);
                self.phase = Phase::Joined {
                    document_id: document_id.clone(),
                    room,
                };
                let joined = ServerMessage::DocumentJoined {
                    document_id,
                    metadata: accept.metadata,
                    has_write_access: accept.has_write_access,
                    users: accept.users,
                    document_state: accept.document_state,
                };
                if write_frame(sink, &joined, config.write_timeout).await.is_err() {
                    self.leave_room();
                    close(sink, ErrorCode::SlowConsumer).await;
                    return ControlFlow::Break(());
                }
            }
            Ok(Err(code)) => {
                let _ = write_frame(
                    sink,
                    &ServerMessage::error(code, "join failed"),
                    config.write_timeout,
                )
                .await;
            }
            Err(_) => {
                let _ = write_frame(
                    sink,
                    &ServerMessage::error(ErrorCode::JoinFailed, "join timed out"),
                    config.write_timeout,
                )
                .await;
            }
        }
        ControlFlow::Continue(())
    }

    /// Leave the current room (if any) and fall back to the authenticated
    /// phase. The leave is delivered even if the session is tearing down.
    fn leave_room(&mut self) {
        if !matches!(self.phase, Phase::Joined { .. }) {
            return;
        }
        if let Phase::Joined { room, .. } =
            std::mem::replace(&mut self.phase, Phase::Authenticated)
        {
            let session_id = self.id;
            tokio::spawn(async move {
                let _ = room.send(RoomMsg::Leave { session_id }).await;
            });
        }
        self.frames_rx = None;
        self.signals_rx = None;
    }

    /// The room already removed us; just reset local state.
    fn clear_room(&mut self) {
        if matches!(self.phase, Phase::Joined { .. }) {
            self.phase = Phase::Authenticated;
        }
        self.frames_rx = None;
        self.signals_rx = None;
    }

    async fn protocol_error(&mut self, sink: &mut WsSink, message: &str) {
        let _ = write_frame(
            sink,
            &ServerMessage::error(ErrorCode::ProtocolError, message),
            self.state.config.write_timeout,
        )
        .await;
    }

    /// Best-effort drain of queued frames before a graceful close.
    async fn drain_outbound(&mut self, sink: &mut WsSink) {
        let Some(mut rx) = self.frames_rx.take() else {
            return;
        };
        while let Ok(msg) = rx.try_recv() {
            if write_frame(sink, &msg, self.state.config.write_timeout)
                .await
                .is_err()
            {
                break;
            }
        }
    }
}

async fn recv_opt<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn write_frame(sink: &mut WsSink, msg: &ServerMessage, budget: Duration) -> Result<(), ()> {
    match timeout(budget, sink.send(Message::Text(msg.encode()))).await {
        Ok(Ok(())) => Ok(()),
        _ => Err(()),
    }
}

async fn close(sink: &mut WsSink, code: ErrorCode) {
    close_raw(sink, code.close_code(), &code.to_string()).await;
}

async fn close_raw(sink: &mut WsSink, code: u16, reason: &str) {
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_owned().into(),
        })))
        .await;
}
