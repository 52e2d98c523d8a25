//! Per-connection WebSocket handling: pump outbound room events to the
//! socket, parse inbound client events, and route them to the owning room.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::error::BrokerError;
use crate::protocol::{ClientEvent, ServerEvent};
use crate::room::{Registry, RoomCommand, RoomHandle};
use crate::store::SessionRecord;

/// What this connection is bound to once it has joined a session.
struct Binding {
    transport_id: String,
    room: RoomHandle,
}

pub async fn handle_connection(
    ws: WebSocketStream<TcpStream>,
    addr: SocketAddr,
    registry: Arc<Registry>,
) {
    let (mut sink, mut stream) = ws.split();
    let (outbox, mut inbox) = mpsc::channel::<ServerEvent>(256);
    let mut binding: Option<Binding> = None;

    log::info!("client {addr} connected");

    loop {
        tokio::select! {
            Some(event) = inbox.recv() => {
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        log::error!("client {addr}: event serialization failed: {e}");
                        continue;
                    }
                };
                if sink.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientEvent>(&text) {
                            Ok(event) => {
                                if let Err(e) =
                                    dispatch(&registry, &outbox, &mut binding, event).await
                                {
                                    log::warn!("client {addr}: {e}");
                                    let _ = outbox.try_send(ServerEvent::Error {
                                        message: e.to_string(),
                                    });
                                }
                            }
                            Err(e) => {
                                log::warn!("client {addr}: malformed event: {e}");
                                let _ = outbox.try_send(ServerEvent::Error {
                                    message: format!("malformed event: {e}"),
                                });
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        log::debug!("client {addr}: ws error: {e}");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    if let Some(binding) = binding {
        // The room may already be gone; nothing left to tell this client.
        let _ = binding
            .room
            .send(RoomCommand::Disconnect {
                transport_id: binding.transport_id,
            })
            .await;
    }
    log::info!("client {addr} disconnected");
}

fn transport_of(binding: &Option<Binding>) -> Result<String, BrokerError> {
    binding
        .as_ref()
        .map(|b| b.transport_id.clone())
        .ok_or(BrokerError::NotJoined)
}

/// Route a command to the bound room. A room that ended since the bind
/// leaves a stale binding behind; drop it so the failure surfaces once
/// and later events report `NotJoined`.
async fn route(binding: &mut Option<Binding>, cmd: RoomCommand) -> Result<(), BrokerError> {
    let bound = binding.as_ref().ok_or(BrokerError::NotJoined)?;
    match bound.room.send(cmd).await {
        Ok(()) => Ok(()),
        Err(e) => {
            *binding = None;
            Err(e)
        }
    }
}

async fn dispatch(
    registry: &Arc<Registry>,
    outbox: &mpsc::Sender<ServerEvent>,
    binding: &mut Option<Binding>,
    event: ClientEvent,
) -> Result<(), BrokerError> {
    match event {
        ClientEvent::CreateSession {
            session_id,
            name,
            host_name,
        } => {
            let id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
            registry
                .store()
                .create(SessionRecord::new(id.clone(), name, host_name))
                .await?;
            let _ = outbox.try_send(ServerEvent::SessionCreated { session_id: id });
            Ok(())
        }
        ClientEvent::FetchSession { session_id } => {
            let record = registry
                .store()
                .get(&session_id)
                .await?
                .ok_or(BrokerError::SessionNotFound(session_id))?;
            let _ = outbox.try_send(ServerEvent::SessionInfo {
                id: record.id,
                name: record.name,
                host: record.host.name,
            });
            Ok(())
        }
        ClientEvent::HostJoinSession {
            session_id,
            host_transport_id,
        } => {
            let room = registry.get_or_spawn(&session_id).await?;
            room.send(RoomCommand::BindHost {
                transport_id: host_transport_id.clone(),
                outbox: outbox.clone(),
            })
            .await?;
            *binding = Some(Binding {
                transport_id: host_transport_id,
                room,
            });
            Ok(())
        }
        ClientEvent::JoinSession {
            session_id,
            viewer_transport_id,
            display_name,
        } => {
            let room = registry.get_or_spawn(&session_id).await?;
            room.send(RoomCommand::Join {
                transport_id: viewer_transport_id.clone(),
                display_name,
                outbox: outbox.clone(),
            })
            .await?;
            *binding = Some(Binding {
                transport_id: viewer_transport_id,
                room,
            });
            Ok(())
        }
        ClientEvent::HostOffer {
            sdp,
            host_transport_id,
        } => {
            route(
                binding,
                RoomCommand::HostOffer {
                    transport_id: host_transport_id,
                    sdp,
                },
            )
            .await
        }
        ClientEvent::UserOffer {
            sdp,
            viewer_transport_id,
        } => {
            route(
                binding,
                RoomCommand::ViewerOffer {
                    transport_id: viewer_transport_id,
                    sdp,
                },
            )
            .await
        }
        ClientEvent::HostIceCandidate { candidate }
        | ClientEvent::UserIceCandidate { candidate } => {
            let transport_id = transport_of(binding)?;
            route(
                binding,
                RoomCommand::IceCandidate {
                    transport_id,
                    candidate,
                },
            )
            .await
        }
        ClientEvent::ChatMessage {
            author_name,
            message,
        } => {
            let transport_id = transport_of(binding)?;
            route(
                binding,
                RoomCommand::Chat {
                    transport_id,
                    author: author_name,
                    message,
                },
            )
            .await
        }
        ClientEvent::Question {
            creator_name,
            title,
            tags,
        } => {
            let transport_id = transport_of(binding)?;
            route(
                binding,
                RoomCommand::AddQuestion {
                    transport_id,
                    creator: creator_name,
                    title,
                    tags,
                },
            )
            .await
        }
        ClientEvent::QuestionUpvote {
            voter_name,
            question_id,
        } => {
            let transport_id = transport_of(binding)?;
            route(
                binding,
                RoomCommand::Upvote {
                    transport_id,
                    question_id,
                    voter: voter_name,
                },
            )
            .await
        }
        ClientEvent::QuestionAnswered {
            question_id,
            answered,
        } => {
            let transport_id = transport_of(binding)?;
            route(
                binding,
                RoomCommand::SetAnswered {
                    transport_id,
                    question_id,
                    answered,
                },
            )
            .await
        }
        ClientEvent::QuestionSpam { question_id } => {
            let transport_id = transport_of(binding)?;
            route(
                binding,
                RoomCommand::RemoveSpam {
                    transport_id,
                    question_id,
                },
            )
            .await
        }
        ClientEvent::LeaveSession { viewer_transport_id } => {
            if let Some(bound) = binding.take() {
                let _ = bound
                    .room
                    .send(RoomCommand::Leave {
                        transport_id: viewer_transport_id,
                    })
                    .await;
            }
            Ok(())
        }
        ClientEvent::EndSession { session_id } => {
            if let Some(room) = registry.lookup(&session_id).await {
                let _ = room.send(RoomCommand::End).await;
            } else if registry.store().get(&session_id).await?.is_some() {
                // Session was created but its room never woke up.
                registry.store().delete(&session_id).await?;
            }
            // Ending an unknown or already-ended session is a no-op.
            Ok(())
        }
    }
}
