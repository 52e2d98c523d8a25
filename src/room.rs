//! Per-session room actors. Every mutation and relay operation for a session
//! goes through that session's inbox, so concurrent commands are applied one
//! at a time and the wholesale record replace in the store can never lose an
//! update. Rooms for different sessions run fully in parallel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep_until, Instant};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use crate::error::BrokerError;
use crate::protocol::ServerEvent;
use crate::relay::{self, RelayEngine};
use crate::store::{ChatEntry, Question, SessionRecord, SessionStore, UserRecord};

/// Per-connection sender for room-to-participant events.
pub type Outbox = mpsc::Sender<ServerEvent>;

pub enum RoomCommand {
    BindHost {
        transport_id: String,
        outbox: Outbox,
    },
    Join {
        transport_id: String,
        display_name: String,
        outbox: Outbox,
    },
    Leave {
        transport_id: String,
    },
    HostOffer {
        transport_id: String,
        sdp: RTCSessionDescription,
    },
    ViewerOffer {
        transport_id: String,
        sdp: RTCSessionDescription,
    },
    IceCandidate {
        transport_id: String,
        candidate: RTCIceCandidateInit,
    },
    /// Pushed by the host endpoint's track callback, never by a client.
    HostTrack {
        track: Arc<TrackLocalStaticRTP>,
    },
    Chat {
        transport_id: String,
        author: String,
        message: String,
    },
    AddQuestion {
        transport_id: String,
        creator: String,
        title: String,
        tags: Vec<String>,
    },
    Upvote {
        transport_id: String,
        question_id: String,
        voter: String,
    },
    SetAnswered {
        transport_id: String,
        question_id: String,
        answered: bool,
    },
    RemoveSpam {
        transport_id: String,
        question_id: String,
    },
    Disconnect {
        transport_id: String,
    },
    End,
}

#[derive(Clone)]
pub struct RoomHandle {
    session_id: String,
    tx: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    /// A closed inbox means the room already ended; surface that as a
    /// missing session so the caller can tell the client.
    pub async fn send(&self, cmd: RoomCommand) -> Result<(), BrokerError> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| BrokerError::SessionNotFound(self.session_id.clone()))
    }
}

/// Session id to live room mapping. Rooms are spawned lazily on first
/// participant activity, backed by the persisted record.
pub struct Registry {
    rooms: Mutex<HashMap<String, RoomHandle>>,
    store: Arc<dyn SessionStore>,
    engine: Arc<RelayEngine>,
    host_grace: Duration,
}

impl Registry {
    pub fn new(
        store: Arc<dyn SessionStore>,
        engine: Arc<RelayEngine>,
        host_grace: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            rooms: Mutex::new(HashMap::new()),
            store,
            engine,
            host_grace,
        })
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub async fn lookup(&self, session_id: &str) -> Option<RoomHandle> {
        self.rooms.lock().await.get(session_id).cloned()
    }

    pub async fn get_or_spawn(self: &Arc<Self>, session_id: &str) -> Result<RoomHandle, BrokerError> {
        let mut rooms = self.rooms.lock().await;
        if let Some(handle) = rooms.get(session_id) {
            return Ok(handle.clone());
        }

        let record = self
            .store
            .get(session_id)
            .await?
            .ok_or_else(|| BrokerError::SessionNotFound(session_id.to_string()))?;

        let (tx, rx) = mpsc::channel(256);
        let handle = RoomHandle {
            session_id: session_id.to_string(),
            tx,
        };
        rooms.insert(session_id.to_string(), handle.clone());

        let room = Room {
            record,
            members: HashMap::new(),
            relay: RelayState::default(),
            store: Arc::clone(&self.store),
            engine: Arc::clone(&self.engine),
            registry: Arc::clone(self),
            handle: handle.clone(),
            host_grace: self.host_grace,
            host_deadline: None,
        };
        tokio::spawn(room.run(rx));

        Ok(handle)
    }

    async fn remove(&self, session_id: &str) {
        self.rooms.lock().await.remove(session_id);
    }
}

#[derive(Default)]
struct RelayState {
    host_pc: Option<Arc<RTCPeerConnection>>,
    host_tracks: Vec<Arc<TrackLocalStaticRTP>>,
    viewer_pcs: HashMap<String, Arc<RTCPeerConnection>>,
}

struct Room {
    record: SessionRecord,
    members: HashMap<String, Outbox>,
    relay: RelayState,
    store: Arc<dyn SessionStore>,
    engine: Arc<RelayEngine>,
    registry: Arc<Registry>,
    handle: RoomHandle,
    host_grace: Duration,
    host_deadline: Option<Instant>,
}

impl Room {
    async fn run(mut self, mut rx: mpsc::Receiver<RoomCommand>) {
        log::info!("session {}: room started", self.record.id);
        loop {
            let cmd = if let Some(deadline) = self.host_deadline {
                tokio::select! {
                    cmd = rx.recv() => cmd,
                    _ = sleep_until(deadline) => {
                        log::info!(
                            "session {}: host grace period expired, ending",
                            self.record.id
                        );
                        None
                    }
                }
            } else {
                rx.recv().await
            };

            match cmd {
                Some(RoomCommand::End) | None => {
                    // Refuse new commands before tearing down, so anyone who
                    // sees the end broadcast gets an error on a stale handle
                    // instead of a silently discarded send.
                    rx.close();
                    self.end().await;
                    return;
                }
                Some(cmd) => self.dispatch(cmd).await,
            }
        }
    }

    async fn dispatch(&mut self, cmd: RoomCommand) {
        match cmd {
            RoomCommand::BindHost { transport_id, outbox } => {
                self.bind_host(transport_id, outbox).await;
            }
            RoomCommand::Join {
                transport_id,
                display_name,
                outbox,
            } => self.join(transport_id, display_name, outbox).await,
            RoomCommand::Leave { transport_id } => self.leave(&transport_id).await,
            RoomCommand::HostOffer { transport_id, sdp } => {
                if let Err(e) = self.host_offer(&transport_id, sdp).await {
                    self.report(&transport_id, &e).await;
                }
            }
            RoomCommand::ViewerOffer { transport_id, sdp } => {
                if let Err(e) = self.viewer_offer(&transport_id, sdp).await {
                    self.report(&transport_id, &e).await;
                }
            }
            RoomCommand::IceCandidate {
                transport_id,
                candidate,
            } => {
                if let Err(e) = self.apply_ice(&transport_id, candidate).await {
                    // Bad or late ICE is dropped, never propagated to the remote party.
                    self.report(&transport_id, &e).await;
                }
            }
            RoomCommand::HostTrack { track } => {
                log::info!("session {}: host track captured", self.record.id);
                self.relay.host_tracks.push(track);
            }
            RoomCommand::Chat {
                transport_id,
                author,
                message,
            } => {
                self.record.chats.push(ChatEntry {
                    user_name: author,
                    message,
                });
                self.persist(&transport_id).await;
                self.broadcast(ServerEvent::ChatUpdate {
                    chats: self.record.chats.clone(),
                });
            }
            RoomCommand::AddQuestion {
                transport_id,
                creator,
                title,
                tags,
            } => {
                self.record.questions.push(Question::new(title, creator, tags));
                self.persist(&transport_id).await;
                self.broadcast_questions();
            }
            RoomCommand::Upvote {
                transport_id,
                question_id,
                voter,
            } => {
                if let Err(e) = self.upvote(&transport_id, &question_id, voter).await {
                    self.report(&transport_id, &e).await;
                }
            }
            RoomCommand::SetAnswered {
                transport_id,
                question_id,
                answered,
            } => {
                let res = self.set_answered(&transport_id, &question_id, answered).await;
                if let Err(e) = res {
                    self.report(&transport_id, &e).await;
                }
            }
            RoomCommand::RemoveSpam {
                transport_id,
                question_id,
            } => {
                if let Err(e) = self.remove_spam(&transport_id, &question_id).await {
                    self.report(&transport_id, &e).await;
                }
            }
            RoomCommand::Disconnect { transport_id } => self.disconnect(&transport_id).await,
            RoomCommand::End => unreachable!("handled in run"),
        }
    }

    async fn bind_host(&mut self, transport_id: String, outbox: Outbox) {
        self.members.insert(transport_id.clone(), outbox);
        self.record.host.transport_id = Some(transport_id.clone());
        // A rebinding host cancels any pending auto-end.
        self.host_deadline = None;
        self.persist(&transport_id).await;
        log::info!("session {}: host bound as {}", self.record.id, transport_id);
    }

    async fn join(&mut self, transport_id: String, display_name: String, outbox: Outbox) {
        self.members.insert(transport_id.clone(), outbox);
        // Display name is the dedup key: rejoining under the same name reuses
        // the logical viewer slot with a fresh transport identity.
        match self
            .record
            .users
            .iter_mut()
            .find(|u| u.name == display_name)
        {
            Some(user) => user.transport_id = transport_id.clone(),
            None => self.record.users.push(UserRecord {
                transport_id: transport_id.clone(),
                name: display_name,
            }),
        }
        self.persist(&transport_id).await;
        self.broadcast(ServerEvent::UserJoinedSession {
            users: self.record.users.clone(),
        });
    }

    async fn leave(&mut self, transport_id: &str) {
        let viewer_pc = self.relay.viewer_pcs.remove(transport_id);
        if let Some(pc) = viewer_pc {
            relay::close_endpoint(pc);
        }
        self.members.remove(transport_id);

        let Some(pos) = self
            .record
            .users
            .iter()
            .position(|u| u.transport_id == transport_id)
        else {
            // Duplicate leave/disconnect signals are idempotent.
            return;
        };
        self.record.users.remove(pos);
        self.persist(transport_id).await;
        self.broadcast(ServerEvent::UserLeftSession {
            users: self.record.users.clone(),
        });
    }

    async fn disconnect(&mut self, transport_id: &str) {
        if self.record.host.transport_id.as_deref() == Some(transport_id) {
            self.host_disconnected(transport_id).await;
        } else {
            self.leave(transport_id).await;
        }
    }

    /// Host loss is recoverable: viewers and shared state stay, endpoints go.
    /// Every viewer endpoint is cascade-closed because its media source is gone.
    async fn host_disconnected(&mut self, transport_id: &str) {
        log::info!("session {}: host disconnected", self.record.id);
        self.members.remove(transport_id);
        self.record.host.transport_id = None;
        self.persist(transport_id).await;

        if let Some(pc) = self.relay.host_pc.take() {
            relay::close_endpoint(pc);
        }
        self.relay.host_tracks.clear();
        for (_, pc) in self.relay.viewer_pcs.drain() {
            relay::close_endpoint(pc);
        }

        if !self.host_grace.is_zero() {
            self.host_deadline = Some(Instant::now() + self.host_grace);
        }
    }

    async fn host_offer(
        &mut self,
        transport_id: &str,
        sdp: RTCSessionDescription,
    ) -> Result<(), BrokerError> {
        let outbox = self
            .members
            .get(transport_id)
            .cloned()
            .ok_or(BrokerError::NotJoined)?;

        // A re-offer replaces the previous host endpoint and its track set.
        if let Some(old) = self.relay.host_pc.take() {
            relay::close_endpoint(old);
        }
        self.relay.host_tracks.clear();

        let (pc, answer) = relay::host_endpoint(
            &self.engine,
            self.handle.tx.clone(),
            outbox.clone(),
            sdp,
        )
        .await?;
        self.relay.host_pc = Some(pc);

        let _ = outbox.try_send(ServerEvent::HostAnswer { sdp: answer });
        Ok(())
    }

    async fn viewer_offer(
        &mut self,
        transport_id: &str,
        sdp: RTCSessionDescription,
    ) -> Result<(), BrokerError> {
        if self.relay.host_tracks.is_empty() {
            return Err(BrokerError::MediaNotReady);
        }
        let outbox = self
            .members
            .get(transport_id)
            .cloned()
            .ok_or(BrokerError::NotJoined)?;

        let (pc, answer) = relay::viewer_endpoint(
            &self.engine,
            &self.relay.host_tracks,
            outbox.clone(),
            sdp,
        )
        .await?;
        if let Some(old) = self.relay.viewer_pcs.insert(transport_id.to_string(), pc) {
            relay::close_endpoint(old);
        }

        let _ = outbox.try_send(ServerEvent::UserAnswer { sdp: answer });
        Ok(())
    }

    async fn apply_ice(
        &mut self,
        transport_id: &str,
        candidate: RTCIceCandidateInit,
    ) -> Result<(), BrokerError> {
        let pc = if self.record.host.transport_id.as_deref() == Some(transport_id) {
            self.relay.host_pc.as_ref()
        } else {
            self.relay.viewer_pcs.get(transport_id)
        };
        let pc = pc.ok_or_else(|| BrokerError::PeerEndpointNotFound(transport_id.to_string()))?;
        pc.add_ice_candidate(candidate).await?;
        Ok(())
    }

    async fn upvote(
        &mut self,
        transport_id: &str,
        question_id: &str,
        voter: String,
    ) -> Result<(), BrokerError> {
        let question = self
            .record
            .questions
            .iter_mut()
            .find(|q| q.id == question_id)
            .ok_or_else(|| BrokerError::QuestionNotFound(question_id.to_string()))?;

        // Duplicate votes are a silent no-op, not an error.
        if question.upvotes.users.contains(&voter) {
            return Ok(());
        }
        question.upvotes.users.push(voter);
        question.upvotes.count += 1;

        self.persist(transport_id).await;
        self.broadcast_questions();
        Ok(())
    }

    async fn set_answered(
        &mut self,
        transport_id: &str,
        question_id: &str,
        answered: bool,
    ) -> Result<(), BrokerError> {
        let question = self
            .record
            .questions
            .iter_mut()
            .find(|q| q.id == question_id)
            .ok_or_else(|| BrokerError::QuestionNotFound(question_id.to_string()))?;
        question.is_answered = answered;

        self.persist(transport_id).await;
        self.broadcast_questions();
        Ok(())
    }

    async fn remove_spam(
        &mut self,
        transport_id: &str,
        question_id: &str,
    ) -> Result<(), BrokerError> {
        let pos = self
            .record
            .questions
            .iter()
            .position(|q| q.id == question_id)
            .ok_or_else(|| BrokerError::QuestionNotFound(question_id.to_string()))?;
        self.record.questions.remove(pos);

        self.persist(transport_id).await;
        self.broadcast_questions();
        Ok(())
    }

    async fn end(&mut self) {
        log::info!("session {}: ending", self.record.id);
        if let Some(pc) = self.relay.host_pc.take() {
            relay::close_endpoint(pc);
        }
        for (_, pc) in self.relay.viewer_pcs.drain() {
            relay::close_endpoint(pc);
        }
        self.relay.host_tracks.clear();

        if let Err(e) = self.store.delete(&self.record.id).await {
            log::warn!("session {}: record delete failed: {e}", self.record.id);
        }
        self.registry.remove(&self.record.id).await;

        // Members learn of the end only after the session id is dead, so a
        // rejoin attempt observes SessionNotFound rather than a stale room.
        self.broadcast(ServerEvent::SessionEnded);
        self.members.clear();
    }

    /// Save the record after a mutation. The mutation stays applied in memory
    /// on store failure; the initiator is told and the room keeps running.
    async fn persist(&self, transport_id: &str) {
        if let Err(e) = self.store.update(self.record.clone()).await {
            log::error!("session {}: save failed: {e}", self.record.id);
            self.report(transport_id, &e).await;
        }
    }

    fn broadcast_questions(&self) {
        self.broadcast(ServerEvent::QuestionUpdate {
            questions: self.record.questions.clone(),
        });
    }

    /// Fan an event out to every member. Uses try_send so one slow connection
    /// can never wedge the room; a full outbox drops the event for that member.
    fn broadcast(&self, event: ServerEvent) {
        for (transport_id, outbox) in &self.members {
            if outbox.try_send(event.clone()).is_err() {
                log::warn!(
                    "session {}: dropped event for slow member {}",
                    self.record.id,
                    transport_id
                );
            }
        }
    }

    async fn report(&self, transport_id: &str, err: &BrokerError) {
        log::warn!("session {}: {err}", self.record.id);
        if let Some(outbox) = self.members.get(transport_id) {
            let _ = outbox.try_send(ServerEvent::Error {
                message: err.to_string(),
            });
        }
    }
}
