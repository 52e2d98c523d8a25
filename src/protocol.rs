//! Wire events on the real-time channel. Tags and field names match the
//! socket.io protocol the web clients already speak.

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::store::{ChatEntry, Question, UserRecord};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    CreateSession {
        session_id: Option<String>,
        name: String,
        host_name: String,
    },
    FetchSession {
        session_id: String,
    },
    HostJoinSession {
        session_id: String,
        host_transport_id: String,
    },
    HostOffer {
        sdp: RTCSessionDescription,
        host_transport_id: String,
    },
    HostIceCandidate {
        candidate: RTCIceCandidateInit,
    },
    JoinSession {
        session_id: String,
        viewer_transport_id: String,
        display_name: String,
    },
    UserOffer {
        sdp: RTCSessionDescription,
        viewer_transport_id: String,
    },
    UserIceCandidate {
        candidate: RTCIceCandidateInit,
    },
    ChatMessage {
        author_name: String,
        message: String,
    },
    Question {
        creator_name: String,
        title: String,
        #[serde(default)]
        tags: Vec<String>,
    },
    QuestionUpvote {
        voter_name: String,
        question_id: String,
    },
    QuestionAnswered {
        question_id: String,
        answered: bool,
    },
    QuestionSpam {
        question_id: String,
    },
    LeaveSession {
        viewer_transport_id: String,
    },
    EndSession {
        session_id: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    SessionCreated {
        session_id: String,
    },
    SessionInfo {
        id: String,
        name: String,
        host: String,
    },
    HostAnswer {
        sdp: RTCSessionDescription,
    },
    UserAnswer {
        sdp: RTCSessionDescription,
    },
    ServerIceCandidate {
        candidate: RTCIceCandidateInit,
    },
    UserJoinedSession {
        users: Vec<UserRecord>,
    },
    UserLeftSession {
        users: Vec<UserRecord>,
    },
    ChatUpdate {
        chats: Vec<ChatEntry>,
    },
    QuestionUpdate {
        questions: Vec<Question>,
    },
    SessionEnded,
    Error {
        message: String,
    },
}
