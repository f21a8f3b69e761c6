//! Game tasks
//!
//! Commands for the game that have to wait until it is ready for them.

use std::fmt;

use crate::gpgnet::{Chunk, GpgNetMessage};
use crate::PlayerId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    HostGame {
        map: String,
    },
    JoinGame {
        remote_login: String,
        remote_id: PlayerId,
    },
    ConnectToPeer {
        remote_login: String,
        remote_id: PlayerId,
    },
    DisconnectFromPeer {
        remote_id: PlayerId,
    },
}

impl Task {
    /// GPGNet header of the message this task becomes
    pub fn header(&self) -> &'static str {
        match self {
            Task::HostGame { .. } => "HostGame",
            Task::JoinGame { .. } => "JoinGame",
            Task::ConnectToPeer { .. } => "ConnectToPeer",
            Task::DisconnectFromPeer { .. } => "DisconnectFromPeer",
        }
    }

    /// Message for a peer task whose relay listens on `local_port`
    pub(crate) fn peer_message(
        &self,
        remote_login: &str,
        remote_id: PlayerId,
        local_port: u16,
    ) -> GpgNetMessage {
        GpgNetMessage::new(
            self.header(),
            vec![
                Chunk::from(format!("127.0.0.1:{}", local_port)),
                Chunk::from(remote_login),
                Chunk::from(remote_id),
            ],
        )
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::HostGame { map } => write!(f, "HostGame({})", map),
            Task::JoinGame {
                remote_login,
                remote_id,
            }
            | Task::ConnectToPeer {
                remote_login,
                remote_id,
            } => write!(f, "{}({}, {})", self.header(), remote_login, remote_id),
            Task::DisconnectFromPeer { remote_id } => {
                write!(f, "DisconnectFromPeer({})", remote_id)
            }
        }
    }
}
