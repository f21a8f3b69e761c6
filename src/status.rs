//! `status` report
//!
//! Snapshot of the adapter for the control plane; field names are part of
//! the RPC contract.

use serde::Serialize;

use crate::relay::PeerRelay;
use crate::PlayerId;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Status {
    pub version: String,
    pub options: OptionsStatus,
    pub gpgnet: GpgNetStatus,
    pub relays: Vec<RelayStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OptionsStatus {
    pub player_id: PlayerId,
    pub player_login: String,
    pub rpc_port: u16,
    pub gpgnet_port: u16,
    pub lobby_port: u16,
    pub log_file: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GpgNetStatus {
    pub local_port: u16,
    pub connected: bool,
    pub game_state: String,
    pub task_string: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayStatus {
    pub remote_player_id: PlayerId,
    pub remote_player_login: String,
    pub local_game_udp_port: Option<u16>,
    pub ice_agent: IceAgentStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IceAgentStatus {
    pub state: String,
    pub datachannel_open: bool,
    pub loc_cand_addr: String,
    pub loc_cand_type: String,
    pub rem_cand_addr: String,
    pub rem_cand_type: String,
    /// Seconds from relay creation to first connection, -1 if never
    pub time_to_connected: f64,
}

impl From<&PeerRelay> for RelayStatus {
    fn from(relay: &PeerRelay) -> Self {
        let pair = relay.candidates().cloned().unwrap_or_default();
        Self {
            remote_player_id: relay.remote_id(),
            remote_player_login: relay.remote_login().to_string(),
            local_game_udp_port: relay.local_port(),
            ice_agent: IceAgentStatus {
                state: relay.state().to_string(),
                datachannel_open: relay.is_data_channel_open(),
                loc_cand_addr: pair.local_addr,
                loc_cand_type: pair.local_type,
                rem_cand_addr: pair.remote_addr,
                rem_cand_type: pair.remote_type,
                time_to_connected: relay
                    .connect_latency()
                    .map_or(-1.0, |d| d.as_secs_f64()),
            },
        }
    }
}
