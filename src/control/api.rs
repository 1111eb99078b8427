use serde::Serialize;

use crate::capture::CaptureState;
use crate::station::Station;
use crate::CommsError;

/// One row of the channel table.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChannelRow {
    /// Channel index.
    pub channel: usize,
    /// Inbound squelch gain is open.
    pub monitoring: bool,
    /// Outbound mute gain is open.
    pub transmitting: bool,
    /// Energy detected on the inbound track.
    pub receiving: bool,
    /// Energy detected on the outbound track.
    pub sending: bool,
    /// Listener-relative position once the inbound track has arrived.
    pub position: Option<[f32; 3]>,
}

/// Point-in-time view of a station.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StationStatus {
    /// Station name.
    pub name: String,
    /// Transport connection state.
    pub connection: String,
    /// Offer/answer negotiation state.
    pub negotiation: String,
    /// Microphone acquisition state.
    pub capture: String,
    /// Speech detected on the local microphone.
    pub speaking: bool,
    /// Audio clock of the station in milliseconds.
    pub elapsed_ms: u64,
    /// Audio contexts currently open in the station's pool.
    pub open_contexts: usize,
    /// One row per channel, in channel order.
    pub channels: Vec<ChannelRow>,
}

impl StationStatus {
    /// Pretty-printed JSON for scripting.
    pub fn to_json(&self) -> Result<String, CommsError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn describe_capture(state: &CaptureState) -> String {
    match state {
        CaptureState::Pending => "waiting for gesture".to_string(),
        CaptureState::Ready(track) => format!("ready ({})", track.label()),
        CaptureState::Unavailable(reason) => format!("unavailable: {reason}"),
    }
}

/// Build a status snapshot of `station`.
pub fn station_status(station: &Station) -> StationStatus {
    let peer = station.peer();
    let channels = station
        .snapshot()
        .into_iter()
        .map(|(channel, status)| ChannelRow {
            channel,
            monitoring: status.monitoring,
            transmitting: status.transmitting,
            receiving: status.receiving,
            sending: station.tx_activity().get(&channel).copied().unwrap_or(false),
            position: peer.inbound().get(&channel).map(|inbound| inbound.position().position),
        })
        .collect();

    StationStatus {
        name: station.name().to_string(),
        connection: station.connection_state().to_string(),
        negotiation: station.negotiation_state().to_string(),
        capture: describe_capture(station.capture_state()),
        speaking: station.is_speaking(),
        elapsed_ms: station.elapsed().as_millis() as u64,
        open_contexts: peer.pool().open_count(),
        channels,
    }
}

/// Flip monitoring on `channel` and return the new state.
pub fn toggle_monitoring(station: &mut Station, channel: usize) -> Result<bool, CommsError> {
    let monitoring = !station.peer().is_monitoring(channel);
    station.set_monitoring(channel, monitoring)?;
    Ok(monitoring)
}

/// Push-to-talk toggle: keys `channel` if it is not transmitting, otherwise releases all.
pub fn toggle_transmit(station: &mut Station, channel: usize) -> Result<bool, CommsError> {
    let transmitting = station
        .peer()
        .track_controls()
        .get(&channel)
        .ok_or(CommsError::UnknownChannel(channel))?
        .is_transmitting();
    if transmitting {
        station.end_transmit();
    } else {
        station.begin_transmit(channel)?;
    }
    Ok(!transmitting)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::CommsConfig;
    use crate::station::LoopbackSession;

    #[test]
    fn status_tracks_connection_and_toggles() {
        let mut session = LoopbackSession::new(&CommsConfig::default().with_stream_count(2));
        let before = station_status(&session.participant);
        assert_eq!(before.connection, "new");
        assert_eq!(before.capture, "waiting for gesture");
        assert!(before.channels.iter().all(|row| row.position.is_none()));

        assert!(session.connect(Duration::from_millis(100)).unwrap());
        let status = station_status(&session.participant);
        assert_eq!(status.connection, "connected");
        assert_eq!(status.negotiation, "connected");
        assert_eq!(status.channels.len(), 2);
        assert!(status.channels.iter().all(|row| row.position.is_some() && row.monitoring));
        assert_eq!(status.open_contexts, 3);
        assert!(!status.speaking);

        session.participant_mic.set_tone(48_000, 500.0, 0.3);
        session.advance(Duration::from_millis(50)).unwrap();
        assert!(station_status(&session.participant).speaking);
        session.participant_mic.silence();

        assert!(!toggle_monitoring(&mut session.participant, 1).unwrap());
        assert!(toggle_transmit(&mut session.participant, 0).unwrap());
        assert!(!toggle_transmit(&mut session.participant, 0).unwrap());
        assert!(matches!(
            toggle_transmit(&mut session.participant, 9),
            Err(CommsError::UnknownChannel(9))
        ));

        let json = station_status(&session.participant).to_json().unwrap();
        assert!(json.contains("\"name\": \"participant\""));
    }
}
