//! Session descriptions for N audio channels: one `m=audio` section per channel, plus
//! Opus `fmtp` munging. Parsing and rendering go through the `sdp` crate.

use std::collections::BTreeMap;
use std::io::Cursor;

use ::sdp::description::common::Attribute;
use ::sdp::{MediaDescription, SessionDescription};

pub use ::sdp::direction::Direction;

use crate::CommsError;
use crate::config::CodecTuning;

const OPUS_PAYLOAD_TYPE: u8 = 111;
const OPUS_DEFAULT_FMTP: &str = "minptime=10;useinbandfec=1";

/// One audio media section as far as channel mapping is concerned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaSection {
    /// Media identifier from `a=mid`, or the section index when absent.
    pub mid: String,
    /// Declared direction. Sections without one are send-receive.
    pub direction: Direction,
    /// Application track label from `a=msid:<stream> <label>`; absent on receive-only sections.
    pub track_label: Option<String>,
}

impl MediaSection {
    /// Describe one section.
    pub fn new(mid: impl Into<String>, direction: Direction, track_label: Option<String>) -> Self {
        Self {
            mid: mid.into(),
            direction,
            track_label,
        }
    }
}

impl From<::sdp::Error> for CommsError {
    fn from(err: ::sdp::Error) -> Self {
        CommsError::Sdp(err.to_string())
    }
}

fn unmarshal(text: &str) -> Result<SessionDescription, CommsError> {
    Ok(SessionDescription::unmarshal(&mut Cursor::new(text.as_bytes()))?)
}

/// Render a session description carrying `sections` under one media stream.
pub fn build_description(session_id: u64, stream_id: &str, sections: &[MediaSection]) -> String {
    let mut description = SessionDescription::new_jsep_session_description(false);
    description.origin.session_id = session_id;
    description.origin.session_version = 2;
    description.origin.unicast_address = "127.0.0.1".to_owned();
    if !sections.is_empty() {
        let mids: Vec<&str> = sections.iter().map(|s| s.mid.as_str()).collect();
        description = description.with_value_attribute("group".to_owned(), format!("BUNDLE {}", mids.join(" ")));
    }
    description = description.with_value_attribute("msid-semantic".to_owned(), format!(" WMS {stream_id}"));

    for section in sections {
        let mut media = MediaDescription::new_jsep_media_description("audio".to_owned(), vec![])
            .with_value_attribute("mid".to_owned(), section.mid.clone())
            .with_property_attribute(section.direction.to_string());
        if let Some(label) = &section.track_label {
            media = media.with_value_attribute("msid".to_owned(), format!("{stream_id} {label}"));
        }
        media = media.with_property_attribute("rtcp-mux".to_owned()).with_codec(
            OPUS_PAYLOAD_TYPE,
            "opus".to_owned(),
            48_000,
            2,
            OPUS_DEFAULT_FMTP.to_owned(),
        );
        description = description.with_media(media);
    }
    description.marshal()
}

fn section_direction(media: &MediaDescription) -> Direction {
    media
        .attributes
        .iter()
        .filter(|attribute| attribute.value.is_none())
        .map(|attribute| Direction::new(&attribute.key))
        .find(|direction| *direction != Direction::Unspecified)
        .unwrap_or(Direction::SendRecv)
}

/// Extract the audio media sections of `sdp` in order.
pub fn parse_media_sections(sdp: &str) -> Result<Vec<MediaSection>, CommsError> {
    let description = unmarshal(sdp)?;
    description
        .media_descriptions
        .iter()
        .enumerate()
        .filter(|(_, media)| media.media_name.media == "audio")
        .map(|(index, media)| {
            let mid = media
                .attribute("mid")
                .flatten()
                .map_or_else(|| index.to_string(), str::to_owned);
            let track_label = match media.attribute("msid").flatten() {
                Some(msid) => Some(
                    msid.split_whitespace()
                        .nth(1)
                        .ok_or_else(|| CommsError::Sdp(format!("malformed msid attribute '{msid}'")))?
                        .to_owned(),
                ),
                None => None,
            };
            Ok(MediaSection::new(mid, section_direction(media), track_label))
        })
        .collect()
}

/// Payload types mapped to Opus by `a=rtpmap` in `media`.
fn opus_payload_types(media: &MediaDescription) -> Vec<String> {
    media
        .attributes
        .iter()
        .filter(|attribute| attribute.key == "rtpmap")
        .filter_map(|attribute| {
            let (payload, codec) = attribute.value.as_deref()?.split_once(' ')?;
            codec
                .to_ascii_lowercase()
                .starts_with("opus/")
                .then(|| payload.to_owned())
        })
        .collect()
}

fn parse_fmtp_parameters(parameters: &str) -> BTreeMap<String, String> {
    parameters
        .split(';')
        .filter_map(|pair| {
            let pair = pair.trim();
            if pair.is_empty() {
                return None;
            }
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            Some((key.trim().to_owned(), value.trim().to_owned()))
        })
        .collect()
}

fn join_fmtp_parameters(parameters: &BTreeMap<String, String>) -> String {
    parameters
        .iter()
        .map(|(key, value)| {
            if value.is_empty() {
                key.clone()
            } else {
                format!("{key}={value}")
            }
        })
        .collect::<Vec<_>>()
        .join(";")
}

/// Opus `fmtp` attributes of `media` as `(attribute, payload, parameters)`.
fn opus_fmtp<'a>(
    media: &'a mut MediaDescription,
) -> impl Iterator<Item = (&'a mut Attribute, String, BTreeMap<String, String>)> + 'a {
    let payloads = opus_payload_types(media);
    media
        .attributes
        .iter_mut()
        .filter(|attribute| attribute.key == "fmtp")
        .filter_map(move |attribute| {
            let value = attribute.value.as_deref()?;
            let (payload, parameters) = value.split_once(' ').unwrap_or((value, ""));
            if !payloads.iter().any(|p| p == payload) {
                return None;
            }
            let payload = payload.to_owned();
            let parameters = parse_fmtp_parameters(parameters);
            Some((attribute, payload, parameters))
        })
}

fn flag(value: bool) -> String {
    String::from(if value { "1" } else { "0" })
}

/// Rewrite every Opus `a=fmtp` attribute to request the parameters in `tuning`. Existing
/// parameters not named by `tuning` are kept; applying the same tuning twice is a no-op.
pub fn tune_opus(sdp: &str, tuning: &CodecTuning) -> Result<String, CommsError> {
    let mut description = unmarshal(sdp)?;
    for media in description.media_descriptions.iter_mut() {
        for (attribute, payload, mut parameters) in opus_fmtp(media) {
            parameters.insert("usedtx".into(), flag(tuning.dtx));
            parameters.insert(
                "maxaveragebitrate".into(),
                tuning.max_average_bitrate.to_string(),
            );
            parameters.insert("stereo".into(), flag(tuning.stereo));
            parameters.insert("useinbandfec".into(), flag(tuning.inband_fec));
            attribute.value = Some(format!("{payload} {}", join_fmtp_parameters(&parameters)));
        }
    }
    Ok(description.marshal())
}

/// Opus `fmtp` parameters of every Opus payload type, in section order.
pub fn opus_parameters(sdp: &str) -> Result<Vec<BTreeMap<String, String>>, CommsError> {
    let mut description = unmarshal(sdp)?;
    Ok(description
        .media_descriptions
        .iter_mut()
        .flat_map(|media| {
            opus_fmtp(media)
                .map(|(_, _, parameters)| parameters)
                .collect::<Vec<_>>()
        })
        .collect())
}
