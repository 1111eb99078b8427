//! Inbound track to channel index resolution.

/// How an inbound track was mapped to a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelResolution {
    /// The track label named the channel.
    Labelled(usize),
    /// No usable label; the channel is the arrival ordinal. `reset` means the channel table
    /// was already full, so it belonged to a previous session and must be cleared first.
    Ordinal {
        /// Arrival ordinal.
        channel: usize,
        /// Clear the channel table before attaching.
        reset: bool,
    },
}

impl ChannelResolution {
    /// The resolved channel index.
    pub fn channel(self) -> usize {
        match self {
            ChannelResolution::Labelled(channel) => channel,
            ChannelResolution::Ordinal { channel, .. } => channel,
        }
    }

    /// Whether the channel table must be cleared before this track is attached.
    pub fn resets(self) -> bool {
        matches!(self, ChannelResolution::Ordinal { reset: true, .. })
    }
}

/// Resolve the channel of a newly arrived track.
///
/// `hint` is the channel parsed from the track label, `received` the number of inbound
/// tracks already held. Hints outside `0..stream_count` are ignored.
pub fn resolve_inbound_channel(
    hint: Option<usize>,
    received: usize,
    stream_count: usize,
) -> ChannelResolution {
    match hint {
        Some(channel) if channel < stream_count => ChannelResolution::Labelled(channel),
        _ if received >= stream_count => ChannelResolution::Ordinal {
            channel: 0,
            reset: true,
        },
        _ => ChannelResolution::Ordinal {
            channel: received,
            reset: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_wins_over_arrival_order() {
        assert_eq!(
            resolve_inbound_channel(Some(3), 0, 8),
            ChannelResolution::Labelled(3)
        );
    }

    #[test]
    fn ordinal_assignment_counts_arrivals() {
        assert_eq!(resolve_inbound_channel(None, 2, 4).channel(), 2);
        assert!(!resolve_inbound_channel(None, 2, 4).resets());
    }

    #[test]
    fn full_table_means_stale_session() {
        let resolution = resolve_inbound_channel(None, 4, 4);
        assert!(resolution.resets());
        assert_eq!(resolution.channel(), 0);
    }

    #[test]
    fn out_of_range_label_falls_back() {
        assert_eq!(
            resolve_inbound_channel(Some(9), 1, 2),
            ChannelResolution::Ordinal {
                channel: 1,
                reset: false
            }
        );
    }
}
