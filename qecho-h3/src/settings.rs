//! HTTP/3 SETTINGS identifiers and the values this server advertises.

/// SETTINGS_QPACK_MAX_TABLE_CAPACITY (RFC 9204 Section 5).
pub const SETTINGS_QPACK_MAX_TABLE_CAPACITY: u64 = 0x01;
/// SETTINGS_MAX_FIELD_SECTION_SIZE (RFC 9114 Section 7.2.4.1).
pub const SETTINGS_MAX_FIELD_SECTION_SIZE: u64 = 0x06;
/// SETTINGS_QPACK_BLOCKED_STREAMS (RFC 9204 Section 5).
pub const SETTINGS_QPACK_BLOCKED_STREAMS: u64 = 0x07;
/// SETTINGS_ENABLE_CONNECT_PROTOCOL (RFC 9220 Section 3 / RFC 8441).
pub const SETTINGS_ENABLE_CONNECT_PROTOCOL: u64 = 0x08;
/// SETTINGS_H3_DATAGRAM (RFC 9297 Section 2.1.1).
pub const SETTINGS_H3_DATAGRAM: u64 = 0x33;
/// SETTINGS_WEBTRANSPORT_MAX_SESSIONS (draft-ietf-webtrans-http3-02).
pub const SETTINGS_WT_MAX_SESSIONS: u64 = 0x14e9cd29;

/// The settings this server sends on its control stream.
#[derive(Debug, Clone)]
pub struct Settings {
    pub qpack_max_table_capacity: u64,
    pub qpack_blocked_streams: u64,
    pub enable_connect_protocol: bool,
    pub h3_datagram: bool,
    pub webtransport_max_sessions: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            qpack_max_table_capacity: 4096,
            qpack_blocked_streams: 100,
            enable_connect_protocol: true,
            h3_datagram: true,
            webtransport_max_sessions: 100,
        }
    }
}

impl Settings {
    /// The `(identifier, value)` pairs to serialize, in ascending id order.
    ///
    /// WEBTRANSPORT_MAX_SESSIONS is only advertised when Extended CONNECT
    /// and H3 datagrams are both on; a WebTransport session needs both.
    pub fn to_pairs(&self) -> Vec<(u64, u64)> {
        let mut pairs = vec![
            (
                SETTINGS_QPACK_MAX_TABLE_CAPACITY,
                self.qpack_max_table_capacity,
            ),
            (SETTINGS_QPACK_BLOCKED_STREAMS, self.qpack_blocked_streams),
        ];
        if self.enable_connect_protocol {
            pairs.push((SETTINGS_ENABLE_CONNECT_PROTOCOL, 1));
        }
        if self.h3_datagram {
            pairs.push((SETTINGS_H3_DATAGRAM, 1));
        }
        if self.enable_connect_protocol && self.h3_datagram && self.webtransport_max_sessions > 0 {
            pairs.push((SETTINGS_WT_MAX_SESSIONS, self.webtransport_max_sessions));
        }
        pairs
    }
}

/// Settings received from the peer. Unknown identifiers are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerSettings {
    pub qpack_max_table_capacity: u64,
    pub qpack_blocked_streams: u64,
    pub max_field_section_size: Option<u64>,
    pub enable_connect_protocol: bool,
    pub h3_datagram: bool,
    pub webtransport_max_sessions: Option<u64>,
}

impl PeerSettings {
    pub fn from_pairs(pairs: &[(u64, u64)]) -> Self {
        let mut settings = Self::default();
        for &(id, value) in pairs {
            match id {
                SETTINGS_QPACK_MAX_TABLE_CAPACITY => settings.qpack_max_table_capacity = value,
                SETTINGS_QPACK_BLOCKED_STREAMS => settings.qpack_blocked_streams = value,
                SETTINGS_MAX_FIELD_SECTION_SIZE => {
                    settings.max_field_section_size = Some(value)
                }
                SETTINGS_ENABLE_CONNECT_PROTOCOL => {
                    settings.enable_connect_protocol = value != 0
                }
                SETTINGS_H3_DATAGRAM => settings.h3_datagram = value != 0,
                SETTINGS_WT_MAX_SESSIONS => settings.webtransport_max_sessions = Some(value),
                _ => {}
            }
        }
        settings
    }

    /// Whether the peer negotiated what a WebTransport session requires.
    pub fn supports_webtransport(&self) -> bool {
        self.enable_connect_protocol && self.h3_datagram
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_advertise_webtransport() {
        let pairs = Settings::default().to_pairs();
        assert!(pairs.contains(&(SETTINGS_QPACK_MAX_TABLE_CAPACITY, 4096)));
        assert!(pairs.contains(&(SETTINGS_QPACK_BLOCKED_STREAMS, 100)));
        assert!(pairs.contains(&(SETTINGS_ENABLE_CONNECT_PROTOCOL, 1)));
        assert!(pairs.contains(&(SETTINGS_H3_DATAGRAM, 1)));
        assert!(pairs.contains(&(SETTINGS_WT_MAX_SESSIONS, 100)));
    }

    #[test]
    fn wt_sessions_needs_both_prerequisites() {
        let settings = Settings {
            h3_datagram: false,
            ..Default::default()
        };
        let pairs = settings.to_pairs();
        assert!(!pairs.iter().any(|&(id, _)| id == SETTINGS_WT_MAX_SESSIONS));
    }

    #[test]
    fn peer_settings_ignore_unknown_ids() {
        let peer = PeerSettings::from_pairs(&[
            (0x21, 7),  // grease
            (SETTINGS_H3_DATAGRAM, 1),
            (SETTINGS_ENABLE_CONNECT_PROTOCOL, 1),
        ]);
        assert!(peer.h3_datagram);
        assert!(peer.enable_connect_protocol);
        assert!(peer.supports_webtransport());
    }
}
