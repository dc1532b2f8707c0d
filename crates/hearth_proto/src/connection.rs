//! Connection-type selection, supplemented from `cras_client.h`'s
//! `CRAS_CONNECTION_TYPE`: the distilled external-interfaces section says
//! only that there is "one path per connection type"; this enumerates the
//! three kinds and the socket filename each resolves to.

/// Which control socket a client dials. `Control` carries administrative
/// and routing-observer traffic; `Playback` and `Capture`-equivalent
/// traffic share `Unified` in practice, which is why most applications use
/// `Unified` and `Control` is reserved for system services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    Control,
    Playback,
    Unified,
}

impl ConnectionType {
    /// Socket filename within the configured socket directory.
    pub fn socket_name(&self) -> &'static str {
        match self {
            ConnectionType::Control => "control",
            ConnectionType::Playback => "playback",
            ConnectionType::Unified => "unified",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_kind_has_a_distinct_socket_name() {
        let names = [
            ConnectionType::Control.socket_name(),
            ConnectionType::Playback.socket_name(),
            ConnectionType::Unified.socket_name(),
        ];
        assert_eq!(names.len(), 3);
        assert_ne!(names[0], names[1]);
        assert_ne!(names[1], names[2]);
    }
}
