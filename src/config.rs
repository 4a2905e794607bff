use crate::error::{Error, Result};
use crate::frame::VersionRange;

const DATAGRAM_SIZE_MAX_DEFAULT: usize = 1472;
const DATAGRAM_SIZE_MAX_MAX: usize = 65507;

const RECEIVE_ATTEMPTS_MAX_DEFAULT: usize = 10;

const LOOKUP_CAPACITY_INITIAL_DEFAULT: usize = 8;
const LOOKUP_CAPACITY_INITIAL_MAX: usize = 32768;

const CONNECTION_COUNT_MAX_DEFAULT: usize = 65535;

const ERROR_REPLY_LIMIT_DEFAULT: usize = 16;

/// What to do with a datagram addressed to a connection which does not exist, or which
/// carries the wrong remote ID.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorReplyPolicy {
    /// Drop the datagram without telling the sender.
    Silent,
    /// Answer with an error packet. Replies are queued by the receiver and sent during
    /// [`ConnectionManager::sync`](crate::ConnectionManager::sync), at most
    /// [`Config::error_reply_limit`] per call.
    Reply,
}

/// Artificial packet loss, honored in debug builds only. Release builds ignore these values.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DebugSettings {
    /// Probability in `[0, 1]` that a received datagram is discarded before classification.
    pub receive_loss: f32,
    /// Probability in `[0, 1]` that an outgoing datagram is reported as sent but never
    /// written to the socket.
    pub send_loss: f32,
}

/// Configuration for a [`ConnectionManager`](crate::ConnectionManager).
#[derive(Clone, Debug)]
pub struct Config {
    /// Size of the receive buffer. Longer datagrams are truncated by the socket.
    ///
    /// Minimum value: 6 \
    /// Maximum value: 65,507 \
    /// Default value: 1,472
    pub datagram_size_max: usize,

    /// Maximum number of datagrams read per call to `drain_socket`.
    ///
    /// Minimum value: 1 \
    /// Default value: 10
    pub receive_attempts_max: usize,

    /// Initial size of the connection lookup array. Must be a power of two.
    ///
    /// Minimum value: 2 \
    /// Maximum value: 32,768 \
    /// Default value: 8
    pub lookup_capacity_initial: usize,

    /// Maximum number of connections which may exist at any given time.
    ///
    /// Minimum value: 1 \
    /// Default value: 65,535
    pub connection_count_max: usize,

    /// Handling of misrouted datagrams.
    ///
    /// Default value: [`ErrorReplyPolicy::Reply`]
    pub error_reply: ErrorReplyPolicy,

    /// Maximum number of error replies sent per `sync`. Further replies are discarded.
    ///
    /// Default value: 16
    pub error_reply_limit: usize,

    /// Seed for connection ID selection and loss simulation. Seeded from the OS if `None`.
    pub seed: Option<u64>,

    /// High-level protocol versions supported by the application.
    ///
    /// Default value: 1..=1
    pub highlevel_versions: VersionRange<u8>,

    /// Artificial packet loss.
    pub debug: DebugSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            datagram_size_max: DATAGRAM_SIZE_MAX_DEFAULT,
            receive_attempts_max: RECEIVE_ATTEMPTS_MAX_DEFAULT,
            lookup_capacity_initial: LOOKUP_CAPACITY_INITIAL_DEFAULT,
            connection_count_max: CONNECTION_COUNT_MAX_DEFAULT,
            error_reply: ErrorReplyPolicy::Reply,
            error_reply_limit: ERROR_REPLY_LIMIT_DEFAULT,
            seed: None,
            highlevel_versions: VersionRange::new(1, 1),
            debug: Default::default(),
        }
    }
}

fn invalid(msg: String) -> Result<()> {
    Err(Error::InvalidConfig(msg))
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.datagram_size_max < crate::frame::HEADER_SIZE
            || self.datagram_size_max > DATAGRAM_SIZE_MAX_MAX
        {
            return invalid(format!(
                "datagram_size_max must be within [{}, {}]",
                crate::frame::HEADER_SIZE,
                DATAGRAM_SIZE_MAX_MAX
            ));
        }
        if self.receive_attempts_max == 0 {
            return invalid("receive_attempts_max == 0".into());
        }
        if !self.lookup_capacity_initial.is_power_of_two()
            || self.lookup_capacity_initial < 2
            || self.lookup_capacity_initial > LOOKUP_CAPACITY_INITIAL_MAX
        {
            return invalid(format!(
                "lookup_capacity_initial must be a power of two within [2, {}]",
                LOOKUP_CAPACITY_INITIAL_MAX
            ));
        }
        if self.connection_count_max == 0 {
            return invalid("connection_count_max == 0".into());
        }
        if self.highlevel_versions.minimum > self.highlevel_versions.maximum {
            return invalid("highlevel_versions is empty".into());
        }
        for (name, p) in [
            ("debug.receive_loss", self.debug.receive_loss),
            ("debug.send_loss", self.debug.send_loss),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return invalid(format!("{} must be within [0, 1]", name));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let cases: Vec<fn(&mut Config)> = vec![
            |c| c.datagram_size_max = 5,
            |c| c.datagram_size_max = 70000,
            |c| c.receive_attempts_max = 0,
            |c| c.lookup_capacity_initial = 12,
            |c| c.lookup_capacity_initial = 1,
            |c| c.lookup_capacity_initial = 65536,
            |c| c.connection_count_max = 0,
            |c| c.highlevel_versions = VersionRange::new(3, 2),
            |c| c.debug.receive_loss = 1.5,
            |c| c.debug.send_loss = -0.1,
            |c| c.debug.send_loss = f32::NAN,
        ];

        for modify in cases {
            let mut config = Config::default();
            modify(&mut config);
            assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
        }
    }
}
