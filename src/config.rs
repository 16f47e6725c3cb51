//! Client configuration.

use thiserror::Error;

use crate::cluster::HostPort;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid seed entry {token:?} in seeds {seeds:?}")]
    InvalidSeed { token: String, seeds: String },

    #[error("no usable brokers in seeds {seeds:?}")]
    EmptySeeds { seeds: String },
}

/// The set of options recognized by the client.
///
/// Only `seeds` is consumed by the coordinator itself; the remaining options
/// are plumbed through to the connection and producer/consumer layers that
/// embed it.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Comma-separated `host:port` bootstrap brokers, e.g. `"h1:9092,h2:9092"`.
    pub seeds: String,

    /// Client id reported to brokers on every request.
    pub client_id: String,

    /// Acks required for produce requests: `0` none, `1` leader, `-1` all.
    pub required_acks: i16,

    /// Per-request timeout enforced by the connection layer.
    pub request_timeout_ms: u32,

    /// Compression applied to produced record batches.
    pub compression_codec: CompressionCodec,

    /// Minimum bytes a broker should accumulate before answering a fetch.
    pub fetch_min_bytes: i32,

    /// Maximum time a broker may delay a fetch response.
    pub fetch_max_wait_ms: u32,

    /// Socket send buffer size.
    pub send_buffer_size: usize,

    /// Socket receive buffer size.
    pub receive_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            seeds: String::new(),
            client_id: "rscluster".to_owned(),
            required_acks: 1,
            request_timeout_ms: 30_000,
            compression_codec: CompressionCodec::default(),
            fetch_min_bytes: 1,
            fetch_max_wait_ms: 500,
            send_buffer_size: 64 * 1024,
            receive_buffer_size: 64 * 1024,
        }
    }
}

/// Compression codecs for produced record batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionCodec {
    #[default]
    None,
    Gzip,
    Snappy,
}

/// Parses a comma-separated `host:port` seed list.
///
/// Empty entries are skipped; anything else that does not parse as
/// `host:port` fails construction.
pub(crate) fn parse_seeds(seeds: &str) -> Result<Vec<HostPort>, ConfigError> {
    let mut parsed = Vec::new();
    for token in seeds.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }

        let invalid = || ConfigError::InvalidSeed {
            token: token.to_owned(),
            seeds: seeds.to_owned(),
        };

        let (host, port) = token.rsplit_once(':').ok_or_else(|| invalid())?;
        if host.is_empty() {
            return Err(invalid());
        }
        let port: u16 = port.parse().map_err(|_| invalid())?;

        parsed.push(HostPort::new(host, port));
    }

    if parsed.is_empty() {
        return Err(ConfigError::EmptySeeds {
            seeds: seeds.to_owned(),
        });
    }

    Ok(parsed)
}
