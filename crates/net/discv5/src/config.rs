//! A set of configuration parameters to tune the discovery protocol.

use crate::{
    crypto::{CryptoProvider, DefaultCrypto},
    socket::ListenConfig,
};
use std::{sync::Arc, time::Duration};

/// Configuration parameters that define the performance of the discovery network.
#[derive(Clone, Debug)]
pub struct Discv5Config {
    /// The duration after which an unanswered request is retried or failed. Default: 1s.
    pub request_timeout: Duration,
    /// How often an unanswered request is re-sent before failing. Default: 1.
    pub request_retries: u8,
    /// The duration an idle established session is kept. Default: 24h.
    pub session_timeout: Duration,
    /// The duration a handshake may take before the session is abandoned. Default: 15s.
    pub session_establish_timeout: Duration,
    /// The duration a whole iterative lookup may take. Default: 60s.
    pub lookup_timeout: Duration,
    /// Number of concurrent FINDNODE queries per lookup (the Kademlia alpha). Default: 3.
    pub lookup_parallelism: usize,
    /// Target result count of a lookup and bucket size (the Kademlia k). Default: 16.
    pub lookup_num_results: usize,
    /// Maximum FINDNODE requests sent to a single peer during one lookup. Default: 3.
    pub lookup_request_limit: usize,
    /// The interval at which connected table entries are re-pinged. Default: 300s.
    pub ping_interval: Duration,
    /// Whether PONG-reported endpoints may update the local ENR. Default: true.
    pub enr_update: bool,
    /// Size of the channel buffer for incoming datagrams.
    pub udp_ingress_message_buffer: usize,
    /// Size of the channel buffer for outgoing datagrams.
    pub udp_egress_message_buffer: usize,
    /// The socket(s) bound at start.
    pub listen_config: ListenConfig,
    /// The crypto primitive provider.
    pub crypto: Arc<dyn CryptoProvider>,
}

impl Discv5Config {
    /// Returns a new default builder instance
    pub fn builder() -> Discv5ConfigBuilder {
        Default::default()
    }
}

impl Default for Discv5Config {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(1),
            request_retries: 1,
            session_timeout: Duration::from_secs(86_400),
            session_establish_timeout: Duration::from_secs(15),
            lookup_timeout: Duration::from_secs(60),
            lookup_parallelism: 3,
            lookup_num_results: 16,
            lookup_request_limit: 3,
            ping_interval: Duration::from_secs(300),
            enr_update: true,
            // This should be high enough to cover an entire iterative lookup, which fans out
            // to the peers discovered in each round using the concurrency factor alpha.
            udp_ingress_message_buffer: 1024,
            // Every outgoing request will eventually lead to an incoming response.
            udp_egress_message_buffer: 1024,
            listen_config: ListenConfig::default(),
            crypto: Arc::new(DefaultCrypto),
        }
    }
}

/// Builder type for [`Discv5Config`]
#[derive(Clone, Debug, Default)]
pub struct Discv5ConfigBuilder {
    config: Discv5Config,
}

impl Discv5ConfigBuilder {
    /// Sets the timeout after which requests are considered timed out
    pub fn request_timeout(&mut self, duration: Duration) -> &mut Self {
        self.config.request_timeout = duration;
        self
    }

    /// Sets the number of times an unanswered request is re-sent.
    pub fn request_retries(&mut self, retries: u8) -> &mut Self {
        self.config.request_retries = retries;
        self
    }

    /// Sets how long an idle session is kept around.
    pub fn session_timeout(&mut self, duration: Duration) -> &mut Self {
        self.config.session_timeout = duration;
        self
    }

    /// Sets how long a handshake may remain unanswered.
    pub fn session_establish_timeout(&mut self, duration: Duration) -> &mut Self {
        self.config.session_establish_timeout = duration;
        self
    }

    /// Sets the overall deadline of an iterative lookup.
    pub fn lookup_timeout(&mut self, duration: Duration) -> &mut Self {
        self.config.lookup_timeout = duration;
        self
    }

    /// Sets the lookup concurrency factor alpha.
    pub fn lookup_parallelism(&mut self, parallelism: usize) -> &mut Self {
        self.config.lookup_parallelism = parallelism;
        self
    }

    /// Sets the lookup result count k.
    pub fn lookup_num_results(&mut self, num_results: usize) -> &mut Self {
        self.config.lookup_num_results = num_results;
        self
    }

    /// Sets the per-peer FINDNODE budget of a lookup.
    pub fn lookup_request_limit(&mut self, limit: usize) -> &mut Self {
        self.config.lookup_request_limit = limit;
        self
    }

    /// The time between pings to ensure connectivity amongst connected nodes.
    pub fn ping_interval(&mut self, interval: Duration) -> &mut Self {
        self.config.ping_interval = interval;
        self
    }

    /// Whether PONG-observed endpoints may update the local ENR.
    pub fn enr_update(&mut self, enr_update: bool) -> &mut Self {
        self.config.enr_update = enr_update;
        self
    }

    /// Sets the channel size for incoming datagrams.
    pub fn udp_ingress_message_buffer(&mut self, udp_ingress_message_buffer: usize) -> &mut Self {
        self.config.udp_ingress_message_buffer = udp_ingress_message_buffer;
        self
    }

    /// Sets the channel size for outgoing datagrams.
    pub fn udp_egress_message_buffer(&mut self, udp_egress_message_buffer: usize) -> &mut Self {
        self.config.udp_egress_message_buffer = udp_egress_message_buffer;
        self
    }

    /// Sets the socket(s) to bind.
    pub fn listen_config(&mut self, listen_config: ListenConfig) -> &mut Self {
        self.config.listen_config = listen_config;
        self
    }

    /// Sets the crypto primitive provider.
    pub fn crypto(&mut self, crypto: Arc<dyn CryptoProvider>) -> &mut Self {
        self.config.crypto = crypto;
        self
    }

    /// Returns the configured [`Discv5Config`]
    pub fn build(&self) -> Discv5Config {
        self.config.clone()
    }
}
