use std::time::Duration;

/// Daemon limits and timeouts.
///
/// Everything here is fed from the command line; there is no configuration
/// file. Defaults match the values the reference router ships with.
#[derive(Clone, Debug)]
pub struct Config {
    /// Combined bound on authenticating + active connections.
    pub max_connections: usize,
    /// Bound on the authenticating subset alone.
    pub max_incomplete_connections: usize,
    /// How long a connection may spend authenticating before it is aborted.
    pub auth_timeout: Duration,
    /// How long a freshly authenticated bus-to-bus endpoint may sit without
    /// a session control message before it is torn down.
    pub session_setup_timeout: Duration,
    /// Ceiling on untrusted (non-router) remote clients. While below it, the
    /// quiet router advertisement is kept up so routers can be found.
    pub max_untrusted_clients: usize,
    /// Bound on concurrently executing JoinSession/AttachSession setups.
    pub max_concurrent_session_setups: usize,
    /// Name advertised quietly on behalf of the router itself, if any.
    pub router_advertisement: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_connections: 50,
            max_incomplete_connections: 10,
            auth_timeout: Duration::from_secs(20),
            session_setup_timeout: Duration::from_secs(30),
            max_untrusted_clients: 10,
            max_concurrent_session_setups: 8,
            router_advertisement: Some("org.alljoyn.BusNode.ajbusd".to_string()),
        }
    }
}
