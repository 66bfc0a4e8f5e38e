//! One-shot network client
//!
//! Connects, fetches parameters unless they were supplied, and runs one
//! full query on a fresh session.

use veil_core::{Channel, HeBackend, Item, MatchRecord, NetworkChannel, PsiParams, TransparentBackend};

use crate::error::{ClientError, Result};
use crate::session::ClientSession;

/// Traffic of the last query
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

pub struct NetworkClient<B: HeBackend = TransparentBackend> {
    address: String,
    params: Option<PsiParams>,
    last_traffic: TrafficStats,
    _backend: std::marker::PhantomData<fn() -> B>,
}

impl<B: HeBackend> NetworkClient<B> {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            params: None,
            last_traffic: TrafficStats::default(),
            _backend: std::marker::PhantomData,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Parameters in use; fetched on the first query when not supplied
    pub fn params(&self) -> Option<&PsiParams> {
        self.params.as_ref()
    }

    pub fn last_traffic(&self) -> TrafficStats {
        self.last_traffic
    }

    /// Look up `items`, returning one record per item in input order
    pub fn query(&mut self, items: &[Item]) -> Result<Vec<MatchRecord>> {
        if items.is_empty() {
            return Err(veil_core::Error::EmptyQuery.into());
        }

        let mut channel = NetworkChannel::new();
        if !channel.connect(&self.address) {
            return Err(ClientError::Connect(self.address.clone()));
        }

        let result = self.run_session(items, &mut channel);
        self.last_traffic = TrafficStats {
            bytes_sent: channel.bytes_sent(),
            bytes_received: channel.bytes_received(),
        };
        channel.disconnect();

        tracing::debug!(
            address = %self.address,
            sent = self.last_traffic.bytes_sent,
            received = self.last_traffic.bytes_received,
            "query finished"
        );
        result
    }

    fn run_session(&mut self, items: &[Item], channel: &mut NetworkChannel) -> Result<Vec<MatchRecord>> {
        let mut session: ClientSession<B> = match &self.params {
            Some(params) => ClientSession::with_params(params.clone())?,
            None => {
                let mut session = ClientSession::<B>::new();
                session.request_params(channel)?;
                self.params = session.params().cloned();
                session
            }
        };

        session.request_oprf(items, channel)?;
        Ok(session.request_query(channel)?)
    }
}

pub struct ClientBuilder {
    address: String,
    params: Option<PsiParams>,
}

impl ClientBuilder {
    /// `address` is a `tcp://host:port` endpoint
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            params: None,
        }
    }

    /// Use known parameters instead of fetching them from the server
    pub fn params(mut self, params: PsiParams) -> Self {
        self.params = Some(params);
        self
    }

    /// Read the parameters from a JSON file
    pub fn params_file(self, path: impl AsRef<std::path::Path>) -> Result<Self> {
        let params = PsiParams::from_file(path)?;
        Ok(self.params(params))
    }

    pub fn build<B: HeBackend>(self) -> Result<NetworkClient<B>> {
        if let Some(params) = &self.params {
            params.validate()?;
        }
        let mut client = NetworkClient::new(self.address);
        client.params = self.params;
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_core::params::test_params;

    #[test]
    fn test_builder_with_params() {
        let client = ClientBuilder::new("tcp://127.0.0.1:1212")
            .params(test_params())
            .build::<TransparentBackend>()
            .unwrap();
        assert_eq!(client.address(), "tcp://127.0.0.1:1212");
        assert_eq!(client.params(), Some(&test_params()));
    }

    #[test]
    fn test_builder_rejects_invalid_params() {
        let mut params = test_params();
        params.table_params.table_size = 0;
        assert!(ClientBuilder::new("tcp://127.0.0.1:1212")
            .params(params)
            .build::<TransparentBackend>()
            .is_err());
    }

    #[test]
    fn test_empty_query_does_not_connect() {
        let mut client: NetworkClient = NetworkClient::new("tcp://127.0.0.1:1");
        assert!(matches!(
            client.query(&[]),
            Err(ClientError::Psi(veil_core::Error::EmptyQuery))
        ));
        assert_eq!(client.last_traffic(), TrafficStats::default());
    }

    #[test]
    fn test_bad_address() {
        let mut client: NetworkClient = NetworkClient::new("127.0.0.1:1212");
        assert!(matches!(client.query(&[Item::from("a")]), Err(ClientError::Connect(_))));
    }
}
