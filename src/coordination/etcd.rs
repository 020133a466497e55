//! etcd Backend
//!
//! `Connector` and `CoordinationSession` on top of `etcd-client`.
//! Session creation is verified with a status round trip, and every request
//! is wrapped in a timeout so a stalled store cannot stall the cron tick.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use etcd_client::{
    Certificate, Client, Compare, CompareOp, ConnectOptions, DeleteOptions, Identity,
    PutOptions, TlsOptions, Txn, TxnOp,
};
use tokio::time::timeout;

use super::{Connector, CoordinationSession, KeyEntry, TlsMaterial};
use crate::error::{Error, Result};

/// Run an etcd request with an upper bound on its duration
async fn bounded<T, F>(limit: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, etcd_client::Error>>,
{
    match timeout(limit, fut).await {
        Ok(result) => result.map_err(Error::from),
        Err(_) => Err(Error::ConnectionTimeout(what.to_string())),
    }
}

/// Split a comma-separated endpoint list
pub fn parse_endpoints(address: &str) -> Vec<String> {
    address
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Creates etcd sessions
#[derive(Debug, Clone)]
pub struct EtcdConnector {
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl EtcdConnector {
    /// Create a new connector
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
        }
    }

    async fn open(
        &self,
        address: &str,
        options: ConnectOptions,
    ) -> Result<Box<dyn CoordinationSession>> {
        let endpoints = parse_endpoints(address);
        if endpoints.is_empty() {
            return Err(Error::Config(format!(
                "no etcd endpoints in address [{}]",
                address
            )));
        }

        let options = options
            .with_connect_timeout(self.connect_timeout)
            .with_timeout(self.request_timeout);

        let mut client = match timeout(
            self.connect_timeout,
            Client::connect(endpoints, Some(options)),
        )
        .await
        {
            Ok(Ok(client)) => client,
            Ok(Err(e)) => {
                return Err(Error::ConnectionFailed {
                    address: address.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => return Err(Error::ConnectionTimeout(address.to_string())),
        };

        // Channel creation is lazy; make sure someone answers
        bounded(self.request_timeout, "status", client.status())
            .await
            .map_err(|e| Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Box::new(EtcdSession {
            client,
            request_timeout: self.request_timeout,
            leases: HashMap::new(),
        }))
    }
}

#[async_trait::async_trait]
impl Connector for EtcdConnector {
    async fn connect_plain(&self, address: &str) -> Result<Box<dyn CoordinationSession>> {
        self.open(address, ConnectOptions::new()).await
    }

    async fn connect_tls(
        &self,
        address: &str,
        tls: &TlsMaterial,
    ) -> Result<Box<dyn CoordinationSession>> {
        let tls_options = TlsOptions::new()
            .ca_certificate(Certificate::from_pem(&tls.ca))
            .identity(Identity::from_pem(&tls.cert, &tls.key));
        self.open(address, ConnectOptions::new().with_tls(tls_options))
            .await
    }
}

/// A live etcd session
pub struct EtcdSession {
    client: Client,
    request_timeout: Duration,
    /// Lease currently attached to each upserted key
    leases: HashMap<String, i64>,
}

impl EtcdSession {
    /// Return a live lease for `key`, renewing the cached one or granting a new one
    async fn live_lease(&mut self, key: &str, ttl_secs: u64) -> Result<i64> {
        let limit = self.request_timeout;

        if let Some(&id) = self.leases.get(key) {
            let (mut keeper, mut stream) =
                bounded(limit, "lease keep-alive", self.client.lease_keep_alive(id)).await?;
            bounded(limit, "lease keep-alive", keeper.keep_alive()).await?;

            match bounded(limit, "lease keep-alive", stream.message()).await? {
                Some(resp) if resp.ttl() > 0 => return Ok(id),
                _ => {
                    tracing::debug!("Lease {:x} for {} expired, granting a new one", id, key);
                    self.leases.remove(key);
                }
            }
        }

        let grant = bounded(
            limit,
            "lease grant",
            self.client.lease_grant(ttl_secs as i64, None),
        )
        .await?;
        self.leases.insert(key.to_string(), grant.id());
        Ok(grant.id())
    }
}

#[async_trait::async_trait]
impl CoordinationSession for EtcdSession {
    async fn upsert(&mut self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let lease = self.live_lease(key, ttl_secs).await?;
        let put = self
            .client
            .put(key, value, Some(PutOptions::new().with_lease(lease)));

        if let Err(e) = bounded(self.request_timeout, "put", put).await {
            // Forget the lease so the next attempt starts clean
            self.leases.remove(key);
            return Err(e);
        }
        Ok(())
    }

    async fn set(&mut self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        self.leases.remove(key);

        let options = if ttl_secs == 0 {
            None
        } else {
            let grant = bounded(
                self.request_timeout,
                "lease grant",
                self.client.lease_grant(ttl_secs as i64, None),
            )
            .await?;
            Some(PutOptions::new().with_lease(grant.id()))
        };

        bounded(self.request_timeout, "put", self.client.put(key, value, options)).await?;
        Ok(())
    }

    async fn remove_subtree(&mut self, prefix: &str) -> Result<u64> {
        let resp = bounded(
            self.request_timeout,
            "delete prefix",
            self.client
                .delete(prefix, Some(DeleteOptions::new().with_prefix())),
        )
        .await?;
        self.leases.retain(|key, _| !key.starts_with(prefix));
        Ok(resp.deleted().max(0) as u64)
    }

    async fn get(&mut self, key: &str) -> Result<Option<KeyEntry>> {
        let resp = bounded(self.request_timeout, "get", self.client.get(key, None)).await?;
        Ok(resp.kvs().first().map(|kv| KeyEntry {
            value: kv.value().to_vec(),
            mod_revision: kv.mod_revision(),
        }))
    }

    async fn compare_and_delete(&mut self, key: &str, mod_revision: i64) -> Result<bool> {
        let txn = Txn::new()
            .when(vec![Compare::mod_revision(
                key,
                CompareOp::Equal,
                mod_revision,
            )])
            .and_then(vec![TxnOp::delete(key, None)]);

        let resp = bounded(self.request_timeout, "txn", self.client.txn(txn)).await?;
        if resp.succeeded() {
            self.leases.remove(key);
        }
        Ok(resp.succeeded())
    }

    async fn close(&mut self) -> Result<()> {
        let leases: Vec<(String, i64)> = self.leases.drain().collect();
        for (key, id) in leases {
            if let Err(e) = bounded(
                self.request_timeout,
                "lease revoke",
                self.client.lease_revoke(id),
            )
            .await
            {
                tracing::warn!("Failed to revoke lease {:x} for {}: {}", id, key, e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoints() {
        assert_eq!(
            parse_endpoints("192.168.58.201:2379, 192.168.58.202:2379,"),
            vec!["192.168.58.201:2379", "192.168.58.202:2379"]
        );
        assert!(parse_endpoints(" , ").is_empty());
    }

    #[tokio::test]
    async fn test_empty_address_is_config_error() {
        let connector = EtcdConnector::new(Duration::from_millis(50), Duration::from_millis(50));
        let err = connector.connect_plain(",").await.err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }
}
