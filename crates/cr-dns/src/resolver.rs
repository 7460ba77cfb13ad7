use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::error::ResolveErrorKind;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
#[error("DNS lookup failed: {0}")]
pub struct ResolveError(pub String);

/// TXT lookups used to verify challenge propagation. Abstracted so the
/// coordinator can be exercised without real DNS.
#[async_trait]
pub trait TxtResolver: Send + Sync {
    /// All TXT values currently visible at `fqdn`. A name with no records
    /// resolves to an empty list, not an error.
    async fn lookup_txt(&self, fqdn: &str) -> Result<Vec<String>, ResolveError>;
}

/// Resolver built from the system's resolv.conf.
pub struct SystemResolver {
    inner: TokioAsyncResolver,
}

impl SystemResolver {
    pub fn from_system_conf() -> Result<Self, ResolveError> {
        let inner = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| ResolveError(e.to_string()))?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl TxtResolver for SystemResolver {
    async fn lookup_txt(&self, fqdn: &str) -> Result<Vec<String>, ResolveError> {
        match self.inner.txt_lookup(fqdn).await {
            Ok(lookup) => {
                let values: Vec<String> = lookup.iter().map(|txt| txt.to_string()).collect();
                debug!(fqdn, count = values.len(), "TXT lookup");
                Ok(values)
            }
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Ok(Vec::new()),
                _ => Err(ResolveError(e.to_string())),
            },
        }
    }
}
