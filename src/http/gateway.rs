use url::Url;

use crate::error::Error;
use crate::http::location::origin_of;

/// An egress-rotation endpoint provisioned for one base URL. Requests whose
/// URL starts with `base_url` are rewritten to `proxy_url` at facade entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionedGateway {
    pub base_url: String,
    pub proxy_url: String,
}

/// Narrow interface to the external egress-IP-rotation service. The engine
/// only ever provisions a gateway per base URL and releases it on close;
/// everything else (regions, credentials, teardown retries) belongs to the
/// implementation.
pub trait GatewayProvider: Send + Sync {
    fn provision(&self, base_url: &Url) -> crate::Result<ProvisionedGateway>;

    fn release(&self, gateway: &ProvisionedGateway);
}

/// Default provider: rotation is unavailable until the caller supplies an
/// implementation.
#[derive(Debug, Default)]
pub struct NoGatewayProvider;

impl GatewayProvider for NoGatewayProvider {
    fn provision(&self, base_url: &Url) -> crate::Result<ProvisionedGateway> {
        Err(Error::Gateway {
            base_url: origin_of(base_url),
            message: "no egress gateway provider is configured".to_owned(),
        })
    }

    fn release(&self, _gateway: &ProvisionedGateway) {}
}

/// Base URL (scheme://host[:port]) a gateway is keyed by.
pub(crate) fn base_url_of(url: &Url) -> String {
    origin_of(url)
}
