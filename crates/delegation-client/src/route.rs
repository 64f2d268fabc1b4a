//! Typed delegation-service routes and their URLs.

use url::Url;

/// `GET /nip05?nip05=<identifier>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nip05Request {
    pub nip05: String,
}

impl Nip05Request {
    /// `None` for a blank identifier; surrounding whitespace is dropped.
    pub fn new(nip05: &str) -> Option<Self> {
        let nip05 = nip05.trim();
        (!nip05.is_empty()).then(|| Self {
            nip05: nip05.to_string(),
        })
    }
}

/// `GET /image_proxy?url=<image>[&width=..][&height=..][&ratio=..]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageProxyRequest {
    pub url: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub ratio: Option<String>,
}

impl ImageProxyRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            width: None,
            height: None,
            ratio: None,
        }
    }

    pub fn width(mut self, width: u32) -> Self {
        self.width = Some(width);
        self
    }

    pub fn height(mut self, height: u32) -> Self {
        self.height = Some(height);
        self
    }

    pub fn ratio(mut self, ratio: impl Into<String>) -> Self {
        self.ratio = Some(ratio.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelegationRoute {
    Nip05(Nip05Request),
    ImageProxy(ImageProxyRequest),
    /// Instance health check used before enabling the service.
    IsGood,
}

impl DelegationRoute {
    pub fn path(&self) -> &'static str {
        match self {
            DelegationRoute::Nip05(_) => "nip05",
            DelegationRoute::ImageProxy(_) => "image_proxy",
            DelegationRoute::IsGood => "is_good",
        }
    }

    fn query_pairs(&self) -> Vec<(&'static str, String)> {
        match self {
            DelegationRoute::Nip05(request) => vec![("nip05", request.nip05.clone())],
            DelegationRoute::ImageProxy(request) => {
                let mut pairs = vec![("url", request.url.clone())];
                if let Some(width) = request.width {
                    pairs.push(("width", width.to_string()));
                }
                if let Some(height) = request.height {
                    pairs.push(("height", height.to_string()));
                }
                if let Some(ratio) = &request.ratio {
                    pairs.push(("ratio", ratio.clone()));
                }
                pairs
            }
            DelegationRoute::IsGood => Vec::new(),
        }
    }

    /// Full request URL under `base`, with the shared secret appended as
    /// `pass` when one is configured.
    pub(crate) fn url(&self, base: &Url, secret: Option<&str>) -> Option<Url> {
        let joined = format!("{}/{}", base.as_str().trim_end_matches('/'), self.path());
        let mut url = Url::parse(&joined).ok()?;

        let mut pairs = self.query_pairs();
        if let Some(secret) = secret.filter(|secret| !secret.is_empty()) {
            pairs.push(("pass", secret.to_string()));
        }
        if !pairs.is_empty() {
            url.query_pairs_mut().extend_pairs(pairs);
        }
        Some(url)
    }
}
