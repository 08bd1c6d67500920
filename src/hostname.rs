/// Decomposition of a VM FQDN into the pieces the tooling cares about:
/// the short VM name, the domain, and the site token that selects the
/// control-plane environment. The last domain label doubles as the site
/// (e.g. `web01.example.sea` lives in the `sea` environment).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostName {
    fqdn: String,
    name: String,
    domain: String,
}

impl HostName {
    pub fn new(fqdn: &str) -> Self {
        let (name, domain) = match fqdn.split_once('.') {
            Some((name, domain)) => (name.to_string(), domain.to_string()),
            None => (fqdn.to_string(), String::new()),
        };
        Self {
            fqdn: fqdn.to_string(),
            name,
            domain,
        }
    }

    pub fn fqdn(&self) -> &str {
        &self.fqdn
    }

    /// Short VM name, as registered with the control plane.
    pub fn short_name(&self) -> &str {
        &self.name
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Domain base, e.g. "example" for web01.example.sea.
    pub fn base_name(&self) -> &str {
        let parts: Vec<&str> = self.domain.split('.').collect();
        if parts.len() >= 2 { parts[parts.len() - 2] } else { "" }
    }

    /// Site token: the last domain label. An empty site means the FQDN
    /// cannot be mapped to a control-plane environment.
    pub fn site(&self) -> &str {
        self.domain.rsplit('.').next().unwrap_or("")
    }
}
