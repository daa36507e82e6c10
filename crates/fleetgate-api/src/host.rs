//! Recognizing workload proxy hostnames.
//!
//! Two forms are accepted, with `<instance>` not interpreted:
//!
//! ```text
//! legacy:  <prefix>-<alias>-<instance>.<main-domain>
//! current: <alias>-<instance>.<proxy-subdomain>.<main-domain>
//! ```

/// Hostname settings of the proxy.
#[derive(Debug, Clone)]
pub struct HostPatterns {
    pub main_domain: String,
    /// Leading label marker of the legacy form.
    pub proxy_prefix: String,
    /// Subdomain of the current form.
    pub proxy_subdomain: String,
}

impl Default for HostPatterns {
    fn default() -> Self {
        Self {
            main_domain: "localhost".into(),
            proxy_prefix: "p".into(),
            proxy_subdomain: "proxy-us".into(),
        }
    }
}

/// Result of matching a Host header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostMatch {
    /// Not addressed to the proxy.
    NotProxy,
    /// Shaped like a proxy host, but no alias can be extracted.
    Malformed,
    Alias(String),
}

impl HostPatterns {
    /// Classify a Host header value. A port suffix is ignored.
    pub fn classify(&self, host: &str) -> HostMatch {
        let host = strip_port(host).trim_end_matches('.').to_ascii_lowercase();
        let domain = self.main_domain.trim_matches('.').to_ascii_lowercase();

        let current_suffix = format!(".{}.{}", self.proxy_subdomain.to_ascii_lowercase(), domain);
        if let Some(label) = host.strip_suffix(&current_suffix) {
            return split_alias(label);
        }

        let Some(label) = host.strip_suffix(&format!(".{domain}")) else {
            return HostMatch::NotProxy;
        };
        let marker = format!("{}-", self.proxy_prefix.to_ascii_lowercase());
        match label.strip_prefix(&marker) {
            Some(rest) => split_alias(rest),
            None => HostMatch::NotProxy,
        }
    }
}

/// `<alias>-<instance>` as a single DNS label.
fn split_alias(label: &str) -> HostMatch {
    if label.contains('.') {
        return HostMatch::Malformed;
    }
    match label.split_once('-') {
        Some((alias, instance)) if !alias.is_empty() && !instance.is_empty() => {
            HostMatch::Alias(alias.to_string())
        }
        _ => HostMatch::Malformed,
    }
}

/// Drop a `:port` suffix, leaving bracketed IPv6 literals intact.
pub fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns() -> HostPatterns {
        HostPatterns {
            main_domain: "fleet.example.org".into(),
            proxy_prefix: "p".into(),
            proxy_subdomain: "proxy-us".into(),
        }
    }

    fn alias(s: &str) -> HostMatch {
        HostMatch::Alias(s.into())
    }

    #[test]
    fn current_form() {
        let p = patterns();
        assert_eq!(p.classify("grafana-acme.proxy-us.fleet.example.org"), alias("grafana"));
        assert_eq!(p.classify("grafana-acme-prod.proxy-us.fleet.example.org"), alias("grafana"));
        assert_eq!(p.classify("Grafana-Acme.Proxy-US.fleet.example.org:8443"), alias("grafana"));
    }

    #[test]
    fn legacy_form() {
        let p = patterns();
        assert_eq!(p.classify("p-grafana-acme.fleet.example.org"), alias("grafana"));
        assert_eq!(p.classify("p-grafana-acme.fleet.example.org:443"), alias("grafana"));
    }

    #[test]
    fn other_hosts_pass_through() {
        let p = patterns();
        assert_eq!(p.classify("fleet.example.org"), HostMatch::NotProxy);
        assert_eq!(p.classify("api.fleet.example.org"), HostMatch::NotProxy);
        assert_eq!(p.classify("grafana-acme.example.com"), HostMatch::NotProxy);
        assert_eq!(p.classify("127.0.0.1:8080"), HostMatch::NotProxy);
        assert_eq!(p.classify("[::1]:8080"), HostMatch::NotProxy);
    }

    #[test]
    fn proxy_shaped_hosts_without_alias_are_malformed() {
        let p = patterns();
        assert_eq!(p.classify("grafana.proxy-us.fleet.example.org"), HostMatch::Malformed);
        assert_eq!(p.classify("-acme.proxy-us.fleet.example.org"), HostMatch::Malformed);
        assert_eq!(p.classify("a.b-c.proxy-us.fleet.example.org"), HostMatch::Malformed);
        assert_eq!(p.classify("p-grafana.fleet.example.org"), HostMatch::Malformed);
    }

    #[test]
    fn strip_port_variants() {
        assert_eq!(strip_port("example.org:80"), "example.org");
        assert_eq!(strip_port("example.org"), "example.org");
        assert_eq!(strip_port("[::1]:80"), "[::1]");
        assert_eq!(strip_port("[::1]"), "[::1]");
    }
}
