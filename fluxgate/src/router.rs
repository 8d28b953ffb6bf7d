//! Flow classification: a request fingerprint goes in, a policy comes
//! out. Rule semantics are deliberately small (exact domain and domain
//! suffix); decisions are cached per host in a bounded LRU.

use lru_cache::LruCache;
use proxy_types::DestAddr;

use crate::config::{Config, ProxyConfig};
use crate::config::dto::{Rule, RuleKind};

const DECISION_CACHE_SIZE: usize = 512;

/// What the rule engine decided for one flow.
#[derive(Debug, Clone)]
pub enum Policy {
    Direct,
    Reject,
    Proxy(ProxyConfig),
}

/// Target address plus the TLS server name when one is known; both feed
/// the rule match.
#[derive(Debug, Clone)]
pub struct RequestTarget {
    pub dest: DestAddr,
    pub sni: Option<String>,
}

impl RequestTarget {
    pub fn new(dest: DestAddr) -> Self {
        Self { dest, sni: None }
    }

    fn matchable_host(&self) -> String {
        self.sni.clone().unwrap_or_else(|| self.dest.host())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Decision {
    Direct,
    Reject,
    Named(String),
}

pub struct Router {
    rules: Vec<Rule>,
    proxies: std::collections::HashMap<String, ProxyConfig>,
    final_policy: Decision,
    cache: LruCache<String, Decision>,
}

impl Router {
    pub fn new(conf: &Config) -> anyhow::Result<Self> {
        let rules = conf
            .rules
            .iter()
            .map(|rule| Rule {
                r#match: rule.r#match,
                value: rule.value.to_ascii_lowercase(),
                policy: rule.policy.clone(),
            })
            .collect();

        Ok(Self {
            rules,
            proxies: conf.proxies.clone(),
            final_policy: parse_decision(&conf.final_policy),
            cache: LruCache::new(DECISION_CACHE_SIZE),
        })
    }

    pub fn route(&self, target: &RequestTarget) -> Policy {
        let host = target.matchable_host().to_ascii_lowercase();

        let decision = match self.cache.get(&host) {
            Some(decision) => decision,
            None => {
                let decision = self.evaluate(&host);
                self.cache.put(host.clone(), decision.clone());
                decision
            }
        };

        match decision {
            Decision::Direct => Policy::Direct,
            Decision::Reject => Policy::Reject,
            Decision::Named(name) => match self.proxies.get(&name) {
                Some(proxy) => Policy::Proxy(proxy.clone()),
                // Validation rejects unknown names; a missing entry here
                // means the profile changed under us, fail closed.
                None => Policy::Reject,
            },
        }
    }

    fn evaluate(&self, host: &str) -> Decision {
        for rule in &self.rules {
            let hit = match rule.r#match {
                RuleKind::Domain => host == rule.value,
                RuleKind::DomainSuffix => {
                    host == rule.value || host.ends_with(&format!(".{}", rule.value))
                }
            };

            if hit {
                debug!(%host, rule = %rule.value, policy = %rule.policy, "Rule matched");
                return parse_decision(&rule.policy);
            }
        }

        self.final_policy.clone()
    }
}

fn parse_decision(policy: &str) -> Decision {
    match policy {
        "direct" => Decision::Direct,
        "reject" => Decision::Reject,
        name => Decision::Named(name.to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use proxy_types::ToDestAddr as _;

    use super::*;
    use crate::config::load_str;

    fn router() -> Router {
        let conf = load_str(
            r#"{
            "proxies": {
                "up": { "kind": "socks5", "server": "127.0.0.1", "port": 1080 }
            },
            "rules": [
                { "match": "domain-suffix", "value": "example.com", "policy": "up" },
                { "match": "domain", "value": "blocked.test", "policy": "reject" }
            ],
            "final": "direct"
        }"#,
        )
        .unwrap();
        Router::new(&conf).unwrap()
    }

    fn target(addr: &str) -> RequestTarget {
        RequestTarget::new(addr.to_dest_addr().unwrap())
    }

    #[test]
    fn suffix_rule_matches_domain_and_subdomains() {
        let router = router();

        assert!(matches!(router.route(&target("example.com:443")), Policy::Proxy(p) if p.name == "up"));
        assert!(matches!(router.route(&target("www.example.com:443")), Policy::Proxy(_)));
        assert!(matches!(router.route(&target("notexample.com:443")), Policy::Direct));
    }

    #[test]
    fn exact_rule_does_not_match_subdomains() {
        let router = router();

        assert!(matches!(router.route(&target("blocked.test:80")), Policy::Reject));
        assert!(matches!(router.route(&target("sub.blocked.test:80")), Policy::Direct));
    }

    #[test]
    fn sni_overrides_destination_host() {
        let router = router();

        let mut fingerprint = target("10.0.0.1:443");
        fingerprint.sni = Some("www.example.com".to_owned());
        assert!(matches!(router.route(&fingerprint), Policy::Proxy(_)));
    }

    #[test]
    fn case_insensitive_matching_and_caching() {
        let router = router();

        assert!(matches!(router.route(&target("WWW.Example.COM:443")), Policy::Proxy(_)));
        // Second hit comes from the decision cache.
        assert!(matches!(router.route(&target("www.example.com:443")), Policy::Proxy(_)));
    }
}
