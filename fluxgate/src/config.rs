//! Configuration model.
//!
//! The JSON layer (`dto`) is deserialized as-is, then validated into the
//! runtime [`Config`]: algorithm and UUID strings are parsed early so a
//! broken profile fails at startup rather than on the first connection.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context as _;

pub mod dto {
    use std::collections::HashMap;

    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "kebab-case", deny_unknown_fields)]
    pub struct ConfFile {
        #[serde(default)]
        pub listeners: Vec<Listener>,
        #[serde(default)]
        pub proxies: HashMap<String, Proxy>,
        #[serde(default)]
        pub rules: Vec<Rule>,
        #[serde(default = "default_final_policy")]
        pub r#final: String,
        pub mitm: Option<Mitm>,
    }

    fn default_final_policy() -> String {
        "direct".to_owned()
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "kebab-case", deny_unknown_fields)]
    pub struct Listener {
        pub bind: String,
        pub protocol: ListenerProtocol,
        #[serde(default)]
        pub users: Vec<User>,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum ListenerProtocol {
        Http,
        Socks5,
        /// First-byte detection between the two.
        Mixed,
    }

    #[derive(Debug, Clone, Deserialize)]
    #[serde(deny_unknown_fields)]
    pub struct User {
        pub username: String,
        pub password: String,
    }

    // NOTE: deny_unknown_fields does not compose with internally tagged
    // enums, so unknown proxy options pass through undetected.
    #[derive(Debug, Deserialize)]
    #[serde(tag = "kind", rename_all = "lowercase")]
    pub enum Proxy {
        #[serde(rename_all = "kebab-case")]
        Http {
            server: String,
            port: u16,
            username: Option<String>,
            password: Option<String>,
            #[serde(default)]
            prefer_http_tunneling: bool,
            #[serde(default)]
            over_tls: bool,
            sni: Option<String>,
            #[serde(default)]
            skip_cert_verify: bool,
        },
        #[serde(rename_all = "kebab-case")]
        Socks5 {
            server: String,
            port: u16,
            username: Option<String>,
            password: Option<String>,
            #[serde(default)]
            over_tls: bool,
            sni: Option<String>,
            #[serde(default)]
            skip_cert_verify: bool,
        },
        #[serde(rename_all = "kebab-case")]
        Shadowsocks {
            server: String,
            port: u16,
            algorithm: String,
            password: String,
        },
        #[serde(rename_all = "kebab-case")]
        Vmess {
            server: String,
            port: u16,
            uuid: String,
            algorithm: String,
            #[serde(default = "default_transport")]
            transport: String,
            ws_path: Option<String>,
            #[serde(default)]
            tls: bool,
            sni: Option<String>,
            #[serde(default)]
            skip_cert_verify: bool,
        },
        #[serde(rename_all = "kebab-case")]
        Trojan {
            server: String,
            port: u16,
            password: String,
            sni: Option<String>,
            #[serde(default)]
            skip_cert_verify: bool,
        },
    }

    fn default_transport() -> String {
        "tcp".to_owned()
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "kebab-case", deny_unknown_fields)]
    pub struct Rule {
        pub r#match: RuleKind,
        pub value: String,
        pub policy: String,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
    #[serde(rename_all = "kebab-case")]
    pub enum RuleKind {
        Domain,
        DomainSuffix,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "kebab-case", deny_unknown_fields)]
    pub struct Mitm {
        pub passphrase: String,
        pub base64_p12: String,
        #[serde(default)]
        pub hostnames: Vec<String>,
    }
}

/// TLS knobs shared by the proxy kinds that can ride on TLS.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    pub sni: Option<String>,
    pub skip_cert_verify: bool,
}

#[derive(Debug, Clone)]
pub enum ProxyKind {
    Http {
        username: Option<String>,
        password: Option<String>,
        prefer_http_tunneling: bool,
        over_tls: bool,
        tls: TlsOptions,
    },
    Socks5 {
        username: Option<String>,
        password: Option<String>,
        over_tls: bool,
        tls: TlsOptions,
    },
    Shadowsocks {
        algorithm: proxy_shadowsocks::CipherKind,
        password: String,
    },
    Vmess {
        user_id: uuid::Uuid,
        security: proxy_vmess::Security,
        transport: VmessTransport,
        tls: Option<TlsOptions>,
    },
    Trojan {
        password: String,
        tls: TlsOptions,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmessTransport {
    Tcp,
    /// Accepted in profiles for compatibility; refused at connect time.
    Ws { path: Option<String> },
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub name: String,
    pub server: String,
    pub port: u16,
    pub kind: ProxyKind,
}

#[derive(Debug)]
pub struct ListenerConfig {
    pub bind: String,
    pub protocol: dto::ListenerProtocol,
    pub users: Vec<(String, String)>,
}

#[derive(Debug)]
pub struct MitmConfig {
    pub passphrase: String,
    pub base64_p12: String,
    pub hostnames: Vec<String>,
}

#[derive(Debug)]
pub struct Config {
    pub listeners: Vec<ListenerConfig>,
    pub proxies: HashMap<String, ProxyConfig>,
    pub rules: Vec<dto::Rule>,
    pub final_policy: String,
    pub mitm: Option<MitmConfig>,
}

pub fn load_file(path: &Path) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path).with_context(|| format!("couldn't read {}", path.display()))?;
    load_str(&contents).with_context(|| format!("invalid configuration in {}", path.display()))
}

pub fn load_str(contents: &str) -> anyhow::Result<Config> {
    let file: dto::ConfFile = serde_json::from_str(contents).context("malformed JSON configuration")?;
    validate(file)
}

fn validate(file: dto::ConfFile) -> anyhow::Result<Config> {
    let mut proxies = HashMap::new();

    for (name, proxy) in file.proxies {
        let proxy = validate_proxy(&name, proxy).with_context(|| format!("proxy `{name}`"))?;
        proxies.insert(name, proxy);
    }

    for rule in &file.rules {
        ensure_policy_known(&rule.policy, &proxies)
            .with_context(|| format!("rule `{} {}`", rule.value, rule.policy))?;
    }
    ensure_policy_known(&file.r#final, &proxies).context("final policy")?;

    let listeners = file
        .listeners
        .into_iter()
        .map(|listener| ListenerConfig {
            bind: listener.bind,
            protocol: listener.protocol,
            users: listener
                .users
                .into_iter()
                .map(|user| (user.username, user.password))
                .collect(),
        })
        .collect();

    Ok(Config {
        listeners,
        proxies,
        rules: file.rules,
        final_policy: file.r#final,
        mitm: file.mitm.map(|mitm| MitmConfig {
            passphrase: mitm.passphrase,
            base64_p12: mitm.base64_p12,
            hostnames: mitm.hostnames,
        }),
    })
}

fn ensure_policy_known(policy: &str, proxies: &HashMap<String, ProxyConfig>) -> anyhow::Result<()> {
    if policy == "direct" || policy == "reject" || proxies.contains_key(policy) {
        Ok(())
    } else {
        anyhow::bail!("unknown policy `{policy}`");
    }
}

fn validate_proxy(name: &str, proxy: dto::Proxy) -> anyhow::Result<ProxyConfig> {
    let (server, port, kind) = match proxy {
        dto::Proxy::Http {
            server,
            port,
            username,
            password,
            prefer_http_tunneling,
            over_tls,
            sni,
            skip_cert_verify,
        } => (
            server,
            port,
            ProxyKind::Http {
                username,
                password,
                prefer_http_tunneling,
                over_tls,
                tls: TlsOptions { sni, skip_cert_verify },
            },
        ),
        dto::Proxy::Socks5 {
            server,
            port,
            username,
            password,
            over_tls,
            sni,
            skip_cert_verify,
        } => (
            server,
            port,
            ProxyKind::Socks5 {
                username,
                password,
                over_tls,
                tls: TlsOptions { sni, skip_cert_verify },
            },
        ),
        dto::Proxy::Shadowsocks {
            server,
            port,
            algorithm,
            password,
        } => {
            let algorithm = algorithm
                .parse::<proxy_shadowsocks::CipherKind>()
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            (server, port, ProxyKind::Shadowsocks { algorithm, password })
        }
        dto::Proxy::Vmess {
            server,
            port,
            uuid,
            algorithm,
            transport,
            ws_path,
            tls,
            sni,
            skip_cert_verify,
        } => {
            let user_id = uuid::Uuid::parse_str(&uuid).context("invalid uuid")?;
            let security = algorithm
                .parse::<proxy_vmess::Security>()
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            let transport = match transport.as_str() {
                "tcp" => VmessTransport::Tcp,
                "ws" => VmessTransport::Ws { path: ws_path },
                other => anyhow::bail!("unknown transport `{other}`"),
            };
            let tls = tls.then_some(TlsOptions { sni, skip_cert_verify });
            (
                server,
                port,
                ProxyKind::Vmess {
                    user_id,
                    security,
                    transport,
                    tls,
                },
            )
        }
        dto::Proxy::Trojan {
            server,
            port,
            password,
            sni,
            skip_cert_verify,
        } => (
            server,
            port,
            ProxyKind::Trojan {
                password,
                tls: TlsOptions { sni, skip_cert_verify },
            },
        ),
    };

    Ok(ProxyConfig {
        name: name.to_owned(),
        server,
        port,
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "listeners": [
            { "bind": "127.0.0.1:1080", "protocol": "socks5" },
            { "bind": "127.0.0.1:8080", "protocol": "http",
              "users": [ { "username": "user", "password": "pass" } ] }
        ],
        "proxies": {
            "ss-tokyo": { "kind": "shadowsocks", "server": "ss.example.net", "port": 8388,
                          "algorithm": "aes-128-gcm", "password": "BeMWIH2K5YtZ" },
            "vmess-hk": { "kind": "vmess", "server": "vm.example.net", "port": 443,
                          "uuid": "450bae28-b9da-67d0-16bc-4918dc8d79b5",
                          "algorithm": "chacha20-poly1305", "tls": true, "sni": "vm.example.net" },
            "trojan-sg": { "kind": "trojan", "server": "tj.example.net", "port": 443,
                           "password": "hunter2", "skip-cert-verify": true },
            "corp": { "kind": "http", "server": "proxy.corp", "port": 3128,
                      "username": "u", "password": "p", "prefer-http-tunneling": true }
        },
        "rules": [
            { "match": "domain-suffix", "value": "example.com", "policy": "ss-tokyo" },
            { "match": "domain", "value": "blocked.test", "policy": "reject" }
        ],
        "final": "direct"
    }"#;

    #[test]
    fn sample_config_parses() {
        let conf = load_str(SAMPLE).unwrap();

        assert_eq!(conf.listeners.len(), 2);
        assert_eq!(conf.listeners[1].users.len(), 1);
        assert_eq!(conf.proxies.len(), 4);
        assert_eq!(conf.final_policy, "direct");

        match &conf.proxies["ss-tokyo"].kind {
            ProxyKind::Shadowsocks { algorithm, password } => {
                assert_eq!(*algorithm, proxy_shadowsocks::CipherKind::Aes128Gcm);
                assert_eq!(password, "BeMWIH2K5YtZ");
            }
            other => panic!("wrong kind: {other:?}"),
        }

        match &conf.proxies["vmess-hk"].kind {
            ProxyKind::Vmess {
                security, transport, tls, ..
            } => {
                assert_eq!(*security, proxy_vmess::Security::ChaCha20Poly1305);
                assert_eq!(*transport, VmessTransport::Tcp);
                assert_eq!(tls.as_ref().unwrap().sni.as_deref(), Some("vm.example.net"));
            }
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        let bad = SAMPLE.replace("aes-128-gcm", "rc4-md5");
        assert!(load_str(&bad).is_err());
    }

    #[test]
    fn unknown_policy_reference_is_rejected() {
        let bad = SAMPLE.replace("\"policy\": \"ss-tokyo\"", "\"policy\": \"nonexistent\"");
        assert!(load_str(&bad).is_err());
    }

    #[test]
    fn bad_uuid_is_rejected() {
        let bad = SAMPLE.replace("450bae28-b9da-67d0-16bc-4918dc8d79b5", "not-a-uuid");
        assert!(load_str(&bad).is_err());
    }

    #[test]
    fn unknown_listener_field_is_rejected() {
        let bad = SAMPLE.replace(
            "\"bind\": \"127.0.0.1:1080\",",
            "\"bind\": \"127.0.0.1:1080\", \"bogus\": 1,",
        );
        assert!(load_str(&bad).is_err());
    }
}
