//! Share-link parsing
//!
//! `xp://BASE64KEY@HOST:PORT?transport=tls&sni=H&fragment=true&padding=true&fingerprint=NAME#name`
//! is shorthand for a full client configuration.

use crate::config::Config;
use crate::DEFAULT_PORT;
use url::Url;

/// Parse an `xp://` share link into a client configuration
pub fn parse_share_link(uri: &str) -> Result<Config, crate::Error> {
    let url = Url::parse(uri).map_err(|e| crate::Error::Config(format!("invalid URI: {e}")))?;
    if url.scheme() != "xp" {
        return Err(crate::Error::Config(format!(
            "invalid URI scheme '{}', expected xp://",
            url.scheme()
        )));
    }

    let key = url.username();
    if key.is_empty() {
        return Err(crate::Error::Config("key not found in URI".to_string()));
    }
    let key = percent_decode(key);

    let host = url
        .host_str()
        .ok_or_else(|| crate::Error::Config("host not found in URI".to_string()))?;
    let port = url.port().unwrap_or(DEFAULT_PORT);

    let mut cfg = Config {
        mode: "client".to_string(),
        ..Default::default()
    };
    cfg.client.server_addr = format!("{host}:{port}");
    cfg.client.key = key;

    for (name, value) in url.query_pairs() {
        match name.as_ref() {
            "transport" => cfg.transport.mode = value.to_string(),
            "sni" => cfg.client.fake_sni = value.to_string(),
            "fragment" => cfg.client.fragment = value == "true",
            "padding" => cfg.client.padding = value == "true",
            "fingerprint" => cfg.client.fingerprint = value.to_string(),
            _ => {}
        }
    }

    Ok(cfg)
}

/// Base64 keys contain `+` and `=`, which arrive percent-encoded in the
/// userinfo position
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let decoded = (bytes[i] == b'%' && i + 2 < bytes.len())
            .then(|| {
                let hi = (bytes[i + 1] as char).to_digit(16)?;
                let lo = (bytes[i + 2] as char).to_digit(16)?;
                Some((hi * 16 + lo) as u8)
            })
            .flatten();
        match decoded {
            Some(byte) => {
                out.push(byte);
                i += 3;
            }
            None => {
                out.push(bytes[i]);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_link() {
        let cfg = parse_share_link(
            "xp://c2VjcmV0a2V5@proxy.example.com:8443?transport=tls&sni=cdn.example.org&fragment=true&padding=false&fingerprint=firefox#home",
        )
        .unwrap();
        assert_eq!(cfg.mode, "client");
        assert_eq!(cfg.client.server_addr, "proxy.example.com:8443");
        assert_eq!(cfg.client.key, "c2VjcmV0a2V5");
        assert_eq!(cfg.client.fake_sni, "cdn.example.org");
        assert!(cfg.client.fragment);
        assert!(!cfg.client.padding);
        assert_eq!(cfg.client.fingerprint, "firefox");
        assert_eq!(cfg.transport.mode, "tls");
    }

    #[test]
    fn test_default_port() {
        let cfg = parse_share_link("xp://a2V5@host.example?fragment=true").unwrap();
        assert_eq!(cfg.client.server_addr, "host.example:443");
    }

    #[test]
    fn test_percent_encoded_key() {
        let cfg = parse_share_link("xp://a%2Bb%3D%3D@host.example:443").unwrap();
        assert_eq!(cfg.client.key, "a+b==");
    }

    #[test]
    fn test_rejects_wrong_scheme() {
        assert!(parse_share_link("https://key@host:443").is_err());
    }

    #[test]
    fn test_rejects_missing_key() {
        assert!(parse_share_link("xp://host.example:443").is_err());
    }
}
