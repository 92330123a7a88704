use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;

/// Server settings, read from `INNKEEP_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends since the last compaction that trigger a new one.
    pub compact_threshold: u64,
    pub compact_interval: Duration,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "innkeep".into(),
            max_connections: 256,
            compact_threshold: 1000,
            compact_interval: Duration::from_secs(30),
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Config {
    pub fn from_env() -> io::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset keys keep their defaults; set but
    /// unparsable values are an error rather than silently ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> io::Result<Self> {
        let mut config = Self::default();
        if let Some(port) = parsed(&lookup, "INNKEEP_PORT")? {
            config.port = port;
        }
        if let Some(bind) = lookup("INNKEEP_BIND") {
            config.bind = bind;
        }
        if let Some(dir) = lookup("INNKEEP_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(password) = lookup("INNKEEP_PASSWORD") {
            config.password = password;
        }
        if let Some(max) = parsed(&lookup, "INNKEEP_MAX_CONNECTIONS")? {
            if max == 0 {
                return Err(invalid("INNKEEP_MAX_CONNECTIONS must be at least 1"));
            }
            config.max_connections = max;
        }
        if let Some(threshold) = parsed(&lookup, "INNKEEP_COMPACT_THRESHOLD")? {
            config.compact_threshold = threshold;
        }
        if let Some(secs) = parsed::<u64>(&lookup, "INNKEEP_COMPACT_INTERVAL_SECS")? {
            config.compact_interval = Duration::from_secs(secs.max(1));
        }
        config.metrics_port = parsed(&lookup, "INNKEEP_METRICS_PORT")?;
        config.tls_cert = lookup("INNKEEP_TLS_CERT").map(PathBuf::from);
        config.tls_key = lookup("INNKEEP_TLS_KEY").map(PathBuf::from);

        if config.tls_cert.is_some() != config.tls_key.is_some() {
            return Err(invalid(
                "both INNKEEP_TLS_CERT and INNKEEP_TLS_KEY must be set, or neither",
            ));
        }
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("innkeep.wal")
    }

    /// `None` when TLS is not configured.
    pub fn load_tls_acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        let (Some(cert_path), Some(key_path)) = (&self.tls_cert, &self.tls_key) else {
            return Ok(None);
        };

        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
            .collect::<Result<_, _>>()?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or_else(|| invalid("no private key found in key file"))?;

        let mut tls = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
        tls.alpn_protocols = vec![b"postgresql".to_vec()];

        Ok(Some(TlsAcceptor::from(Arc::new(tls))))
    }
}

fn parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> io::Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| invalid(&format!("{key}: cannot parse {raw:?}"))),
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(ErrorKind::InvalidInput, msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> io::Result<Config> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.listen_addr(), "0.0.0.0:5433");
        assert_eq!(config.wal_path(), PathBuf::from("./data/innkeep.wal"));
        assert!(config.load_tls_acceptor().unwrap().is_none());
    }

    #[test]
    fn overrides_from_lookup() {
        let config = from_pairs(&[
            ("INNKEEP_PORT", "6543"),
            ("INNKEEP_BIND", "127.0.0.1"),
            ("INNKEEP_DATA_DIR", "/var/lib/innkeep"),
            ("INNKEEP_PASSWORD", "s3cret"),
            ("INNKEEP_MAX_CONNECTIONS", "8"),
            ("INNKEEP_COMPACT_THRESHOLD", "50"),
            ("INNKEEP_COMPACT_INTERVAL_SECS", "5"),
            ("INNKEEP_METRICS_PORT", "9100"),
        ])
        .unwrap();
        assert_eq!(config.listen_addr(), "127.0.0.1:6543");
        assert_eq!(config.wal_path(), PathBuf::from("/var/lib/innkeep/innkeep.wal"));
        assert_eq!(config.password, "s3cret");
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.compact_threshold, 50);
        assert_eq!(config.compact_interval, Duration::from_secs(5));
        assert_eq!(config.metrics_port, Some(9100));
    }

    #[test]
    fn rejects_unparsable_numbers() {
        assert!(from_pairs(&[("INNKEEP_PORT", "not-a-port")]).is_err());
        assert!(from_pairs(&[("INNKEEP_PORT", "70000")]).is_err());
        assert!(from_pairs(&[("INNKEEP_MAX_CONNECTIONS", "0")]).is_err());
    }

    #[test]
    fn tls_needs_both_halves() {
        assert!(from_pairs(&[("INNKEEP_TLS_CERT", "cert.pem")]).is_err());
        assert!(from_pairs(&[("INNKEEP_TLS_KEY", "key.pem")]).is_err());
    }

    #[test]
    fn missing_tls_files_fail_to_load() {
        let config = from_pairs(&[
            ("INNKEEP_TLS_CERT", "/nonexistent/cert.pem"),
            ("INNKEEP_TLS_KEY", "/nonexistent/key.pem"),
        ])
        .unwrap();
        assert!(config.load_tls_acceptor().is_err());
    }
}
