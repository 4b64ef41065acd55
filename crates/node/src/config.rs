//! Node configuration.
//!
//! Read from an `ident = value` file (see `benchnet_common::conf`):
//!
//! ```text
//! db       = benchnode.db        # optional
//! server   = bench.example.com   # optional
//! clientid = 1                   # required
//! nodeid   = 42                  # required
//! key      = 00112233...         # required, 64 hex digits
//! ```

use std::path::Path;

use benchnet_common::conf::{self, ConfError, Value, Var};

/// A 32-byte network key given as 64 hex digits.
#[derive(Default)]
struct KeyValue(Option<[u8; 32]>);

impl Value for KeyValue {
    fn set(&mut self, raw: &str) -> Result<(), String> {
        let mut key = [0u8; 32];
        if raw.len() != 64 || hex::decode_to_slice(raw, &mut key).is_err() {
            return Err("invalid key (must be 64 hexadecimal digits)".into());
        }
        self.0 = Some(key);
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Local database file.
    pub db: String,
    /// Server host to dial.
    pub server: String,
    /// Legacy client id, sent but not interpreted by the server.
    pub client_id: u64,
    /// This node's id in the server's catalog.
    pub node_id: u64,
    /// Network key shared with the server.
    pub key: [u8; 32],
}

impl NodeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfError> {
        let mut db = "benchnode.db".to_string();
        let mut server = "localhost".to_string();
        let mut client_id: u64 = 0;
        let mut node_id: u64 = 0;
        let mut key = KeyValue::default();
        conf::parse_file(
            path,
            &mut [
                Var::new("db", &mut db),
                Var::new("server", &mut server),
                Var::required("clientid", &mut client_id),
                Var::required("nodeid", &mut node_id),
                Var::required("key", &mut key),
            ],
        )?;
        Ok(NodeConfig {
            db,
            server,
            client_id,
            node_id,
            // required var; parse_file errored if unset
            key: key.0.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_conf(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().expect("temp file");
        write!(f, "{content}").expect("write");
        f
    }

    #[test]
    fn full_config_loads() {
        let f = write_conf(
            "db = /tmp/n.db\n\
             server = bench.example.com\n\
             clientid = 1\n\
             nodeid = 0x2a\n\
             key = 000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f\n",
        );
        let cfg = NodeConfig::load(f.path()).expect("load");
        assert_eq!(cfg.db, "/tmp/n.db");
        assert_eq!(cfg.server, "bench.example.com");
        assert_eq!(cfg.client_id, 1);
        assert_eq!(cfg.node_id, 42);
        assert_eq!(cfg.key[0..4], [0, 1, 2, 3]);
    }

    #[test]
    fn defaults_apply() {
        let f = write_conf(&format!(
            "clientid = 1\nnodeid = 2\nkey = {}\n",
            "ab".repeat(32)
        ));
        let cfg = NodeConfig::load(f.path()).expect("load");
        assert_eq!(cfg.db, "benchnode.db");
        assert_eq!(cfg.server, "localhost");
    }

    #[test]
    fn missing_required_fails() {
        let f = write_conf("clientid = 1\n");
        let err = NodeConfig::load(f.path()).unwrap_err();
        assert!(err.to_string().contains("required but not set"));
    }

    #[test]
    fn bad_key_fails() {
        let f = write_conf("clientid = 1\nnodeid = 2\nkey = abcd\n");
        let err = NodeConfig::load(f.path()).unwrap_err();
        assert!(err.to_string().contains("64 hexadecimal digits"));
    }
}
