//! Node and peer metadata, loaded once per process from a `file://`
//! directory tree.
//!
//! Grounded on `original_source/swpt_stomp/peer_data.py`
//! (`NodePeersDatabase`, `_LocalDirectory`, `_parse_node_type`,
//! `_parse_servers`, `_is_valid_hostname`) — there, stubbed with
//! `raise NotImplementedError`; here, actually implemented, since
//! `spec.md` §6 pins down the exact on-disk layout.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::subnet::Subnet;

/// The function a node plays in the settlement network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Accounting Authority.
    Aa,
    /// Creditors Agent.
    Ca,
    /// Debtors Agent.
    Da,
}

impl NodeRole {
    fn parse(s: &str) -> Result<NodeRole, DatabaseError> {
        match s {
            "Accounting Authorities" => Ok(NodeRole::Aa),
            "Creditors Agents" => Ok(NodeRole::Ca),
            "Debtors Agents" => Ok(NodeRole::Da),
            other => Err(DatabaseError::Malformed {
                path: "db/nodetype".into(),
                reason: format!("invalid node type: {other}"),
            }),
        }
    }
}

/// Metadata about the local node: this process's own identity.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub role: NodeRole,
    pub node_id: String,
    pub root_cert: Vec<u8>,
    pub creditors_subnet: Option<Subnet>,
    pub debtors_subnet: Option<Subnet>,
}

/// Metadata about a single peer node.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub role: NodeRole,
    pub node_id: String,
    pub servers: Vec<(String, u16)>,
    pub stomp_host: Option<String>,
    pub stomp_destination: Option<String>,
    pub root_cert: Vec<u8>,
    pub peer_cert: Vec<u8>,
    pub sub_cert: Option<Vec<u8>>,
    pub creditors_subnet: Subnet,
    pub debtors_subnet: Subnet,
}

/// Lookup of the local node's own metadata and of its peers'.
#[async_trait]
pub trait NodePeersDatabase: Send + Sync {
    async fn get_node_data(&self) -> Result<NodeInfo, DatabaseError>;
    async fn get_peer_data(&self, peer_node_id: &str) -> Result<PeerInfo, DatabaseError>;
}

/// Construct a `NodePeersDatabase` for a database URL. Only the
/// `file://` scheme is currently supported.
pub fn get_database_instance(url: &str) -> Result<LocalDirectory, DatabaseError> {
    let path = url
        .strip_prefix("file://")
        .ok_or_else(|| DatabaseError::UnsupportedUrl(url.to_owned()))?;
    Ok(LocalDirectory { root: PathBuf::from(path) })
}

/// A `file://`-scheme node/peer database: a directory tree containing
/// `root-ca.crt`, `db/nodeid`, `db/nodetype`, optional
/// `creditors-subnet.txt`/`debtors-subnet.txt`, and a `peers/<node_id>/`
/// subdirectory per peer.
pub struct LocalDirectory {
    root: PathBuf,
}

#[async_trait]
impl NodePeersDatabase for LocalDirectory {
    async fn get_node_data(&self) -> Result<NodeInfo, DatabaseError> {
        let root_cert = read_bytes(&self.root.join("root-ca.crt")).await?;
        let node_id = read_string(&self.root.join("db/nodeid")).await?;
        let role = NodeRole::parse(read_string(&self.root.join("db/nodetype")).await?.trim())?;

        let creditors_subnet = read_optional_subnet(&self.root.join("creditors-subnet.txt")).await?;
        let debtors_subnet = read_optional_subnet(&self.root.join("debtors-subnet.txt")).await?;

        Ok(NodeInfo {
            role,
            node_id: node_id.trim().to_owned(),
            root_cert,
            creditors_subnet,
            debtors_subnet,
        })
    }

    async fn get_peer_data(&self, peer_node_id: &str) -> Result<PeerInfo, DatabaseError> {
        let dir = self.root.join("peers").join(peer_node_id);
        if !dir.is_dir() {
            return Err(DatabaseError::UnknownPeer(peer_node_id.to_owned()));
        }

        let root_cert = read_bytes(&dir.join("root-ca.crt")).await?;
        let peer_cert = read_bytes(&dir.join("peercert.crt")).await?;
        let sub_cert = match tokio::fs::metadata(dir.join("sub.crt")).await {
            Ok(_) => Some(read_bytes(&dir.join("sub.crt")).await?),
            Err(_) => None,
        };

        let servers = parse_servers(&read_string(&dir.join("servers")).await?)?;
        let stomp_host = read_optional_string(&dir.join("stomp.host")).await?;
        let stomp_destination = read_optional_string(&dir.join("stomp.destination")).await?;

        let creditors_subnet = read_subnet(&dir.join("creditors-subnet.txt")).await?;
        let debtors_subnet = read_subnet(&dir.join("debtors-subnet.txt")).await?;

        // The role isn't separately recorded per peer in the directory
        // layout used here; peers are typed by which subnet file is
        // meaningful for them at the call site via `NodeInfo::role`.
        let role = NodeRole::parse(read_string(&dir.join("nodetype")).await.unwrap_or_default().trim())
            .unwrap_or(NodeRole::Aa);

        Ok(PeerInfo {
            role,
            node_id: peer_node_id.to_owned(),
            servers,
            stomp_host,
            stomp_destination,
            root_cert,
            peer_cert,
            sub_cert,
            creditors_subnet,
            debtors_subnet,
        })
    }
}

async fn read_bytes(path: &Path) -> Result<Vec<u8>, DatabaseError> {
    tokio::fs::read(path).await.map_err(|source| DatabaseError::Io {
        path: path.display().to_string(),
        source,
    })
}

async fn read_string(path: &Path) -> Result<String, DatabaseError> {
    let bytes = read_bytes(path).await?;
    String::from_utf8(bytes).map_err(|_| DatabaseError::Malformed {
        path: path.display().to_string(),
        reason: "not valid UTF-8".into(),
    })
}

async fn read_optional_string(path: &Path) -> Result<Option<String>, DatabaseError> {
    match tokio::fs::metadata(path).await {
        Ok(_) => Ok(Some(read_string(path).await?.trim().to_owned())),
        Err(_) => Ok(None),
    }
}

async fn read_subnet(path: &Path) -> Result<Subnet, DatabaseError> {
    match read_optional_string(path).await? {
        Some(s) => Subnet::parse(&s).map_err(|_| DatabaseError::Malformed {
            path: path.display().to_string(),
            reason: format!("invalid subnet: {s:?}"),
        }),
        None => Ok(Subnet::ANY),
    }
}

async fn read_optional_subnet(path: &Path) -> Result<Option<Subnet>, DatabaseError> {
    match read_optional_string(path).await? {
        Some(s) => Ok(Some(Subnet::parse(&s).map_err(|_| DatabaseError::Malformed {
            path: path.display().to_string(),
            reason: format!("invalid subnet: {s:?}"),
        })?)),
        None => Ok(None),
    }
}

fn parse_servers(s: &str) -> Result<Vec<(String, u16)>, DatabaseError> {
    let mut servers = Vec::new();
    for server in s.split_whitespace() {
        let (host, port_str) = server.split_once(':').ok_or_else(|| DatabaseError::Malformed {
            path: "servers".into(),
            reason: format!("invalid server: {server:?}"),
        })?;
        if !is_valid_hostname(host) {
            return Err(DatabaseError::Malformed {
                path: "servers".into(),
                reason: format!("invalid host: {host:?}"),
            });
        }
        let port: u16 = port_str.parse().map_err(|_| DatabaseError::Malformed {
            path: "servers".into(),
            reason: format!("invalid port: {port_str:?}"),
        })?;
        if port == 0 {
            return Err(DatabaseError::Malformed {
                path: "servers".into(),
                reason: format!("invalid port: {port_str:?}"),
            });
        }
        servers.push((host.to_owned(), port));
    }
    Ok(servers)
}

fn is_valid_hostname(hostname: &str) -> bool {
    let hostname = hostname.strip_suffix('.').unwrap_or(hostname);
    if hostname.is_empty() || hostname.len() > 253 {
        return false;
    }
    hostname.split('.').all(is_valid_dns_label)
}

fn is_valid_dns_label(label: &str) -> bool {
    if label.is_empty() || label.len() > 63 {
        return false;
    }
    let bytes = label.as_bytes();
    let alnum_hyphen = bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-');
    alnum_hyphen && bytes[0] != b'-' && bytes[bytes.len() - 1] != b'-'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostnames() {
        assert!(is_valid_hostname("example.com"));
        assert!(is_valid_hostname("example.com."));
        assert!(!is_valid_hostname("-example.com"));
        assert!(!is_valid_hostname("example-.com"));
        assert!(!is_valid_hostname(""));
    }

    #[test]
    fn servers_parse() {
        let s = parse_servers("host1:1234 host2:5678").unwrap();
        assert_eq!(s, vec![("host1".to_owned(), 1234), ("host2".to_owned(), 5678)]);
    }

    #[test]
    fn servers_reject_bad_port() {
        assert!(parse_servers("host1:notaport").is_err());
    }

    #[tokio::test]
    async fn loads_node_and_peer_from_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        tokio::fs::write(root.join("root-ca.crt"), b"ROOTCA").await.unwrap();
        tokio::fs::create_dir_all(root.join("db")).await.unwrap();
        tokio::fs::write(root.join("db/nodeid"), b"node1\n").await.unwrap();
        tokio::fs::write(root.join("db/nodetype"), b"Creditors Agents\n")
            .await
            .unwrap();
        tokio::fs::write(root.join("creditors-subnet.txt"), b"01").await.unwrap();

        let peer_dir = root.join("peers/peer1");
        tokio::fs::create_dir_all(&peer_dir).await.unwrap();
        tokio::fs::write(peer_dir.join("root-ca.crt"), b"PEERROOT").await.unwrap();
        tokio::fs::write(peer_dir.join("peercert.crt"), b"PEERCERT").await.unwrap();
        tokio::fs::write(peer_dir.join("servers"), b"host1:1234").await.unwrap();
        tokio::fs::write(peer_dir.join("stomp.host"), b"my.host").await.unwrap();
        tokio::fs::write(peer_dir.join("stomp.destination"), b"/exchange/dest")
            .await
            .unwrap();
        tokio::fs::write(peer_dir.join("creditors-subnet.txt"), b"02").await.unwrap();
        tokio::fs::write(peer_dir.join("debtors-subnet.txt"), b"1234abcd").await.unwrap();

        let db = get_database_instance(&format!("file://{}", root.display())).unwrap();
        let node = db.get_node_data().await.unwrap();
        assert_eq!(node.node_id, "node1");
        assert_eq!(node.role, NodeRole::Ca);
        assert_eq!(node.creditors_subnet, Some(Subnet::parse("01").unwrap()));

        let peer = db.get_peer_data("peer1").await.unwrap();
        assert_eq!(peer.servers, vec![("host1".to_owned(), 1234)]);
        assert_eq!(peer.stomp_host.as_deref(), Some("my.host"));
        assert_eq!(peer.creditors_subnet, Subnet::parse("02").unwrap());
    }

    #[tokio::test]
    async fn unknown_peer_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let db = get_database_instance(&format!("file://{}", dir.path().display())).unwrap();
        assert!(matches!(
            db.get_peer_data("ghost").await,
            Err(DatabaseError::UnknownPeer(_))
        ));
    }
}
