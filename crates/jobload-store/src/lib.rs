//! SSH-tunneled MongoDB writer for normalized job records.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobload_core::{IdGenerator, NormalizedJobRecord};
use mongodb::bson::{self, doc, oid::ObjectId, Bson, Document};
use mongodb::Client;
use russh::client;
use russh_keys::agent::client::AgentClient;
use russh_keys::key::PublicKey;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "jobload-store";

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_LOCAL_HOST: &str = "127.0.0.1";
pub const DEFAULT_LOCAL_PORT: u16 = 27000;
pub const DEFAULT_DST_HOST: &str = "127.0.0.1";
pub const DEFAULT_DST_PORT: u16 = 27017;
pub const DEFAULT_DATABASE: &str = "khidma";
pub const DEFAULT_COLLECTION: &str = "jobs";
pub const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Anything that can persist a batch of normalized records.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn write(&self, records: &[NormalizedJobRecord]) -> anyhow::Result<InsertReport>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertReport {
    pub inserted_ids: Vec<String>,
}

/// Mongo-style identifiers: 24 hex characters, matching what the web app already stores.
#[derive(Debug, Default, Clone, Copy)]
pub struct ObjectIdGenerator;

impl IdGenerator for ObjectIdGenerator {
    fn next_id(&self) -> String {
        ObjectId::new().to_hex()
    }
}

#[derive(Clone)]
pub struct TunnelConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub agent_socket: Option<PathBuf>,
    pub local_host: String,
    pub local_port: u16,
    pub dst_host: String,
    pub dst_port: u16,
    /// Reject server keys that are not already in `~/.ssh/known_hosts`.
    pub strict_host_key: bool,
}

impl TunnelConfig {
    pub fn local_endpoint(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }
}

impl fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("agent_socket", &self.agent_socket)
            .field("local_host", &self.local_host)
            .field("local_port", &self.local_port)
            .field("dst_host", &self.dst_host)
            .field("dst_port", &self.dst_port)
            .field("strict_host_key", &self.strict_host_key)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub tunnel: TunnelConfig,
    pub database: String,
    pub collection: String,
    pub server_selection_timeout: Duration,
}

impl StoreConfig {
    /// Connection string pointing at the tunnel's local end. `directConnection`
    /// stops the driver from following replica-set members around the tunnel.
    pub fn connection_uri(&self) -> String {
        format!(
            "mongodb://{}:{}/{}?directConnection=true&serverSelectionTimeoutMS={}",
            self.tunnel.local_host,
            self.tunnel.local_port,
            self.database,
            self.server_selection_timeout.as_millis()
        )
    }
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("ssh transport error: {0}")]
    Ssh(#[from] russh::Error),
    #[error("ssh key error: {0}")]
    Keys(#[from] russh_keys::Error),
    #[error("host key for {host}:{port} is not in known_hosts")]
    UnknownHostKey { host: String, port: u16 },
    #[error("authentication rejected for {username}@{host}")]
    AuthRejected { username: String, host: String },
    #[error("binding local endpoint {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("encoding job record {id} as BSON: {source}")]
    Encode {
        id: String,
        #[source]
        source: bson::ser::Error,
    },
    #[error("DB connection error for {uri}: {source}")]
    Connect {
        uri: String,
        #[source]
        source: mongodb::error::Error,
    },
    #[error("inserting into {collection}: {source}")]
    Insert {
        collection: String,
        #[source]
        source: mongodb::error::Error,
    },
}

struct TunnelClient {
    host: String,
    port: u16,
    strict_host_key: bool,
}

#[async_trait]
impl client::Handler for TunnelClient {
    type Error = TunnelError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        match russh_keys::check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(true) => Ok(true),
            Ok(false) if !self.strict_host_key => {
                warn!(host = %self.host, port = self.port, "accepting host key not present in known_hosts");
                Ok(true)
            }
            Ok(false) => Err(TunnelError::UnknownHostKey {
                host: self.host.clone(),
                port: self.port,
            }),
            Err(err) => Err(err.into()),
        }
    }
}

type Session = client::Handle<TunnelClient>;

/// Local TCP endpoint forwarded over SSH to a remote port.
pub struct SshTunnel {
    local_addr: SocketAddr,
    session: Arc<Session>,
    forwarder: JoinHandle<()>,
}

impl SshTunnel {
    pub async fn open(config: &TunnelConfig) -> Result<Self, TunnelError> {
        let handler = TunnelClient {
            host: config.host.clone(),
            port: config.port,
            strict_host_key: config.strict_host_key,
        };
        let ssh_config = Arc::new(client::Config::default());
        let mut session =
            client::connect(ssh_config, (config.host.as_str(), config.port), handler).await?;

        if !authenticate(&mut session, config).await? {
            return Err(TunnelError::AuthRejected {
                username: config.username.clone(),
                host: config.host.clone(),
            });
        }

        let endpoint = config.local_endpoint();
        let listener = TcpListener::bind(&endpoint)
            .await
            .map_err(|source| TunnelError::Bind {
                endpoint: endpoint.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| TunnelError::Bind {
            endpoint: endpoint.clone(),
            source,
        })?;

        let session = Arc::new(session);
        let span = info_span!("ssh_tunnel", %local_addr, dst_host = %config.dst_host, dst_port = config.dst_port);
        let forwarder = tokio::spawn(
            forward_connections(
                listener,
                Arc::clone(&session),
                config.dst_host.clone(),
                config.dst_port,
            )
            .instrument(span),
        );

        info!(%local_addr, host = %config.host, "ssh tunnel established");
        Ok(Self {
            local_addr,
            session,
            forwarder,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn close(self) {
        self.forwarder.abort();
        if let Err(err) = self
            .session
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            debug!(error = %err, "ssh disconnect");
        }
        info!("ssh tunnel closed");
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

async fn authenticate(session: &mut Session, config: &TunnelConfig) -> Result<bool, TunnelError> {
    if let Some(socket) = &config.agent_socket {
        match AgentClient::connect_uds(socket).await {
            Ok(mut agent) => {
                let identities = agent.request_identities().await?;
                for key in identities {
                    let (returned, outcome) = session
                        .authenticate_future(config.username.clone(), key, agent)
                        .await;
                    agent = returned;
                    match outcome {
                        Ok(true) => return Ok(true),
                        Ok(false) => {}
                        Err(err) => debug!(error = ?err, "agent key signing failed"),
                    }
                }
            }
            Err(err) => warn!(error = %err, socket = %socket.display(), "ssh agent unavailable"),
        }
    }

    match &config.password {
        Some(password) => Ok(session
            .authenticate_password(config.username.clone(), password.clone())
            .await?),
        None => Ok(false),
    }
}

async fn forward_connections(
    listener: TcpListener,
    session: Arc<Session>,
    dst_host: String,
    dst_port: u16,
) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = %err, "accepting tunnel connection");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
        };
        let session = Arc::clone(&session);
        let dst_host = dst_host.clone();
        tokio::spawn(
            async move {
                if let Err(err) = forward_one(socket, peer, &session, dst_host, dst_port).await {
                    warn!(error = %err, "tunnel forwarding ended with error");
                }
            }
            .instrument(info_span!("tunnel_conn", %peer)),
        );
    }
}

async fn forward_one(
    mut socket: TcpStream,
    peer: SocketAddr,
    session: &Session,
    dst_host: String,
    dst_port: u16,
) -> Result<(), TunnelError> {
    let channel = session
        .channel_open_direct_tcpip(
            dst_host,
            u32::from(dst_port),
            peer.ip().to_string(),
            u32::from(peer.port()),
        )
        .await?;
    let mut stream = channel.into_stream();
    match tokio::io::copy_bidirectional(&mut socket, &mut stream).await {
        Ok((up, down)) => debug!(up, down, "tunnel connection closed"),
        Err(err) => debug!(error = %err, "tunnel connection reset"),
    }
    Ok(())
}

/// Encode a record for the `jobs` collection. Timestamps are stored as BSON dates.
pub fn to_document(record: &NormalizedJobRecord) -> Result<Document, StoreError> {
    let mut document = bson::to_document(record).map_err(|source| StoreError::Encode {
        id: record.id.clone(),
        source,
    })?;
    document.insert(
        "createdAt",
        bson::DateTime::from_millis(record.created_at.timestamp_millis()),
    );
    document.insert(
        "updatedAt",
        bson::DateTime::from_millis(record.updated_at.timestamp_millis()),
    );
    Ok(document)
}

fn bson_id_string(value: Bson) -> String {
    match value {
        Bson::String(s) => s,
        Bson::ObjectId(oid) => oid.to_hex(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct MongoJobWriter {
    config: StoreConfig,
}

impl MongoJobWriter {
    pub fn new(config: StoreConfig) -> Self {
        Self { config }
    }

    /// Tunnel, connect, insert, then release the client and tunnel whatever the outcome.
    pub async fn write_records(
        &self,
        records: &[NormalizedJobRecord],
    ) -> Result<InsertReport, StoreError> {
        if records.is_empty() {
            return Ok(InsertReport::default());
        }

        let span = info_span!(
            "store_write",
            records = records.len(),
            database = %self.config.database,
            collection = %self.config.collection
        );

        async {
            // A failed tunnel is reported, the connection attempt still goes ahead.
            let tunnel = match SshTunnel::open(&self.config.tunnel).await {
                Ok(tunnel) => {
                    debug!(local = %tunnel.local_addr(), "db traffic goes through tunnel");
                    Some(tunnel)
                }
                Err(err) => {
                    error!(error = %err, "SSH connection error");
                    None
                }
            };

            let outcome = self.insert_through_endpoint(records).await;

            if let Some(tunnel) = tunnel {
                tunnel.close().await;
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn insert_through_endpoint(
        &self,
        records: &[NormalizedJobRecord],
    ) -> Result<InsertReport, StoreError> {
        let documents = records
            .iter()
            .map(to_document)
            .collect::<Result<Vec<_>, _>>()?;

        let uri = self.config.connection_uri();
        let client = Client::with_uri_str(&uri).await.map_err(|source| {
            error!(error = %source, "DB connection error");
            StoreError::Connect {
                uri: uri.clone(),
                source,
            }
        })?;

        let database = client.database(&self.config.database);
        let outcome = async {
            database
                .run_command(doc! { "ping": 1 })
                .await
                .map_err(|source| {
                    error!(error = %source, "DB connection error");
                    StoreError::Connect {
                        uri: uri.clone(),
                        source,
                    }
                })?;
            info!("DB connection successful");

            let result = database
                .collection::<Document>(&self.config.collection)
                .insert_many(documents)
                .await
                .map_err(|source| StoreError::Insert {
                    collection: self.config.collection.clone(),
                    source,
                })?;

            let mut ids = result.inserted_ids.into_iter().collect::<Vec<_>>();
            ids.sort_by_key(|(index, _)| *index);
            let report = InsertReport {
                inserted_ids: ids.into_iter().map(|(_, id)| bson_id_string(id)).collect(),
            };
            info!(inserted = report.inserted_ids.len(), "Document inserted");
            Ok::<_, StoreError>(report)
        }
        .await;

        drop(database);
        client.shutdown().await;
        info!("db closed");
        outcome
    }
}

#[async_trait]
impl RecordSink for MongoJobWriter {
    async fn write(&self, records: &[NormalizedJobRecord]) -> anyhow::Result<InsertReport> {
        Ok(self.write_records(records).await?)
    }
}
