//! The peer server: connection accept loop, request dispatcher, home and
//! cache request paths, and the chained write-update coherence engine.

use crate::config::{ClusterConfig, ConfigError};
use crate::memory::{Cache, MemoryError, MemoryItem, MemoryManager};
use crate::net::{frame, rpc, CacheLine, NetError, Reply, Request};
use crate::types::{Address, ItemStatus, NetAddress, Value};
use serde_json::Value as Json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// One cluster member. Owns the memory and lock tables for its address
/// range and a direct-mapped cache of remote addresses; forwards what it
/// does not own.
pub struct Server {
    config: Arc<ClusterConfig>,
    self_address: NetAddress,
    memory: MemoryManager,
    cache: Cache,
}

impl Server {
    pub fn new(config: Arc<ClusterConfig>, index: usize) -> Result<Arc<Self>, ConfigError> {
        let self_address = config.server(index)?.clone();
        let range = config.range(index)?;
        Ok(Arc::new(Self {
            memory: MemoryManager::new(range),
            cache: Cache::new(config.cache_size()),
            self_address,
            config,
        }))
    }

    pub fn address(&self) -> &NetAddress {
        &self.self_address
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Bind the configured endpoint and serve forever.
    pub async fn run(self: Arc<Self>) -> Result<(), NetError> {
        let endpoint = self
            .self_address
            .endpoint()
            .ok_or_else(|| NetError::BadEndpoint(self.self_address.clone()))?;
        let listener = TcpListener::bind(endpoint.as_str()).await?;
        self.run_on(listener).await
    }

    /// Serve on an already-bound listener. Useful when the caller picked an
    /// ephemeral port and built the configuration from it.
    pub async fn run_on(self: Arc<Self>, listener: TcpListener) -> Result<(), NetError> {
        info!(
            server = %self.self_address,
            range = ?self.memory.range(),
            "listening"
        );
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.handle_connection(stream, peer).await;
                    });
                }
                Err(e) => {
                    warn!(server = %self.self_address, error = %e, "accept failed");
                }
            }
        }
    }

    /// One request, one reply, until `disconnect` or an I/O error. The
    /// dispatcher keeps no state across requests; any failure here ends
    /// only this connection.
    async fn handle_connection(self: Arc<Self>, mut stream: TcpStream, peer: SocketAddr) {
        debug!(server = %self.self_address, %peer, "connection opened");
        loop {
            let body = match frame::read_frame(&mut stream).await {
                Ok(Some(body)) => body,
                Ok(None) => break,
                Err(e) => {
                    debug!(server = %self.self_address, %peer, error = %e, "receive failed");
                    break;
                }
            };

            let decoded = serde_json::from_slice::<Json>(&body)
                .map_err(NetError::from)
                .and_then(|wire| Request::from_wire(&wire));
            let (reply, disconnect) = match decoded {
                Ok(Request::Disconnect) => (Reply::success("disconnected"), true),
                Ok(request) => (self.dispatch(&peer, request).await, false),
                Err(e) => (Reply::error(e.to_string()), false),
            };

            if let Err(e) = frame::write_message(&mut stream, &reply).await {
                debug!(server = %self.self_address, %peer, error = %e, "send failed");
                break;
            }
            if disconnect {
                break;
            }
        }
        debug!(server = %self.self_address, %peer, "connection closed");
    }

    async fn dispatch(&self, peer: &SocketAddr, request: Request) -> Reply {
        match request {
            Request::Read {
                holder,
                address,
                cascade,
                lease_ms,
            } => {
                self.serve_read(peer, holder, address, cascade, lease_ms.map(Duration::from_millis))
                    .await
            }
            Request::Write {
                holder,
                address,
                data,
                cascade,
            } => self.serve_write(peer, holder, address, data, cascade).await,
            Request::AcquireLock {
                address,
                lease_ms,
                cascade,
            } => self.serve_acquire_lock(peer, address, lease_ms, cascade).await,
            Request::ReleaseLock {
                address,
                ltag,
                cascade,
            } => self.serve_release_lock(peer, address, ltag, cascade).await,
            Request::UpdateCache {
                chain,
                address,
                data,
                status,
                wtag,
            } => {
                self.serve_update_cache(peer, chain, address, data, status, wtag)
                    .await
            }
            Request::DumpCache => self.serve_dump_cache().await,
            // The connection loop answers disconnect itself so it can hang
            // up after replying; this arm keeps dispatch complete for
            // direct callers.
            Request::Disconnect => Reply::success("disconnected"),
            Request::Unknown(kind) => {
                debug!(server = %self.self_address, %peer, kind = %kind, "invalid operation");
                Reply::invalid_operation()
            }
        }
    }

    // =========================================================================
    // READ PATH
    // =========================================================================

    async fn serve_read(
        &self,
        peer: &SocketAddr,
        holder: NetAddress,
        address: Address,
        cascade: bool,
        lease: Option<Duration>,
    ) -> Reply {
        debug!(server = %self.self_address, client = %peer, address, cascade, "read request");
        let reply = self.route_read(peer, holder, address, cascade, lease).await;
        debug!(
            server = %self.self_address,
            client = %peer,
            address,
            status = reply.status.code(),
            wtag = reply.wtag,
            ltag = reply.ltag,
            "read response"
        );
        reply
    }

    /// Classify the address as home, cached, or remote, and serve it.
    /// Stale-cache detection evicts and restarts the classification, so the
    /// whole path is a loop.
    async fn route_read(
        &self,
        peer: &SocketAddr,
        holder: NetAddress,
        address: Address,
        cascade: bool,
        lease: Option<Duration>,
    ) -> Reply {
        loop {
            let Some(home) = self.config.home_server(address) else {
                return Reply::invalid_address();
            };

            if *home == self.self_address {
                return match self.home_read(&holder, address, cascade).await {
                    Ok(reply) => reply,
                    Err(e) => Reply::error(e.to_string()),
                };
            }

            if let Some(entry) = self.cache.read(address).await {
                match self.validate_cached(peer, address, entry, lease).await {
                    Some(reply) => return reply,
                    None => continue,
                }
            }

            if !cascade {
                return Reply::error(format!(
                    "read host {home} is not the server address {}",
                    self.self_address
                ));
            }

            let request = Request::Read {
                holder: self.self_address.clone(),
                address,
                cascade: false,
                lease_ms: None,
            };
            let reply = self.remote(home, request, "read").await;
            if reply.is_success() {
                if let (Some(istatus), Some(wtag)) = (reply.istatus, reply.wtag) {
                    let data = reply.data.clone().unwrap_or_default();
                    self.cache
                        .write(address, MemoryItem::new(data, istatus, wtag))
                        .await;
                }
            }
            return reply;
        }
    }

    async fn home_read(
        &self,
        holder: &NetAddress,
        address: Address,
        cascade: bool,
    ) -> Result<Reply, MemoryError> {
        let (ltag, _) = self.memory.acquire_lock(address, None).await?;
        let result = async {
            if !cascade && *holder != self.self_address {
                self.memory.add_copy_holder(address, holder.clone()).await?;
            }
            self.memory.read(address).await
        }
        .await;
        let _ = self.memory.release_lock(address, ltag).await;
        Ok(Reply::read_ok(result?, ltag))
    }

    /// Lease-lock the home, compare write tags, and serve from cache when
    /// fresh. `None` means the entry was evicted and the read must restart.
    async fn validate_cached(
        &self,
        peer: &SocketAddr,
        address: Address,
        entry: MemoryItem,
        lease: Option<Duration>,
    ) -> Option<Reply> {
        let lease = lease.unwrap_or_else(|| self.config.lease_timeout());
        let acquired = self
            .serve_acquire_lock(peer, address, lease.as_millis() as u64, true)
            .await;
        if !acquired.is_success() {
            return Some(acquired);
        }
        let (Some(remote_ltag), Some(remote_wtag)) = (acquired.ltag, acquired.wtag) else {
            return Some(Reply::error("malformed acquire reply from home server"));
        };

        if remote_wtag != entry.wtag {
            // Stale copy: evict, give the lease back, re-classify.
            debug!(server = %self.self_address, address, "cached copy stale, evicting");
            self.cache.remove(address).await;
            let _ = self.serve_release_lock(peer, address, remote_ltag, true).await;
            return None;
        }

        let released = self.serve_release_lock(peer, address, remote_ltag, true).await;
        if !released.is_success() {
            self.cache.remove(address).await;
            return Some(Reply::error("failed to release remote lock"));
        }
        match released.wtag {
            Some(wtag) if wtag == entry.wtag => Some(Reply::read_ok(entry, remote_ltag)),
            _ => {
                // A writer slipped in between the acquire and the release.
                self.cache.remove(address).await;
                None
            }
        }
    }

    // =========================================================================
    // WRITE PATH
    // =========================================================================

    async fn serve_write(
        &self,
        peer: &SocketAddr,
        holder: NetAddress,
        address: Address,
        data: Value,
        cascade: bool,
    ) -> Reply {
        debug!(server = %self.self_address, client = %peer, address, cascade, "write request");
        let reply = self.route_write(holder, address, data, cascade).await;
        debug!(
            server = %self.self_address,
            client = %peer,
            address,
            status = reply.status.code(),
            "write response"
        );
        reply
    }

    async fn route_write(
        &self,
        holder: NetAddress,
        address: Address,
        data: Value,
        cascade: bool,
    ) -> Reply {
        let Some(home) = self.config.home_server(address) else {
            return Reply::invalid_address();
        };

        if *home == self.self_address {
            return match self.home_write(&holder, address, data, cascade).await {
                Ok(reply) => reply,
                Err(e) => Reply::error(e.to_string()),
            };
        }

        if !cascade {
            return Reply::error(format!(
                "write host {home} is not the server address {}",
                self.self_address
            ));
        }

        // The forwarder's own cache is left alone; freshness comes back via
        // the home's coherence push or the next read.
        let request = Request::Write {
            holder: self.self_address.clone(),
            address,
            data,
            cascade: false,
        };
        self.remote(home, request, "write").await
    }

    async fn home_write(
        &self,
        holder: &NetAddress,
        address: Address,
        data: Value,
        cascade: bool,
    ) -> Result<Reply, MemoryError> {
        let (ltag, _) = self.memory.acquire_lock(address, None).await?;
        let result = async {
            if !cascade && *holder != self.self_address {
                self.memory.add_copy_holder(address, holder.clone()).await?;
            }
            let item = self.memory.write(address, data).await?;
            if item.status == ItemStatus::Shared {
                self.push_update(address).await?;
            }
            Ok(())
        }
        .await;
        let _ = self.memory.release_lock(address, ltag).await;
        result?;
        Ok(Reply::success("write successful"))
    }

    // =========================================================================
    // LOCK PATH
    // =========================================================================

    async fn serve_acquire_lock(
        &self,
        peer: &SocketAddr,
        address: Address,
        lease_ms: u64,
        cascade: bool,
    ) -> Reply {
        debug!(
            server = %self.self_address,
            client = %peer,
            address,
            lease_ms,
            cascade,
            "acquire lock request"
        );
        let reply = self.route_acquire_lock(address, lease_ms, cascade).await;
        debug!(
            server = %self.self_address,
            client = %peer,
            address,
            status = reply.status.code(),
            ret_val = reply.ret_val,
            ltag = reply.ltag,
            wtag = reply.wtag,
            "acquire lock response"
        );
        reply
    }

    async fn route_acquire_lock(&self, address: Address, lease_ms: u64, cascade: bool) -> Reply {
        let Some(home) = self.config.home_server(address) else {
            return Reply::invalid_address();
        };

        if *home == self.self_address {
            let lease = (lease_ms > 0).then(|| Duration::from_millis(lease_ms));
            return match self.memory.acquire_lock(address, lease).await {
                Ok((ltag, wtag)) => Reply::acquire_ok(ltag, wtag),
                Err(e) => Reply::error(e.to_string()),
            };
        }

        if !cascade {
            return Reply::error(format!(
                "lock host {home} is not the server address {}",
                self.self_address
            ));
        }

        let request = Request::AcquireLock {
            address,
            lease_ms,
            cascade: false,
        };
        self.remote(home, request, "acquire lock").await
    }

    async fn serve_release_lock(
        &self,
        peer: &SocketAddr,
        address: Address,
        ltag: u64,
        cascade: bool,
    ) -> Reply {
        debug!(
            server = %self.self_address,
            client = %peer,
            address,
            ltag,
            cascade,
            "release lock request"
        );
        let reply = self.route_release_lock(address, ltag, cascade).await;
        debug!(
            server = %self.self_address,
            client = %peer,
            address,
            status = reply.status.code(),
            ret_val = reply.ret_val,
            ltag = reply.ltag,
            wtag = reply.wtag,
            "release lock response"
        );
        reply
    }

    async fn route_release_lock(&self, address: Address, ltag: u64, cascade: bool) -> Reply {
        let Some(home) = self.config.home_server(address) else {
            return Reply::invalid_address();
        };

        if *home == self.self_address {
            return match self.memory.release_lock(address, ltag).await {
                Ok((released, ltag, wtag)) => Reply::release_done(released, ltag, wtag),
                Err(e) => Reply::error(e.to_string()),
            };
        }

        if !cascade {
            return Reply::error(format!(
                "lock host {home} is not the server address {}",
                self.self_address
            ));
        }

        let request = Request::ReleaseLock {
            address,
            ltag,
            cascade: false,
        };
        self.remote(home, request, "release lock").await
    }

    // =========================================================================
    // COHERENCE ENGINE
    // =========================================================================

    async fn serve_update_cache(
        &self,
        peer: &SocketAddr,
        chain: Vec<NetAddress>,
        address: Address,
        data: Value,
        status: ItemStatus,
        wtag: u64,
    ) -> Reply {
        debug!(
            server = %self.self_address,
            client = %peer,
            address,
            wtag,
            hops = chain.len(),
            "update cache request"
        );
        let reply = self
            .route_update_cache(chain, address, data, status, wtag)
            .await;
        debug!(
            server = %self.self_address,
            client = %peer,
            address,
            status = reply.status.code(),
            "update cache response"
        );
        reply
    }

    /// Recipient side of the chained update: install the item (unless we
    /// are the home), then pass the shortened chain to the next holder. A
    /// failed hop is annotated with the first endpoint that did not answer.
    async fn route_update_cache(
        &self,
        mut chain: Vec<NetAddress>,
        address: Address,
        data: Value,
        status: ItemStatus,
        wtag: u64,
    ) -> Reply {
        if self.config.home_index(address).is_none() {
            return Reply::invalid_address();
        }

        let item = MemoryItem::new(data, status, wtag);
        if !self.memory.owns(address) {
            self.cache.write(address, item.clone()).await;
        }

        if chain.is_empty() {
            return Reply::success("cache updated");
        }
        let next = chain.remove(0);
        self.update_next_copy(next, chain, address, &item).await
    }

    /// Driver side, run by the home under the address lock after a shared
    /// write: push the new item down the holder chain and prune everything
    /// from the first failed hop onward, restoring "every remaining holder
    /// observed the write".
    async fn push_update(&self, address: Address) -> Result<(), MemoryError> {
        let chain = self.memory.copy_holders(address).await?;
        if chain.is_empty() {
            return Ok(());
        }
        let item = self.memory.read(address).await?;

        let head = chain[0].clone();
        let rest = chain[1..].to_vec();
        let reply = self.update_next_copy(head.clone(), rest, address, &item).await;

        if !reply.is_success() {
            let failed = reply.server_address.unwrap_or(head);
            let from = chain.iter().position(|h| *h == failed).unwrap_or(0);
            warn!(
                server = %self.self_address,
                address,
                failed = %failed,
                pruned = chain.len() - from,
                "update chain broken, pruning holders"
            );
            for holder in &chain[from..] {
                self.memory.remove_copy_holder(address, holder).await?;
            }
        }
        Ok(())
    }

    async fn update_next_copy(
        &self,
        next: NetAddress,
        rest: Vec<NetAddress>,
        address: Address,
        item: &MemoryItem,
    ) -> Reply {
        let request = Request::UpdateCache {
            chain: rest,
            address,
            data: item.data.clone(),
            status: item.status,
            wtag: item.wtag,
        };
        let mut reply = self.remote(&next, request, "update cache").await;
        if !reply.is_success() && reply.server_address.is_none() {
            reply.server_address = Some(next);
        }
        reply
    }

    // =========================================================================
    // DUMP
    // =========================================================================

    async fn serve_dump_cache(&self) -> Reply {
        let lines = self
            .cache
            .dump()
            .await
            .into_iter()
            .map(|(address, item)| CacheLine { address, item })
            .collect();
        Reply::cache_dump(lines)
    }

    /// Synchronous peer request over a fresh connection; all transport
    /// failures collapse into an `ERROR` reply.
    async fn remote(&self, target: &NetAddress, request: Request, op: &str) -> Reply {
        match rpc::call(target, &request, self.config.connection_timeout()).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(server = %self.self_address, %target, op, error = %e, "peer call failed");
                Reply::error(format!("failed to reach {target}: {e}"))
            }
        }
    }
}
