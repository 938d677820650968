//! Routing table and the shared holder the reloader swaps it into
//!
//! A [`RoutingTable`] is immutable once built. The [`TableHolder`] keeps the
//! current one behind an `RwLock<Arc<_>>`: readers clone the `Arc` and drop the
//! lock immediately, the reloader takes the write lock only for the pointer
//! swap. A request that grabbed a snapshot keeps using it even if a newer table
//! is installed while it is in flight.

use crate::error::LoadError;
use crate::loader::load_table;
use crate::route::{Backend, Route};
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

/// Ordered routes built from one snapshot of the route file
#[derive(Debug, Clone)]
pub struct RoutingTable {
    routes: Vec<Route>,
    /// Modification time of the route file this table was built from
    version: SystemTime,
}

impl RoutingTable {
    pub fn new(routes: Vec<Route>, version: SystemTime) -> Self {
        Self { routes, version }
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn version(&self) -> SystemTime {
        self.version
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Number of routes that have a usable backend
    pub fn routable_count(&self) -> usize {
        self.routes.iter().filter(|r| r.is_routable()).count()
    }

    /// First route, in declaration order, that matches `hostname` and has a
    /// usable backend.
    pub fn find(&self, hostname: &str) -> Option<&Route> {
        self.routes
            .iter()
            .filter(|route| route.is_routable())
            .find(|route| route.matches(hostname))
    }

    /// Backend for `hostname`, or `None` when the request should get a 404
    pub fn lookup(&self, hostname: &str) -> Option<&Backend> {
        self.find(hostname).map(Route::backend)
    }
}

/// Shared handle to the holder
pub type SharedTable = Arc<TableHolder>;

/// Holds the routing table currently in effect
#[derive(Debug)]
pub struct TableHolder {
    current: RwLock<Arc<RoutingTable>>,
}

impl TableHolder {
    pub fn new(table: RoutingTable) -> Arc<Self> {
        Arc::new(Self {
            current: RwLock::new(Arc::new(table)),
        })
    }

    /// Perform the initial load of `path`.
    ///
    /// Unlike later reloads, a failure here is returned to the caller so that
    /// the server never starts without a table.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Arc<Self>, LoadError> {
        Ok(Self::new(load_table(path.as_ref())?))
    }

    /// Snapshot of the current table
    pub fn current(&self) -> Arc<RoutingTable> {
        Arc::clone(&*self.current.read())
    }

    /// Version of the current table
    pub fn version(&self) -> SystemTime {
        self.current.read().version()
    }

    /// Replace the current table
    pub fn install(&self, table: RoutingTable) {
        // Freeing the old routes happens here, after the lock is released
        drop(self.replace(table));
    }

    /// Swap in `table` and hand back the one it supersedes.
    ///
    /// The write lock covers only the pointer swap.
    pub fn replace(&self, table: RoutingTable) -> Arc<RoutingTable> {
        let table = Arc::new(table);
        std::mem::replace(&mut *self.current.write(), table)
    }
}
