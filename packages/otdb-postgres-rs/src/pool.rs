use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use postgres::{Client, NoTls};
use tracing::{debug, info};

use otdb_core::{Error, Result};

use crate::storage_debug;

struct PoolState {
    idle: Vec<Client>,
    // Connections handed out or idle, including ones being opened.
    open: usize,
    closed: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStatus {
    pub max_size: usize,
    pub open: usize,
    pub idle: usize,
    pub closed: bool,
}

/// Bounded pool of synchronous PostgreSQL connections, opened lazily.
///
/// A connection is borrowed for exactly one backend operation and returned when the
/// [`PooledClient`] guard drops, on success and error paths alike.
pub struct PgPool {
    config: postgres::Config,
    max_size: usize,
    acquire_timeout: Option<Duration>,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl PgPool {
    pub fn new(url: &str, max_size: usize, acquire_timeout: Option<Duration>) -> Result<Self> {
        if max_size == 0 {
            return Err(Error::InvalidOperation("pool size must be at least 1".into()));
        }
        let config: postgres::Config = url.parse().map_err(storage_debug)?;
        Ok(Self {
            config,
            max_size,
            acquire_timeout,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                open: 0,
                closed: false,
            }),
            available: Condvar::new(),
        })
    }

    /// Borrow a connection, waiting for one to be returned when the pool is at capacity.
    pub fn get(&self) -> Result<PooledClient<'_>> {
        let deadline = self.acquire_timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(Error::AlreadyClosed);
            }
            while let Some(client) = state.idle.pop() {
                if client.is_closed() {
                    state.open -= 1;
                    continue;
                }
                return Ok(PooledClient::new(self, client));
            }
            if state.open < self.max_size {
                state.open += 1;
                drop(state);
                return match self.config.connect(NoTls) {
                    Ok(client) => {
                        debug!(max_size = self.max_size, "opened pooled connection");
                        Ok(PooledClient::new(self, client))
                    }
                    Err(e) => {
                        self.state.lock().open -= 1;
                        self.available.notify_one();
                        Err(storage_debug(e))
                    }
                };
            }
            match deadline {
                None => self.available.wait(&mut state),
                Some(deadline) => {
                    if self.available.wait_until(&mut state, deadline).timed_out() {
                        return Err(Error::Storage(
                            "timed out waiting for a pooled connection".into(),
                        ));
                    }
                }
            }
        }
    }

    /// Drop idle connections and refuse further borrows. Borrowed connections are closed as
    /// they come back.
    pub fn close(&self) {
        let idle = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let idle = std::mem::take(&mut state.idle);
            state.open -= idle.len();
            idle
        };
        self.available.notify_all();
        info!(released = idle.len(), "closed connection pool");
        drop(idle);
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.state.lock();
        PoolStatus {
            max_size: self.max_size,
            open: state.open,
            idle: state.idle.len(),
            closed: state.closed,
        }
    }

    fn put_back(&self, client: Client, broken: bool) {
        let discarded = {
            let mut state = self.state.lock();
            if state.closed || broken || client.is_closed() {
                state.open -= 1;
                Some(client)
            } else {
                state.idle.push(client);
                None
            }
        };
        self.available.notify_one();
        drop(discarded);
    }
}

/// A connection borrowed from [`PgPool`].
pub struct PooledClient<'a> {
    pool: &'a PgPool,
    client: Option<Client>,
    broken: bool,
}

impl<'a> PooledClient<'a> {
    fn new(pool: &'a PgPool, client: Client) -> Self {
        Self {
            pool,
            client: Some(client),
            broken: false,
        }
    }

    /// Close the connection instead of returning it to the pool.
    pub fn discard(&mut self) {
        self.broken = true;
    }
}

impl Deref for PooledClient<'_> {
    type Target = Client;

    fn deref(&self) -> &Client {
        self.client.as_ref().expect("pooled client used after release")
    }
}

impl DerefMut for PooledClient<'_> {
    fn deref_mut(&mut self) -> &mut Client {
        self.client.as_mut().expect("pooled client used after release")
    }
}

impl Drop for PooledClient<'_> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.pool.put_back(client, self.broken);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_capacity() {
        assert!(matches!(
            PgPool::new("postgres://localhost/ot", 0, None),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[test]
    fn rejects_unparseable_url() {
        assert!(matches!(
            PgPool::new("postgres://localhost:notaport/ot", 1, None),
            Err(Error::Storage(_))
        ));
    }

    #[test]
    fn closed_pool_refuses_borrows_without_connecting() {
        let pool = PgPool::new("postgres://localhost/ot", 2, None).unwrap();
        pool.close();
        pool.close();
        assert!(matches!(pool.get(), Err(Error::AlreadyClosed)));
        assert_eq!(
            pool.status(),
            PoolStatus {
                max_size: 2,
                open: 0,
                idle: 0,
                closed: true
            }
        );
    }

    #[test]
    fn failed_connect_releases_its_slot() {
        // Port 1 on loopback refuses connections.
        let pool = PgPool::new(
            "host=127.0.0.1 port=1 user=ot dbname=ot connect_timeout=1",
            1,
            Some(Duration::from_millis(50)),
        )
        .unwrap();
        assert!(matches!(pool.get(), Err(Error::Storage(_))));
        assert!(matches!(pool.get(), Err(Error::Storage(_))));
        assert_eq!(pool.status().open, 0);
    }
}
