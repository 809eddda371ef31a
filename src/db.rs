//! Credential verification backed by a bounded connection pool.
//!
//! Workers borrow a backend connection for the duration of one check. The
//! pool hands out at most `size` connections; a borrower waits a bounded time
//! for one to come back and gives up with `PoolError::Timeout`.

use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::{PoolError, PoolResult};

/// Checks a username/password pair, registering the user when `is_login`
/// is false.
pub trait UserVerifier: Send + Sync {
    fn verify(&self, name: &str, password: &str, is_login: bool) -> bool;
}

/// One connection to the user store.
pub trait UserBackend: Send {
    /// Stored password for `name`, if the user exists.
    fn password_of(&mut self, name: &str) -> PoolResult<Option<String>>;

    fn insert_user(&mut self, name: &str, password: &str) -> PoolResult<()>;
}

impl<B: UserBackend + ?Sized> UserBackend for Box<B> {
    fn password_of(&mut self, name: &str) -> PoolResult<Option<String>> {
        (**self).password_of(name)
    }

    fn insert_user(&mut self, name: &str, password: &str) -> PoolResult<()> {
        (**self).insert_user(name, password)
    }
}

struct PoolState<C> {
    idle: VecDeque<C>,
    closed: bool,
}

/// A fixed set of connections shared between worker threads.
pub struct ConnPool<C> {
    state: Mutex<PoolState<C>>,
    available: Condvar,
    size: usize,
    wait: Duration,
}

impl<C> ConnPool<C> {
    /// Creates a pool owning `conns`; borrowers wait at most `wait`.
    pub fn new(conns: Vec<C>, wait: Duration) -> Self {
        let size = conns.len();
        Self {
            state: Mutex::new(PoolState {
                idle: conns.into(),
                closed: false,
            }),
            available: Condvar::new(),
            size,
            wait,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Connections currently not borrowed.
    pub fn free_count(&self) -> usize {
        self.lock().map(|state| state.idle.len()).unwrap_or(0)
    }

    /// Borrows a connection, returned to the pool when the guard drops.
    ///
    /// # Errors
    /// `Timeout` if none comes back within the wait bound, `Closed` after
    /// `close`.
    pub fn get(&self) -> PoolResult<PooledConn<'_, C>> {
        let state = self.lock()?;
        let (mut state, res) = self
            .available
            .wait_timeout_while(state, self.wait, |s| s.idle.is_empty() && !s.closed)
            .map_err(|_| PoolError::LockPoisoned)?;

        if state.closed {
            return Err(PoolError::Closed);
        }
        match state.idle.pop_front() {
            Some(conn) => {
                log::debug!("borrowed pooled connection, {} left", state.idle.len());
                Ok(PooledConn {
                    conn: Some(conn),
                    pool: self,
                })
            }
            None => {
                debug_assert!(res.timed_out());
                log::warn!("connection pool busy");
                Err(PoolError::Timeout)
            }
        }
    }

    /// Drops every idle connection and fails all future borrows.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed = true;
        state.idle.clear();
        drop(state);
        self.available.notify_all();
    }

    fn lock(&self) -> PoolResult<MutexGuard<'_, PoolState<C>>> {
        self.state.lock().map_err(|_| PoolError::LockPoisoned)
    }

    fn put_back(&self, conn: C) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return;
        }
        state.idle.push_back(conn);
        drop(state);
        self.available.notify_one();
    }
}

/// A borrowed connection; goes back to its pool on drop.
pub struct PooledConn<'a, C> {
    conn: Option<C>,
    pool: &'a ConnPool<C>,
}

impl<C> Deref for PooledConn<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.conn.as_ref().expect("pooled connection already returned")
    }
}

impl<C> DerefMut for PooledConn<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().expect("pooled connection already returned")
    }
}

impl<C> Drop for PooledConn<'_, C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put_back(conn);
        }
    }
}

/// Login checks the stored password; registration succeeds only for a new
/// name and stores it.
pub fn verify_user<C: UserBackend>(
    pool: &ConnPool<C>,
    name: &str,
    password: &str,
    is_login: bool,
) -> PoolResult<bool> {
    if name.is_empty() || password.is_empty() {
        return Ok(false);
    }
    log::info!("verify name: {}", name);

    let mut conn = pool.get()?;
    let verified = match conn.password_of(name)? {
        Some(stored) if is_login => stored == password,
        Some(_) => {
            log::debug!("user {} already registered", name);
            false
        }
        None if is_login => false,
        None => {
            conn.insert_user(name, password)?;
            log::debug!("registered {}", name);
            true
        }
    };
    Ok(verified)
}

impl<C: UserBackend> UserVerifier for ConnPool<C> {
    /// Backend and pool failures count as a failed verification.
    fn verify(&self, name: &str, password: &str, is_login: bool) -> bool {
        verify_user(self, name, password, is_login).unwrap_or_else(|e| {
            log::warn!("credential check for {} failed: {}", name, e);
            false
        })
    }
}

/// A user table kept in process memory. Clones share the same table, so a
/// pool of clones behaves like a pool of connections to one store.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    users: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(self, name: &str, password: &str) -> Self {
        self.users
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned(), password.to_owned());
        self
    }

    /// A pool of `size` handles onto this table.
    pub fn pool(&self, size: usize, wait: Duration) -> ConnPool<MemoryBackend> {
        ConnPool::new(vec![self.clone(); size], wait)
    }

    fn table(&self) -> PoolResult<MutexGuard<'_, HashMap<String, String>>> {
        self.users.lock().map_err(|_| PoolError::LockPoisoned)
    }
}

impl UserBackend for MemoryBackend {
    fn password_of(&mut self, name: &str) -> PoolResult<Option<String>> {
        Ok(self.table()?.get(name).cloned())
    }

    fn insert_user(&mut self, name: &str, password: &str) -> PoolResult<()> {
        self.table()?.insert(name.to_owned(), password.to_owned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    /// A backend whose every query fails.
    struct BrokenBackend;

    impl UserBackend for BrokenBackend {
        fn password_of(&mut self, _name: &str) -> PoolResult<Option<String>> {
            Err(PoolError::Backend("connection reset".into()))
        }

        fn insert_user(&mut self, _name: &str, _password: &str) -> PoolResult<()> {
            Err(PoolError::Backend("connection reset".into()))
        }
    }

    #[test]
    fn test_login_and_register() {
        let pool = MemoryBackend::new()
            .with_user("alice", "secret")
            .pool(2, Duration::from_millis(100));

        assert!(pool.verify("alice", "secret", true));
        assert!(!pool.verify("alice", "wrong", true));
        assert!(!pool.verify("bob", "pw", true), "unknown user cannot log in");

        assert!(pool.verify("bob", "pw", false));
        assert!(!pool.verify("bob", "pw", false), "name is taken now");
        assert!(pool.verify("bob", "pw", true));

        assert!(!pool.verify("", "pw", false));
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn test_guard_returns_connection() {
        let pool = MemoryBackend::new().pool(1, Duration::from_millis(20));
        {
            let _conn = pool.get().unwrap();
            assert_eq!(pool.free_count(), 0);
            assert!(matches!(pool.get(), Err(PoolError::Timeout)));
        }
        assert_eq!(pool.free_count(), 1);
        assert!(pool.get().is_ok());
    }

    /// A waiting borrower is woken when another thread returns its handle.
    #[test]
    fn test_waiter_gets_returned_connection() {
        let pool = Arc::new(MemoryBackend::new().pool(1, Duration::from_secs(5)));
        let held = Arc::clone(&pool);
        let (tx, rx) = std::sync::mpsc::channel();

        let holder = thread::spawn(move || {
            let _conn = held.get().unwrap();
            tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(50));
        });
        rx.recv().unwrap();

        let start = Instant::now();
        assert!(pool.get().is_ok());
        assert!(start.elapsed() < Duration::from_secs(5));
        holder.join().unwrap();
    }

    #[test]
    fn test_backend_failure_is_a_failed_verification() {
        let pool: ConnPool<Box<dyn UserBackend>> =
            ConnPool::new(vec![Box::new(BrokenBackend)], Duration::from_millis(10));
        assert!(matches!(
            verify_user(&pool, "a", "b", true),
            Err(PoolError::Backend(_))
        ));
        assert!(!pool.verify("a", "b", true));
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_closed_pool_rejects_borrowers() {
        let pool = MemoryBackend::new().pool(1, Duration::from_millis(10));
        pool.close();
        assert!(matches!(pool.get(), Err(PoolError::Closed)));
        assert!(!pool.verify("a", "b", true));
    }
}
