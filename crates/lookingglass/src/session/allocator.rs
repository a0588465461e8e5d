//! Session identifiers and backend ports.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::debug;
use rand::Rng;

pub const SESSION_ID_LEN: usize = 16;
pub const GUEST_TOKEN_LEN: usize = 12;

const ID_ALPHABET: [char; 36] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r',
    's', 't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9',
];

/// Draw a new session id from the process-wide generator.
pub fn generate_session_id() -> String {
    nanoid::nanoid!(SESSION_ID_LEN, &ID_ALPHABET)
}

/// Draw a token naming an ephemeral storage tree.
pub fn generate_guest_token() -> String {
    nanoid::nanoid!(GUEST_TOKEN_LEN, &ID_ALPHABET)
}

/// True if `id` has the shape of a generated session id.
pub fn is_valid_session_id(id: &str) -> bool {
    id.len() == SESSION_ID_LEN && id.chars().all(|c| ID_ALPHABET.contains(&c))
}

struct PortState {
    leased: HashSet<u16>,
    cursor: u32,
}

/// Leases backend ports from a half-open range.
///
/// A port stays leased until [`PortAllocator::release`] is called, which
/// the lifecycle manager does only after teardown has finished.
pub struct PortAllocator {
    start: u16,
    end: u16,
    check_bind: bool,
    state: Mutex<PortState>,
}

impl PortAllocator {
    /// Ports in `start..end`.
    pub fn new(start: u16, end: u16) -> Self {
        let span = u32::from(end.saturating_sub(start));
        let cursor = if span == 0 {
            0
        } else {
            rand::rng().random_range(0..span)
        };
        Self {
            start,
            end,
            check_bind: true,
            state: Mutex::new(PortState {
                leased: HashSet::new(),
                cursor,
            }),
        }
    }

    /// Skip the loopback bind check.
    pub fn without_bind_check(mut self) -> Self {
        self.check_bind = false;
        self
    }

    pub fn capacity(&self) -> usize {
        usize::from(self.end.saturating_sub(self.start))
    }

    pub fn leased(&self) -> usize {
        self.lock().leased.len()
    }

    pub fn is_leased(&self, port: u16) -> bool {
        self.lock().leased.contains(&port)
    }

    /// Lease the next free port, or `None` if the range is exhausted.
    pub fn allocate(&self) -> Option<u16> {
        let span = u32::from(self.end.saturating_sub(self.start));
        let mut state = self.lock();

        for _ in 0..span {
            let offset = state.cursor;
            state.cursor = (state.cursor + 1) % span;

            let Ok(port) = u16::try_from(u32::from(self.start) + offset) else {
                continue;
            };
            if state.leased.contains(&port) {
                continue;
            }
            if self.check_bind && !port_is_free(port) {
                debug!("Port {} is in use outside the allocator, skipping", port);
                continue;
            }

            state.leased.insert(port);
            return Some(port);
        }
        None
    }

    /// Return a port to the pool.
    pub fn release(&self, port: u16) {
        self.lock().leased.remove(&port);
    }

    fn lock(&self) -> MutexGuard<'_, PortState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn port_is_free(port: u16) -> bool {
    TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_shape() {
        let id = generate_session_id();
        assert!(is_valid_session_id(&id), "unexpected id {id}");
        assert_ne!(id, generate_session_id());
        assert!(!is_valid_session_id("ABCDEFGHIJKLMNOP"));
        assert!(!is_valid_session_id("short"));
    }

    #[test]
    fn test_guest_token_shape() {
        let token = generate_guest_token();
        assert_eq!(token.len(), GUEST_TOKEN_LEN);
        assert!(token.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_ports_unique_until_exhausted() {
        let ports = PortAllocator::new(20000, 20004).without_bind_check();
        let mut seen = HashSet::new();
        for _ in 0..4 {
            let port = ports.allocate().unwrap();
            assert!((20000..20004).contains(&port));
            assert!(seen.insert(port));
        }
        assert_eq!(ports.allocate(), None);
        assert_eq!(ports.leased(), 4);
    }

    #[test]
    fn test_released_port_is_reusable() {
        let ports = PortAllocator::new(20010, 20011).without_bind_check();
        let port = ports.allocate().unwrap();
        assert_eq!(ports.allocate(), None);

        ports.release(port);
        assert!(!ports.is_leased(port));
        assert_eq!(ports.allocate(), Some(port));
    }

    #[test]
    fn test_empty_range() {
        let ports = PortAllocator::new(20020, 20020);
        assert_eq!(ports.capacity(), 0);
        assert_eq!(ports.allocate(), None);
    }

    #[test]
    fn test_bind_check_skips_bound_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let busy = listener.local_addr().unwrap().port();

        let ports = PortAllocator::new(busy, busy.saturating_add(1));
        assert_eq!(ports.allocate(), None);
    }
}
